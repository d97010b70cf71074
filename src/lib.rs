//! Finite-state transitions for records: a transition catalog, a guard that
//! decides whether a change may happen, and executors that apply it to one
//! record or to a batch.

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod memory;
pub mod menu;
pub mod ports;
pub mod state_machine;

pub use engine::TransitionEngine;
pub use error::{FsmError, StoreError, TransitionError};
pub use state_machine::{Decision, StateId, Transition, TransitionCatalog};
