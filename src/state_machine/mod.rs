mod catalog;
mod guard;
mod transition;

pub use catalog::{Group, TransitionCatalog};
pub use guard::{AvailableTransition, Decision, TransitionGuard};
pub use transition::{StateDefinition, StateId, Transition};
