use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state_machine::StateId;

/// Crate-level error: configuration loading and catalog construction.
#[derive(Debug, Error)]
pub enum FsmError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Duplicate transition from {source_state} to {target_state}")]
    DuplicateTransition {
        source_state: StateId,
        target_state: StateId,
    },

    #[error("Unknown state: {0}")]
    UnknownState(StateId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Everything that can stop a state change.
///
/// `Authorization`, `InvalidTransition` and `TransitionNotAllowed` come out of
/// the guard; the rest are raised by the executors. An attempt to move a record
/// into the state it already has is not an error, see
/// [`Decision::AlreadyChanged`](crate::state_machine::Decision::AlreadyChanged).
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("Access denied.")]
    Authorization { capability: String },

    /// The edge does not exist in the transition graph.
    #[error(
        "You cannot change state from {from} to {to} because such state transition is undefined."
    )]
    InvalidTransition { from: String, to: String },

    /// The edge exists but the record's business rule rejected it.
    #[error(
        "You cannot change state from {from} to {to} because such state transition is not allowed."
    )]
    TransitionNotAllowed { from: String, to: String },

    #[error("All selected records must have the same source state (found: {})", .states.join(", "))]
    AmbiguousSourceState { states: Vec<String> },

    #[error("Validation failed: {0}")]
    Validation(ValidationErrors),

    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),

    /// The executor was handed something other than a confirmed `Proceed`.
    #[error("Decision is not executable: {0}")]
    NotExecutable(String),

    #[error("Transition hook failed: {0}")]
    Hook(String),

    #[error("Record store error: {0}")]
    Store(String),
}

impl TransitionError {
    /// Short machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            TransitionError::Authorization { .. } => "authorization",
            TransitionError::InvalidTransition { .. } => "invalid_transition",
            TransitionError::TransitionNotAllowed { .. } => "transition_not_allowed",
            TransitionError::AmbiguousSourceState { .. } => "ambiguous_source_state",
            TransitionError::Validation(_) => "validation",
            TransitionError::NotImplemented(_) => "not_implemented",
            TransitionError::NotExecutable(_) => "not_executable",
            TransitionError::Hook(_) => "hook",
            TransitionError::Store(_) => "store",
        }
    }
}

/// Errors reported by a [`RecordStore`](crate::ports::RecordStore).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    Validation(ValidationErrors),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Backend(String),
}

impl From<StoreError> for TransitionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Validation(errors) => TransitionError::Validation(errors),
            other => TransitionError::Store(other.to_string()),
        }
    }
}

/// A single rejected attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Attribute errors collected while saving a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationErrors(pub Vec<FieldError>);

impl ValidationErrors {
    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self(vec![FieldError {
            field: field.into(),
            message: message.into(),
        }])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for error in &self.0 {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{}: {}", error.field, error.message)?;
            first = false;
        }
        Ok(())
    }
}
