//! Error types for keystate

use thiserror::Error;

/// Core keystate errors
///
/// Only contract violations are errors. Validation failures are reported
/// as values and listener failures are contained by the notifier.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    // Argument errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    // Typing errors
    #[error("Type mismatch for '{key}': expected {expected}, found {found}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: String,
    },

    // Path errors
    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Index {index} out of range at '{path}' (length {len})")]
    IndexOutOfRange {
        path: String,
        index: usize,
        len: usize,
    },

    #[error("Record {record} has no field '{field}'")]
    NoSuchField { record: String, field: String },

    // Store errors
    #[error("Update of '{key}' lost the race {attempts} times")]
    UpdateContention { key: String, attempts: u32 },
}

impl StateError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        StateError::InvalidArgument(message.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        StateError::InvalidState(message.into())
    }

    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        StateError::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for keystate operations
pub type StateResult<T> = Result<T, StateError>;

/// Reject an empty or blank name
pub fn require_name(name: &str, what: &str) -> StateResult<()> {
    if name.trim().is_empty() {
        return Err(StateError::invalid_argument(format!("{what} must not be empty")));
    }
    Ok(())
}
