//! Core error model.

use thiserror::Error;

/// Result type used by the vocabulary layer.
pub type CoreResult<T> = Result<T, CoreError>;

/// Vocabulary-level error.
///
/// Keep this focused on deterministic failures (validation, malformed ids,
/// illegal transitions). Storage and transport concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A state transition was attempted that the lifecycle does not allow.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_transition(msg: impl Into<String>) -> Self {
        Self::InvalidTransition(msg.into())
    }
}
