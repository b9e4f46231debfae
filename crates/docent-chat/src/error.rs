//! Error types for the chat engine.

use docent_core::error::DocentError;

/// Errors from the chat engine.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("message cannot be empty")]
    EmptyMessage,
    #[error("message exceeds maximum length of {0} characters")]
    MessageTooLong(usize),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("invalid transition: cannot {action} while {phase}")]
    InvalidTransition {
        action: &'static str,
        phase: &'static str,
    },
    #[error("generation error: {0}")]
    Generation(String),
    #[error("embedding error: {0}")]
    Embedding(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<DocentError> for ChatError {
    fn from(err: DocentError) -> Self {
        match err {
            DocentError::Generation(msg) => ChatError::Generation(msg),
            DocentError::Embedding(msg) => ChatError::Embedding(msg),
            other => ChatError::Storage(other.to_string()),
        }
    }
}
