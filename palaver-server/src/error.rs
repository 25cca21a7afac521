//! Operation error taxonomy.
//!
//! Every failure is handled at the operation boundary and converted into a
//! single `error{message}` wire event for the initiating connection. Nothing
//! here crosses into the reactor's top level.

use thiserror::Error;

/// Errors produced by chat operations.
///
/// The `Display` text is exactly what the client sees in the `error` event.
#[derive(Debug, Error)]
pub enum OpError {
    /// Empty name/channel/content. Rejected before any persistence call.
    #[error("{0}")]
    Validation(String),

    /// Name already taken, channel already exists. No state change.
    #[error("{0}")]
    Conflict(String),

    /// Channel or recipient missing.
    #[error("{0}")]
    NotFound(String),

    /// Store unreachable or write failed. Logged with the underlying cause;
    /// the client gets an operation-specific message.
    #[error("Failed to {0}")]
    Persistence(String),
}

impl OpError {
    pub fn validation(msg: impl Into<String>) -> Self {
        OpError::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        OpError::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        OpError::NotFound(msg.into())
    }

    /// Wrap a store error. `action` reads as "Failed to {action}".
    pub fn persistence(action: &str, err: rusqlite::Error) -> Self {
        tracing::error!(action, error = %err, "persistence failure");
        OpError::Persistence(action.to_string())
    }
}
