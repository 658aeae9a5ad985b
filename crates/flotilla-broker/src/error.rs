//! Error types for the broker.

use thiserror::Error;

/// Result type alias using [`BrokerError`].
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors raised by broker operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The broker is disabled because this server is not the leader.
    /// Callers should redirect to the leader.
    #[error("eval broker disabled")]
    Disabled,

    /// No outstanding dispatch exists for the evaluation.
    #[error("evaluation is not outstanding: {0}")]
    NotOutstanding(String),

    /// The receipt token does not match the outstanding dispatch.
    #[error("token does not match outstanding dispatch for evaluation {0}")]
    TokenMismatch(String),
}
