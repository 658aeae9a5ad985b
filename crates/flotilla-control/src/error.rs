//! Error types for the control plane.

use thiserror::Error;

/// Result type alias using [`ControlError`].
pub type ControlResult<T> = Result<T, ControlError>;

/// Errors that can occur in the control plane.
#[derive(Debug, Error)]
pub enum ControlError {
    /// State-store error, including entity-not-found conditions.
    #[error(transparent)]
    State(#[from] flotilla_state::StateError),

    /// Broker error, including the disabled sentinel used to redirect
    /// callers to the leader.
    #[error(transparent)]
    Broker(#[from] flotilla_broker::BrokerError),

    /// A submitted entity failed validation.
    #[error("validation failed: {0}")]
    Validation(#[from] flotilla_proto::ValidationError),

    /// The request is well-formed but not permitted.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The operation requires leadership this server does not hold.
    #[error("not the leader")]
    NotLeader,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns true if the error indicates the target entity is missing.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        use flotilla_state::StateError;
        matches!(
            self,
            Self::State(
                StateError::NodeNotFound(_)
                    | StateError::JobNotFound(_)
                    | StateError::EvalNotFound(_)
                    | StateError::AllocNotFound(_)
                    | StateError::LaunchNotFound(_)
            )
        )
    }
}
