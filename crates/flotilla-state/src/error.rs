//! Error types for the state store.

use thiserror::Error;

/// Result type alias using [`StateError`].
pub type Result<T> = std::result::Result<T, StateError>;

/// Errors raised by state-store operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    /// Node not found.
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Evaluation not found.
    #[error("eval not found: {0}")]
    EvalNotFound(String),

    /// Allocation not found.
    #[error("alloc not found: {0}")]
    AllocNotFound(String),

    /// Periodic launch record not found.
    #[error("periodic launch not found: {0}")]
    LaunchNotFound(String),

    /// A mutation carried an index older than the table has already seen.
    #[error("stale index {index} for table {table}: table is at {current}")]
    StaleIndex {
        /// Table the mutation targeted.
        table: &'static str,
        /// Index supplied by the caller.
        index: u64,
        /// Index the table is at.
        current: u64,
    },
}
