//! Validation errors for submitted entities.

use thiserror::Error;

/// Errors raised when an entity fails validation, before any write
/// transaction opens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field was missing or empty.
    #[error("missing {0}")]
    MissingField(&'static str),

    /// Job priority outside the accepted 1..=100 range.
    #[error("job priority {0} outside 1..=100")]
    InvalidPriority(u32),

    /// A task group at the given position has no name.
    #[error("task group {0} has no name")]
    UnnamedTaskGroup(usize),

    /// The named task group contains no tasks.
    #[error("task group {0:?} has no tasks")]
    EmptyTaskGroup(String),

    /// A periodic schedule expression failed to parse.
    #[error("invalid periodic schedule {expression:?}: {reason}")]
    InvalidSchedule {
        /// The rejected expression.
        expression: String,
        /// Parser detail.
        reason: String,
    },
}
