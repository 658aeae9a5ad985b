//! In-memory transactional state store for the flotilla control plane.
//!
//! The store is the authority on all control-plane entities. It provides:
//!
//! - **Copy-on-write tables**: one writer at a time publishes a new
//!   immutable table set; readers and snapshots hold the previous set and
//!   are never blocked by writers (nor do they block writers)
//! - **Secondary indexes**: foreign-key adjacency (evals by job, allocs by
//!   job/eval/node) maintained transactionally, plus ordered prefix scans
//! - **Watch semantics**: every commit fires edge-triggered notifications
//!   for the touched watch items, after the new table set is visible
//! - **Snapshots**: O(1) point-in-time views used by schedulers and the
//!   garbage collector
//!
//! Every row returned by a read is behind an [`std::sync::Arc`] and must
//! be treated as immutable; all mutations flow through store operations
//! carrying the log-assigned index.

pub mod error;
pub mod store;
pub mod watch;

mod tables;

pub use error::{Result, StateError};
pub use store::{StateRestore, StateSnapshot, StateStore};
pub use watch::{Table, WatchHub, WatchItem, WatchSet};
