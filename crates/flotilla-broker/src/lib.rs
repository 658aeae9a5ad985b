//! Evaluation dispatch for the flotilla control plane.
//!
//! Two cooperating components live here:
//!
//! - [`EvalBroker`]: a priority dispatch queue handing pending
//!   evaluations to scheduler workers, with per-evaluation receipt
//!   tokens, visibility timeouts and at-most-one-outstanding-per-job
//!   fairness
//! - [`BlockedEvals`]: a side tracker holding evaluations whose last
//!   scheduling attempt produced failed placements, re-queuing them into
//!   the broker when relevant cluster capacity changes
//!
//! Both are enabled only while the server holds leadership; disabling
//! flushes all internal state.

pub mod blocked;
pub mod broker;
pub mod error;

pub use blocked::{BlockedEvals, BlockedStats};
pub use broker::{BrokerStats, EvalBroker, SchedulerStats};
pub use error::{BrokerError, Result};
