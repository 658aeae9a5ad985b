//! Control-plane services, garbage collection and assembly.
//!
//! This crate ties the state store, evaluation broker and blocked-eval
//! tracker together behind the RPC-surface services:
//!
//! - [`service::NodeService`], [`service::JobService`],
//!   [`service::EvalService`], [`service::AllocService`]: the operations
//!   the API layer exposes, including blocking queries and heartbeats
//! - [`log::LogApplier`]: the seam to the replicated log, with the
//!   single-node [`log::InlineLog`] implementation
//! - [`gc::CoreScheduler`]: the garbage collector run as a pseudo
//!   scheduler over read-only snapshots
//! - [`plane::ControlPlane`]: assembly, leadership transitions and the
//!   leader-only background tasks

pub mod config;
pub mod error;
pub mod gc;
pub mod heartbeat;
pub mod log;
pub mod periodic;
pub mod plane;
pub mod service;
pub mod timetable;

pub use config::{BrokerConfig, ControlConfig, GcConfig, HeartbeatConfig, ServerConfig};
pub use error::{ControlError, ControlResult};
pub use gc::CoreScheduler;
pub use heartbeat::HeartbeatManager;
pub use log::{InlineLog, LogApplier, LogRequest};
pub use periodic::PeriodicDispatcher;
pub use plane::ControlPlane;
pub use service::{AllocService, EvalService, JobService, NodeService};
pub use timetable::TimeTable;
