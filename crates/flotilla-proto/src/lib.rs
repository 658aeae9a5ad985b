//! Shared entity model and RPC envelopes for the flotilla control plane.
//!
//! This crate defines the entities the control plane stores and schedules:
//!
//! - **Nodes**: worker machines that report capacity and run allocations
//! - **Jobs**: workload definitions submitted by clients
//! - **Evaluations**: intents to (re)schedule a job, dispatched to workers
//! - **Allocations**: placement decisions binding a task group to a node
//!
//! It also carries the request/response envelopes for the RPC surface and
//! the validation performed before any write transaction opens. All
//! identifiers are opaque UUID strings; every row carries the raft-style
//! `create_index`/`modify_index` pair assigned by the log layer.

pub mod error;
pub mod requests;
pub mod types;

pub use error::ValidationError;
pub use requests::{
    AllocClientUpdateRequest, AllocListRequest, AllocSpecificRequest, EvalAckRequest,
    EvalDequeueRequest, EvalDequeueResponse, EvalListRequest, EvalReapRequest,
    EvalSpecificRequest, EvalUpdateRequest, GenericResponse, JobDeregisterRequest,
    JobEvaluateRequest, JobListRequest, JobRegisterRequest, JobRegisterResponse,
    JobSpecificRequest, NodeDeregisterRequest, NodeEvaluateRequest, NodeListRequest,
    NodeRegisterRequest, NodeSpecificRequest, NodeUpdateDrainRequest, NodeUpdateResponse,
    NodeUpdateStatusRequest, QueryMeta, QueryOptions, WriteRequest,
};
pub use types::{
    generate_id, AllocClientStatus, AllocDesiredStatus, AllocId, AllocMetrics, Allocation,
    Constraint, EvalId, EvalStatus, Evaluation, Job, JobId, JobStatus, JobType, NetworkResource,
    Node, NodeId, NodeStatus, PeriodicConfig, PeriodicLaunch, Resources, Task, TaskEvent,
    TaskGroup, TaskLifecycle, TaskState, TriggeredBy, UpdateStrategy, CORE_JOB_EVAL_GC,
    CORE_JOB_JOB_GC, CORE_JOB_NODE_GC, CORE_JOB_PRIORITY,
};
