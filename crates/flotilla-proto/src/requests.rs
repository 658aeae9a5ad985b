//! Request and response envelopes for the RPC surface.
//!
//! Writes carry a [`WriteRequest`] naming the region; reads carry
//! [`QueryOptions`] with the blocking-query parameters and receive
//! [`QueryMeta`] describing the consistency of the answer.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{
    AllocId, Allocation, EvalId, Evaluation, Job, JobId, JobType, Node, NodeId, NodeStatus,
};

/// Envelope for state-mutating requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRequest {
    /// Region the request targets.
    pub region: String,
}

/// Envelope for read requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Region the request targets.
    pub region: String,
    /// Block until the table index exceeds this value. Zero returns
    /// immediately with current data.
    pub min_query_index: u64,
    /// Upper bound on how long a blocking query may wait, in
    /// milliseconds. Zero uses the server default.
    pub max_query_time_millis: u64,
}

impl QueryOptions {
    /// Returns the blocking deadline, if the caller requested blocking.
    #[must_use]
    pub const fn max_query_time(&self) -> Duration {
        Duration::from_millis(self.max_query_time_millis)
    }
}

/// Consistency metadata attached to every read response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryMeta {
    /// Index the reading table was at; pass back as `min_query_index` to
    /// long-poll for changes.
    pub index: u64,
    /// True if the answering server held leadership.
    pub known_leader: bool,
    /// Time since the answering server heard from the leader, in
    /// milliseconds.
    pub last_contact_millis: u64,
}

/// Response to a write with no other payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericResponse {
    /// Index assigned to the write.
    pub index: u64,
}

/// `Node.Register` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRegisterRequest {
    /// Node definition reported by the client.
    pub node: Node,
    /// Write envelope.
    pub write: WriteRequest,
}

/// `Node.Deregister` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDeregisterRequest {
    /// Node to remove.
    pub node_id: NodeId,
    /// Write envelope.
    pub write: WriteRequest,
}

/// `Node.UpdateStatus` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUpdateStatusRequest {
    /// Node reporting status.
    pub node_id: NodeId,
    /// New status.
    pub status: NodeStatus,
    /// Write envelope.
    pub write: WriteRequest,
}

/// `Node.UpdateDrain` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUpdateDrainRequest {
    /// Node to change.
    pub node_id: NodeId,
    /// New drain mode.
    pub drain: bool,
    /// Write envelope.
    pub write: WriteRequest,
}

/// `Node.Evaluate` request, forcing re-evaluation of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEvaluateRequest {
    /// Node to re-evaluate.
    pub node_id: NodeId,
    /// Write envelope.
    pub write: WriteRequest,
}

/// Response to node mutations, carrying any evaluations created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUpdateResponse {
    /// TTL the client must heartbeat within; zero when not applicable.
    pub heartbeat_ttl_millis: u64,
    /// Evaluations created by the mutation.
    pub eval_ids: Vec<EvalId>,
    /// Index at which the evaluations were created.
    pub eval_create_index: u64,
    /// Index of the node row after the mutation.
    pub node_modify_index: u64,
    /// Index assigned to the write, or the current table index when the
    /// mutation was a no-op heartbeat.
    pub index: u64,
}

/// Request for a single node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpecificRequest {
    /// Node to fetch.
    pub node_id: NodeId,
    /// Read envelope.
    pub query: QueryOptions,
}

/// `Node.List` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeListRequest {
    /// Restrict results to IDs with this prefix.
    pub prefix: Option<String>,
    /// Read envelope.
    pub query: QueryOptions,
}

/// `Job.Register` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRegisterRequest {
    /// Job definition.
    pub job: Job,
    /// Write envelope.
    pub write: WriteRequest,
}

/// Response to `Job.Register`, `Job.Deregister` and `Job.Evaluate`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRegisterResponse {
    /// Evaluation created for the job, empty for periodic jobs.
    pub eval_id: EvalId,
    /// Index at which the evaluation was created.
    pub eval_create_index: u64,
    /// Index of the job row after the mutation.
    pub job_modify_index: u64,
    /// Index assigned to the write.
    pub index: u64,
}

/// `Job.Deregister` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDeregisterRequest {
    /// Job to remove.
    pub job_id: JobId,
    /// Write envelope.
    pub write: WriteRequest,
}

/// `Job.Evaluate` request, forcing a new evaluation of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvaluateRequest {
    /// Job to re-evaluate.
    pub job_id: JobId,
    /// Write envelope.
    pub write: WriteRequest,
}

/// Request for a single job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpecificRequest {
    /// Job to fetch.
    pub job_id: JobId,
    /// Read envelope.
    pub query: QueryOptions,
}

/// `Job.List` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobListRequest {
    /// Restrict results to IDs with this prefix.
    pub prefix: Option<String>,
    /// Read envelope.
    pub query: QueryOptions,
}

/// `Eval.Dequeue` request issued by scheduler workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalDequeueRequest {
    /// Scheduler types the worker can process.
    pub schedulers: Vec<JobType>,
    /// How long to wait for work, in milliseconds. Zero polls once.
    pub timeout_millis: u64,
    /// Write envelope.
    pub write: WriteRequest,
}

/// Response to `Eval.Dequeue`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalDequeueResponse {
    /// Dispatched evaluation, if any became available in time.
    pub eval: Option<Evaluation>,
    /// Receipt token that must accompany the matching ack or nack.
    pub token: String,
    /// Current evals table index.
    pub index: u64,
}

/// `Eval.Ack` and `Eval.Nack` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalAckRequest {
    /// Evaluation being acknowledged.
    pub eval_id: EvalId,
    /// Receipt token returned by the dequeue.
    pub token: String,
    /// Write envelope.
    pub write: WriteRequest,
}

/// `Eval.Update` request persisting evaluation state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalUpdateRequest {
    /// Evaluations to upsert.
    pub evals: Vec<Evaluation>,
    /// Write envelope.
    pub write: WriteRequest,
}

/// `Eval.Reap` request deleting evaluations and their allocations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalReapRequest {
    /// Evaluations to delete.
    pub evals: Vec<EvalId>,
    /// Allocations to delete.
    pub allocs: Vec<AllocId>,
    /// Write envelope.
    pub write: WriteRequest,
}

/// Request for a single evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalSpecificRequest {
    /// Evaluation to fetch.
    pub eval_id: EvalId,
    /// Read envelope.
    pub query: QueryOptions,
}

/// `Eval.List` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalListRequest {
    /// Restrict results to IDs with this prefix.
    pub prefix: Option<String>,
    /// Read envelope.
    pub query: QueryOptions,
}

/// Request for a single allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocSpecificRequest {
    /// Allocation to fetch.
    pub alloc_id: AllocId,
    /// Read envelope.
    pub query: QueryOptions,
}

/// `Alloc.List` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocListRequest {
    /// Restrict results to IDs with this prefix.
    pub prefix: Option<String>,
    /// Read envelope.
    pub query: QueryOptions,
}

/// `Alloc.UpdateAllocsFromClient` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocClientUpdateRequest {
    /// Allocations with updated client-owned fields.
    pub allocs: Vec<Allocation>,
    /// Write envelope.
    pub write: WriteRequest,
}
