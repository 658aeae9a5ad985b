//! Seam to the replicated log.
//!
//! Every state mutation flows through a [`LogApplier`], which totally
//! orders requests and assigns monotonically increasing indexes. In a
//! clustered deployment the applier fronts a consensus log; this crate
//! ships [`InlineLog`], the single-node implementation that applies
//! requests straight to the state store and carries the state-machine
//! side effects (queuing pending evaluations, parking blocked ones,
//! signalling capacity changes).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use flotilla_broker::{BlockedEvals, EvalBroker};
use flotilla_proto::{
    AllocId, Allocation, EvalId, Evaluation, Job, JobId, Node, NodeId, NodeStatus, PeriodicLaunch,
};
use flotilla_state::StateStore;

use crate::error::ControlResult;
use crate::timetable::TimeTable;

/// A state-mutating request, totally ordered by the log.
#[derive(Debug, Clone)]
pub enum LogRequest {
    /// Register or update a node.
    NodeRegister {
        /// Node definition.
        node: Node,
    },
    /// Remove a node.
    NodeDeregister {
        /// Node to remove.
        node_id: NodeId,
    },
    /// Update a node's status.
    NodeStatusUpdate {
        /// Node to update.
        node_id: NodeId,
        /// New status.
        status: NodeStatus,
    },
    /// Update a node's drain mode.
    NodeDrainUpdate {
        /// Node to update.
        node_id: NodeId,
        /// New drain mode.
        drain: bool,
    },
    /// Register or update a job.
    JobRegister {
        /// Job definition.
        job: Job,
    },
    /// Remove a job.
    JobDeregister {
        /// Job to remove.
        job_id: JobId,
    },
    /// Upsert evaluations.
    EvalUpdate {
        /// Evaluations to upsert.
        evals: Vec<Evaluation>,
    },
    /// Delete evaluations and their allocations.
    EvalReap {
        /// Evaluations to delete.
        evals: Vec<EvalId>,
        /// Allocations to delete.
        allocs: Vec<AllocId>,
    },
    /// Upsert allocations on the scheduler-authoritative path.
    AllocUpsert {
        /// Allocations to upsert.
        allocs: Vec<Allocation>,
    },
    /// Apply client-reported allocation state.
    AllocClientUpdate {
        /// Allocations with updated client-owned fields.
        allocs: Vec<Allocation>,
    },
    /// Record the dispatch of a periodic job.
    PeriodicLaunchUpsert {
        /// Launch record.
        launch: PeriodicLaunch,
    },
    /// Remove the launch record of a periodic job.
    PeriodicLaunchDelete {
        /// Periodic job whose record is removed.
        job_id: JobId,
    },
}

/// Totally orders state-mutating requests and assigns indexes.
#[async_trait]
pub trait LogApplier: Send + Sync {
    /// Applies a request, returning the index assigned to it.
    async fn apply(&self, request: LogRequest) -> ControlResult<u64>;

    /// Returns true if this applier speaks for the current leader.
    fn known_leader(&self) -> bool;
}

/// Single-node log applier.
///
/// Assigns strictly increasing indexes, applies each request to the
/// state store, witnesses the index in the time table, and performs the
/// state-machine side effects the clustered deployment runs on apply.
pub struct InlineLog {
    store: Arc<StateStore>,
    broker: Arc<EvalBroker>,
    blocked: Arc<BlockedEvals>,
    time_table: Arc<TimeTable>,
    next_index: AtomicU64,
}

impl InlineLog {
    /// Creates an applier starting after the store's highest index.
    #[must_use]
    pub fn new(
        store: Arc<StateStore>,
        broker: Arc<EvalBroker>,
        blocked: Arc<BlockedEvals>,
        time_table: Arc<TimeTable>,
    ) -> Self {
        let latest = store
            .snapshot()
            .indexes()
            .into_iter()
            .map(|(_, index)| index)
            .max()
            .unwrap_or(0);
        Self {
            store,
            broker,
            blocked,
            time_table,
            next_index: AtomicU64::new(latest),
        }
    }
}

#[async_trait]
impl LogApplier for InlineLog {
    async fn apply(&self, request: LogRequest) -> ControlResult<u64> {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst) + 1;

        match request {
            LogRequest::NodeRegister { node } => {
                let computed_class = node.computed_class.clone();
                let ready = node.status == NodeStatus::Ready;
                self.store.upsert_node(index, node)?;
                if ready {
                    // A ready node is new capacity.
                    self.blocked.unblock(&computed_class);
                }
            }
            LogRequest::NodeDeregister { node_id } => {
                self.store.delete_node(index, &node_id)?;
            }
            LogRequest::NodeStatusUpdate { node_id, status } => {
                self.store.update_node_status(index, &node_id, status)?;
                if status == NodeStatus::Ready {
                    if let Some(node) = self.store.snapshot().node_by_id(&node_id) {
                        self.blocked.unblock(&node.computed_class);
                    }
                }
            }
            LogRequest::NodeDrainUpdate { node_id, drain } => {
                self.store.update_node_drain(index, &node_id, drain)?;
            }
            LogRequest::JobRegister { job } => {
                self.store.upsert_job(index, job)?;
            }
            LogRequest::JobDeregister { job_id } => {
                self.store.delete_job(index, &job_id)?;
            }
            LogRequest::EvalUpdate { evals } => {
                self.store.upsert_evals(index, evals.clone())?;
                for eval in evals {
                    if eval.should_enqueue() {
                        self.broker.enqueue(eval);
                    } else if eval.should_block() {
                        self.blocked.block(eval);
                    }
                }
            }
            LogRequest::EvalReap { evals, allocs } => {
                self.store.delete_evals(index, &evals, &allocs)?;
            }
            LogRequest::AllocUpsert { allocs } => {
                self.store.upsert_allocs(index, allocs)?;
            }
            LogRequest::AllocClientUpdate { allocs } => {
                let ids: Vec<AllocId> = allocs.iter().map(|a| a.id.clone()).collect();
                self.store.update_allocs_from_client(index, allocs)?;

                // A terminal allocation frees capacity on its node.
                let snap = self.store.snapshot();
                for id in ids {
                    let Some(alloc) = snap.alloc_by_id(&id) else {
                        continue;
                    };
                    if !alloc.is_terminal() {
                        continue;
                    }
                    if let Some(node) = snap.node_by_id(&alloc.node_id) {
                        self.blocked.unblock(&node.computed_class);
                    }
                }
            }
            LogRequest::PeriodicLaunchUpsert { launch } => {
                self.store.upsert_periodic_launch(index, launch)?;
            }
            LogRequest::PeriodicLaunchDelete { job_id } => {
                self.store.delete_periodic_launch(index, &job_id)?;
            }
        }

        self.time_table.witness(index, Utc::now());
        Ok(index)
    }

    fn known_leader(&self) -> bool {
        true
    }
}
