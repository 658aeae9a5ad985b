//! Node registration, status, drain and read operations.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use flotilla_proto::{
    Allocation, EvalId, Evaluation, Node, NodeDeregisterRequest, NodeEvaluateRequest,
    NodeListRequest, NodeRegisterRequest, NodeSpecificRequest, NodeStatus,
    NodeUpdateDrainRequest, NodeUpdateResponse, NodeUpdateStatusRequest, QueryMeta, TriggeredBy,
};
use flotilla_state::{StateError, Table, WatchItem, WatchSet};

use crate::error::ControlResult;
use crate::heartbeat::HeartbeatManager;
use crate::log::{LogApplier, LogRequest};
use crate::service::blocking_query;

/// The `Node.*` RPC surface.
pub struct NodeService {
    store: Arc<flotilla_state::StateStore>,
    log: Arc<dyn LogApplier>,
    heartbeats: Arc<HeartbeatManager>,
}

impl NodeService {
    /// Creates the service.
    #[must_use]
    pub fn new(
        store: Arc<flotilla_state::StateStore>,
        log: Arc<dyn LogApplier>,
        heartbeats: Arc<HeartbeatManager>,
    ) -> Self {
        Self {
            store,
            log,
            heartbeats,
        }
    }

    /// Registers a node, granting it a heartbeat TTL. Registering
    /// directly in the ready state reconciles the fleet against the new
    /// capacity.
    pub async fn register(&self, req: NodeRegisterRequest) -> ControlResult<NodeUpdateResponse> {
        req.node.validate()?;
        let node_id = req.node.id.clone();
        let ready = req.node.status == NodeStatus::Ready;

        let index = self
            .log
            .apply(LogRequest::NodeRegister { node: req.node })
            .await?;
        let ttl = self.heartbeats.reset(&node_id);

        let (eval_ids, eval_create_index) = if ready {
            self.create_node_evals(&node_id, index).await?
        } else {
            (Vec::new(), 0)
        };

        info!(node_id = %node_id, index, "node registered");
        Ok(NodeUpdateResponse {
            heartbeat_ttl_millis: millis(ttl),
            eval_ids,
            eval_create_index,
            node_modify_index: index,
            index,
        })
    }

    /// Removes a node. Allocations left on the node are re-evaluated so
    /// the schedulers can migrate them.
    pub async fn deregister(
        &self,
        req: NodeDeregisterRequest,
    ) -> ControlResult<NodeUpdateResponse> {
        let index = self
            .log
            .apply(LogRequest::NodeDeregister {
                node_id: req.node_id.clone(),
            })
            .await?;
        self.heartbeats.remove(&req.node_id);

        let (eval_ids, eval_create_index) = self.create_node_evals(&req.node_id, index).await?;

        info!(node_id = %req.node_id, index, "node deregistered");
        Ok(NodeUpdateResponse {
            heartbeat_ttl_millis: 0,
            eval_ids,
            eval_create_index,
            node_modify_index: index,
            index,
        })
    }

    /// Updates a node's status.
    ///
    /// An update that does not change the status is a heartbeat: the TTL
    /// advances but no log index is consumed. A transition into `ready`
    /// or `down` re-evaluates the jobs touching the node, including every
    /// registered system job.
    pub async fn update_status(
        &self,
        req: NodeUpdateStatusRequest,
    ) -> ControlResult<NodeUpdateResponse> {
        let node = self
            .store
            .snapshot()
            .node_by_id(&req.node_id)
            .ok_or_else(|| StateError::NodeNotFound(req.node_id.clone()))?;

        let ttl = self.heartbeats.reset(&req.node_id);

        if node.status == req.status {
            debug!(node_id = %req.node_id, "heartbeat without status change");
            return Ok(NodeUpdateResponse {
                heartbeat_ttl_millis: millis(ttl),
                eval_ids: Vec::new(),
                eval_create_index: 0,
                node_modify_index: node.modify_index,
                index: self.store.index(Table::Nodes),
            });
        }

        let index = self
            .log
            .apply(LogRequest::NodeStatusUpdate {
                node_id: req.node_id.clone(),
                status: req.status,
            })
            .await?;

        let (eval_ids, eval_create_index) =
            if matches!(req.status, NodeStatus::Ready | NodeStatus::Down) {
                self.create_node_evals(&req.node_id, index).await?
            } else {
                (Vec::new(), 0)
            };

        info!(node_id = %req.node_id, status = ?req.status, index, "node status updated");
        Ok(NodeUpdateResponse {
            heartbeat_ttl_millis: millis(ttl),
            eval_ids,
            eval_create_index,
            node_modify_index: index,
            index,
        })
    }

    /// Updates a node's drain mode. Enabling drain re-evaluates the jobs
    /// on the node so their allocations migrate off.
    pub async fn update_drain(
        &self,
        req: NodeUpdateDrainRequest,
    ) -> ControlResult<NodeUpdateResponse> {
        let index = self
            .log
            .apply(LogRequest::NodeDrainUpdate {
                node_id: req.node_id.clone(),
                drain: req.drain,
            })
            .await?;

        let (eval_ids, eval_create_index) = if req.drain {
            self.create_node_evals(&req.node_id, index).await?
        } else {
            (Vec::new(), 0)
        };

        info!(node_id = %req.node_id, drain = req.drain, index, "node drain updated");
        Ok(NodeUpdateResponse {
            heartbeat_ttl_millis: 0,
            eval_ids,
            eval_create_index,
            node_modify_index: index,
            index,
        })
    }

    /// Forces re-evaluation of every job touching the node.
    pub async fn evaluate(&self, req: NodeEvaluateRequest) -> ControlResult<NodeUpdateResponse> {
        let node = self
            .store
            .snapshot()
            .node_by_id(&req.node_id)
            .ok_or_else(|| StateError::NodeNotFound(req.node_id.clone()))?;

        let (eval_ids, eval_create_index) =
            self.create_node_evals(&req.node_id, node.modify_index).await?;

        Ok(NodeUpdateResponse {
            heartbeat_ttl_millis: 0,
            eval_ids,
            eval_create_index,
            node_modify_index: node.modify_index,
            index: eval_create_index,
        })
    }

    /// Fetches a node, blocking per the query options.
    pub async fn get_node(
        &self,
        req: &NodeSpecificRequest,
    ) -> (Option<Arc<Node>>, QueryMeta) {
        let items: WatchSet = [WatchItem::Node(req.node_id.clone())].into_iter().collect();
        let node_id = req.node_id.clone();
        blocking_query(
            &self.store,
            Table::Nodes,
            items,
            &req.query,
            self.log.known_leader(),
            move |snap| snap.node_by_id(&node_id),
        )
        .await
    }

    /// Fetches the allocations on a node, blocking per the query options.
    pub async fn get_allocs(
        &self,
        req: &NodeSpecificRequest,
    ) -> (Vec<Arc<Allocation>>, QueryMeta) {
        let items: WatchSet = [WatchItem::AllocNode(req.node_id.clone())]
            .into_iter()
            .collect();
        let node_id = req.node_id.clone();
        blocking_query(
            &self.store,
            Table::Allocs,
            items,
            &req.query,
            self.log.known_leader(),
            move |snap| snap.allocs_by_node(&node_id),
        )
        .await
    }

    /// Lists nodes, optionally filtered by ID prefix.
    pub async fn list(&self, req: &NodeListRequest) -> (Vec<Arc<Node>>, QueryMeta) {
        let items: WatchSet = [WatchItem::Table(Table::Nodes)].into_iter().collect();
        let prefix = req.prefix.clone();
        blocking_query(
            &self.store,
            Table::Nodes,
            items,
            &req.query,
            self.log.known_leader(),
            move |snap| match &prefix {
                Some(prefix) => snap.nodes_by_id_prefix(prefix),
                None => snap.nodes(),
            },
        )
        .await
    }

    /// Marks a node down after its heartbeat TTL expired and
    /// re-evaluates the work placed on it.
    pub async fn heartbeat_expired(&self, node_id: &str) {
        let Some(node) = self.store.snapshot().node_by_id(node_id) else {
            return;
        };
        if node.status == NodeStatus::Down {
            return;
        }

        warn!(node_id, "heartbeat expired, marking node down");
        let index = match self
            .log
            .apply(LogRequest::NodeStatusUpdate {
                node_id: node_id.to_owned(),
                status: NodeStatus::Down,
            })
            .await
        {
            Ok(index) => index,
            Err(error) => {
                warn!(node_id, %error, "failed to mark expired node down");
                return;
            }
        };

        if let Err(error) = self.create_node_evals(node_id, index).await {
            warn!(node_id, %error, "failed to create evaluations for expired node");
        }
    }

    /// Creates one node-update evaluation per job touching the node:
    /// every job with an allocation placed on it, plus every registered
    /// system job so system workloads reconcile against capacity changes.
    async fn create_node_evals(
        &self,
        node_id: &str,
        node_modify_index: u64,
    ) -> ControlResult<(Vec<EvalId>, u64)> {
        let snap = self.store.snapshot();

        let mut seen: HashSet<String> = HashSet::new();
        let mut evals: Vec<Evaluation> = Vec::new();

        for alloc in snap.allocs_by_node(node_id) {
            if !seen.insert(alloc.job_id.clone()) {
                continue;
            }
            let Some(job) = snap.job_by_id(&alloc.job_id) else {
                continue;
            };
            evals.push(node_eval(&job, node_id, node_modify_index));
        }

        for job in snap.jobs_by_type(flotilla_proto::JobType::System) {
            if !seen.insert(job.id.clone()) {
                continue;
            }
            evals.push(node_eval(&job, node_id, node_modify_index));
        }

        if evals.is_empty() {
            return Ok((Vec::new(), 0));
        }

        let eval_ids: Vec<EvalId> = evals.iter().map(|e| e.id.clone()).collect();
        let index = self.log.apply(LogRequest::EvalUpdate { evals }).await?;
        Ok((eval_ids, index))
    }
}

fn node_eval(job: &flotilla_proto::Job, node_id: &str, node_modify_index: u64) -> Evaluation {
    let mut eval = Evaluation::for_job(job, TriggeredBy::NodeUpdate);
    eval.node_id = Some(node_id.to_owned());
    eval.node_modify_index = node_modify_index;
    eval
}

fn millis(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
