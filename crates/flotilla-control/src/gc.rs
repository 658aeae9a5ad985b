//! Core garbage collection.
//!
//! A pseudo-scheduler addressed by the well-known internal job IDs
//! `eval-gc`, `node-gc` and `job-gc`. Each run receives the triggering
//! evaluation and a read-only snapshot; everything it decides to remove
//! is requested through the log, never written to state directly.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use flotilla_proto::{
    AllocId, EvalId, Evaluation, JobId, TriggeredBy, CORE_JOB_EVAL_GC, CORE_JOB_JOB_GC,
    CORE_JOB_NODE_GC, CORE_JOB_PRIORITY,
};
use flotilla_state::StateSnapshot;

use crate::config::GcConfig;
use crate::error::{ControlError, ControlResult};
use crate::log::{LogApplier, LogRequest};
use crate::timetable::TimeTable;

/// Builds an internal evaluation addressing one of the core GC jobs.
#[must_use]
pub fn core_eval(core_job_id: &str, triggered_by: TriggeredBy, snapshot_index: u64) -> Evaluation {
    Evaluation {
        id: flotilla_proto::generate_id(),
        priority: CORE_JOB_PRIORITY,
        eval_type: flotilla_proto::JobType::Core,
        triggered_by,
        job_id: core_job_id.to_owned(),
        job_modify_index: 0,
        node_id: None,
        node_modify_index: 0,
        status: flotilla_proto::EvalStatus::Pending,
        status_description: String::new(),
        wait_millis: 0,
        next_eval: None,
        previous_eval: None,
        class_eligibility: Default::default(),
        escaped_computed_class: false,
        snapshot_index,
        create_index: 0,
        modify_index: 0,
    }
}

/// Walks a state snapshot to reap terminal entities past their GC age.
pub struct CoreScheduler {
    snapshot: StateSnapshot,
    log: Arc<dyn LogApplier>,
    time_table: Arc<TimeTable>,
    config: GcConfig,
}

impl CoreScheduler {
    /// Creates a scheduler run over the given snapshot.
    #[must_use]
    pub fn new(
        snapshot: StateSnapshot,
        log: Arc<dyn LogApplier>,
        time_table: Arc<TimeTable>,
        config: GcConfig,
    ) -> Self {
        Self {
            snapshot,
            log,
            time_table,
            config,
        }
    }

    /// Runs the GC pass addressed by the evaluation's job ID.
    pub async fn process(&self, eval: &Evaluation) -> ControlResult<()> {
        match eval.job_id.as_str() {
            CORE_JOB_EVAL_GC => self.eval_gc(eval).await,
            CORE_JOB_NODE_GC => self.node_gc(eval).await,
            CORE_JOB_JOB_GC => self.job_gc(eval).await,
            other => Err(ControlError::InvalidRequest(format!(
                "core scheduler cannot handle job {other:?}"
            ))),
        }
    }

    /// Resolves the index threshold for a pass: everything at or below it
    /// is old enough to collect. A force trigger collects regardless of
    /// age.
    fn threshold(&self, eval: &Evaluation, age: std::time::Duration) -> u64 {
        if eval.triggered_by == TriggeredBy::ForceGc {
            return u64::MAX;
        }
        let age = chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::hours(1));
        self.time_table.nearest_index(Utc::now() - age)
    }

    /// Collects terminal evaluations, and their allocations, older than
    /// the eval GC threshold.
    async fn eval_gc(&self, eval: &Evaluation) -> ControlResult<()> {
        let threshold = self.threshold(eval, self.config.eval_gc_threshold);
        debug!(threshold, "eval GC scanning");

        let mut gc_evals: Vec<EvalId> = Vec::new();
        let mut gc_allocs: Vec<AllocId> = Vec::new();
        for candidate in self.snapshot.evals() {
            if let Some(allocs) = self.collectible_eval(&candidate, threshold) {
                gc_evals.push(candidate.id.clone());
                gc_allocs.extend(allocs);
            }
        }

        if gc_evals.is_empty() && gc_allocs.is_empty() {
            return Ok(());
        }
        debug!(
            evals = gc_evals.len(),
            allocs = gc_allocs.len(),
            "eval GC reaping"
        );
        self.reap(gc_evals, gc_allocs).await
    }

    /// Collects down nodes older than the node GC threshold that hold no
    /// allocations.
    async fn node_gc(&self, eval: &Evaluation) -> ControlResult<()> {
        let threshold = self.threshold(eval, self.config.node_gc_threshold);
        debug!(threshold, "node GC scanning");

        let mut gc_nodes: Vec<String> = Vec::new();
        for node in self.snapshot.nodes() {
            if !node.status.is_terminal() || node.modify_index > threshold {
                continue;
            }
            if !self.snapshot.allocs_by_node(&node.id).is_empty() {
                continue;
            }
            gc_nodes.push(node.id.clone());
        }

        if gc_nodes.is_empty() {
            return Ok(());
        }
        debug!(nodes = gc_nodes.len(), "node GC reaping");

        for node_id in gc_nodes {
            self.log
                .apply(LogRequest::NodeDeregister {
                    node_id: node_id.clone(),
                })
                .await
                .map_err(|error| {
                    warn!(node_id = %node_id, %error, "node GC deregister failed");
                    error
                })?;
        }
        Ok(())
    }

    /// Collects dead jobs whose every evaluation (and the evaluations'
    /// allocations) is collectible, then deregisters the jobs.
    async fn job_gc(&self, eval: &Evaluation) -> ControlResult<()> {
        let threshold = self.threshold(eval, self.config.job_gc_threshold);
        debug!(threshold, "job GC scanning");

        let mut gc_evals: Vec<EvalId> = Vec::new();
        let mut gc_allocs: Vec<AllocId> = Vec::new();
        let mut gc_jobs: Vec<JobId> = Vec::new();

        'jobs: for job in self.snapshot.jobs_by_gc(true) {
            if job.create_index > threshold {
                continue;
            }

            let evals = self.snapshot.evals_by_job(&job.id);
            let mut job_evals: Vec<EvalId> = Vec::with_capacity(evals.len());
            let mut job_allocs: Vec<AllocId> = Vec::new();
            for candidate in evals {
                // One lingering evaluation keeps the whole job.
                let Some(allocs) = self.collectible_eval(&candidate, threshold) else {
                    continue 'jobs;
                };
                job_evals.push(candidate.id.clone());
                job_allocs.extend(allocs);
            }

            gc_evals.append(&mut job_evals);
            gc_allocs.append(&mut job_allocs);
            gc_jobs.push(job.id.clone());
        }

        if gc_evals.is_empty() && gc_allocs.is_empty() && gc_jobs.is_empty() {
            return Ok(());
        }
        debug!(
            jobs = gc_jobs.len(),
            evals = gc_evals.len(),
            allocs = gc_allocs.len(),
            "job GC reaping"
        );

        if !gc_evals.is_empty() || !gc_allocs.is_empty() {
            self.reap(gc_evals, gc_allocs).await?;
        }

        for job_id in gc_jobs {
            self.log
                .apply(LogRequest::JobDeregister {
                    job_id: job_id.clone(),
                })
                .await
                .map_err(|error| {
                    warn!(job_id = %job_id, %error, "job GC deregister failed");
                    error
                })?;
        }
        Ok(())
    }

    /// Decides whether an evaluation can be collected under the
    /// threshold. It can iff it is terminal, old enough, and every one of
    /// its allocations is terminal and old enough; the allocation IDs to
    /// remove alongside it are returned.
    fn collectible_eval(&self, eval: &Evaluation, threshold: u64) -> Option<Vec<AllocId>> {
        if !eval.is_terminal() || eval.modify_index > threshold {
            return None;
        }

        let allocs = self.snapshot.allocs_by_eval(&eval.id);
        if allocs
            .iter()
            .any(|a| !a.is_terminal() || a.modify_index > threshold)
        {
            return None;
        }

        Some(allocs.iter().map(|a| a.id.clone()).collect())
    }

    async fn reap(&self, evals: Vec<EvalId>, allocs: Vec<AllocId>) -> ControlResult<()> {
        self.log
            .apply(LogRequest::EvalReap { evals, allocs })
            .await
            .map_err(|error| {
                warn!(%error, "eval reap failed");
                error
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use flotilla_broker::{BlockedEvals, EvalBroker};
    use flotilla_proto::{
        generate_id, AllocClientStatus, AllocDesiredStatus, AllocMetrics, Allocation,
        EvalStatus, Job, JobStatus, JobType, Node, NodeStatus, Resources, Task, TaskGroup,
        UpdateStrategy,
    };
    use flotilla_state::{StateStore, Table};

    use crate::log::InlineLog;

    use super::*;

    struct Harness {
        store: Arc<StateStore>,
        log: Arc<InlineLog>,
        time_table: Arc<TimeTable>,
    }

    fn harness() -> Harness {
        let store = Arc::new(StateStore::new());
        let broker = EvalBroker::new(Duration::from_secs(30));
        broker.set_enabled(true);
        let blocked = BlockedEvals::new(Arc::clone(&broker));
        let time_table = Arc::new(TimeTable::new(
            Duration::from_millis(1),
            Duration::from_secs(72 * 3600),
        ));
        let log = Arc::new(InlineLog::new(
            Arc::clone(&store),
            broker,
            blocked,
            Arc::clone(&time_table),
        ));
        Harness {
            store,
            log,
            time_table,
        }
    }

    impl Harness {
        fn scheduler(&self, config: GcConfig) -> CoreScheduler {
            CoreScheduler::new(
                self.store.snapshot(),
                Arc::clone(&self.log) as Arc<dyn LogApplier>,
                Arc::clone(&self.time_table),
                config,
            )
        }
    }

    fn mk_job(job_type: JobType) -> Job {
        Job {
            id: generate_id(),
            name: "batch-import".to_owned(),
            job_type,
            priority: 50,
            all_at_once: false,
            datacenters: vec!["dc1".to_owned()],
            constraints: Vec::new(),
            task_groups: vec![TaskGroup {
                name: "importers".to_owned(),
                count: 1,
                constraints: Vec::new(),
                tasks: vec![Task {
                    name: "import".to_owned(),
                    driver: "exec".to_owned(),
                    config: BTreeMap::new(),
                    env: BTreeMap::new(),
                    resources: Resources::default(),
                    meta: BTreeMap::new(),
                }],
                meta: BTreeMap::new(),
            }],
            update: UpdateStrategy::default(),
            periodic: None,
            meta: BTreeMap::new(),
            status: JobStatus::Pending,
            create_index: 0,
            modify_index: 0,
            job_modify_index: 0,
        }
    }

    fn mk_terminal_eval(job_id: &str) -> Evaluation {
        let mut eval = core_eval(CORE_JOB_EVAL_GC, TriggeredBy::JobRegister, 0);
        eval.id = generate_id();
        eval.job_id = job_id.to_owned();
        eval.eval_type = JobType::Batch;
        eval.status = EvalStatus::Complete;
        eval
    }

    fn mk_node() -> Node {
        Node {
            id: generate_id(),
            datacenter: "dc1".to_owned(),
            name: "node".to_owned(),
            node_class: "general".to_owned(),
            computed_class: "cls-v1".to_owned(),
            attributes: BTreeMap::new(),
            resources: Resources::default(),
            reserved: Resources::default(),
            status: NodeStatus::Down,
            status_description: String::new(),
            drain: false,
            create_index: 0,
            modify_index: 0,
        }
    }

    fn mk_alloc(job_id: &str, eval_id: &str, node_id: &str, terminal: bool) -> Allocation {
        Allocation {
            id: generate_id(),
            eval_id: eval_id.to_owned(),
            name: "batch-import.importers[0]".to_owned(),
            node_id: node_id.to_owned(),
            job_id: job_id.to_owned(),
            task_group: "importers".to_owned(),
            resources: Resources::default(),
            metrics: AllocMetrics::default(),
            desired_status: AllocDesiredStatus::Run,
            desired_description: String::new(),
            client_status: if terminal {
                AllocClientStatus::Complete
            } else {
                AllocClientStatus::Running
            },
            client_description: String::new(),
            task_states: BTreeMap::new(),
            alloc_modify_index: 0,
            create_index: 0,
            modify_index: 0,
        }
    }

    #[tokio::test]
    async fn force_eval_gc_reaps_terminal_evals_and_allocs() {
        let h = harness();
        let job = mk_job(JobType::Batch);
        let eval = mk_terminal_eval(&job.id);
        let node = mk_node();
        let alloc = mk_alloc(&job.id, &eval.id, &node.id, true);

        h.log
            .apply(LogRequest::JobRegister { job: job.clone() })
            .await
            .unwrap();
        h.log
            .apply(LogRequest::EvalUpdate {
                evals: vec![eval.clone()],
            })
            .await
            .unwrap();
        h.log
            .apply(LogRequest::AllocUpsert {
                allocs: vec![alloc.clone()],
            })
            .await
            .unwrap();

        let sched = h.scheduler(GcConfig::default());
        let trigger = core_eval(CORE_JOB_EVAL_GC, TriggeredBy::ForceGc, 0);
        sched.process(&trigger).await.unwrap();

        let snap = h.store.snapshot();
        assert!(snap.eval_by_id(&eval.id).is_none());
        assert!(snap.alloc_by_id(&alloc.id).is_none());
    }

    #[tokio::test]
    async fn eval_gc_keeps_evals_with_live_allocs() {
        let h = harness();
        let job = mk_job(JobType::Batch);
        let eval = mk_terminal_eval(&job.id);
        let node = mk_node();
        let alloc = mk_alloc(&job.id, &eval.id, &node.id, false);

        h.log
            .apply(LogRequest::JobRegister { job: job.clone() })
            .await
            .unwrap();
        h.log
            .apply(LogRequest::EvalUpdate {
                evals: vec![eval.clone()],
            })
            .await
            .unwrap();
        h.log
            .apply(LogRequest::AllocUpsert {
                allocs: vec![alloc.clone()],
            })
            .await
            .unwrap();

        let sched = h.scheduler(GcConfig::default());
        let trigger = core_eval(CORE_JOB_EVAL_GC, TriggeredBy::ForceGc, 0);
        sched.process(&trigger).await.unwrap();

        // The live allocation protects its evaluation.
        let snap = h.store.snapshot();
        assert!(snap.eval_by_id(&eval.id).is_some());
        assert!(snap.alloc_by_id(&alloc.id).is_some());
    }

    #[tokio::test]
    async fn eval_gc_respects_age_threshold() {
        let h = harness();
        let job = mk_job(JobType::Batch);
        let eval = mk_terminal_eval(&job.id);

        h.log
            .apply(LogRequest::JobRegister { job: job.clone() })
            .await
            .unwrap();
        h.log
            .apply(LogRequest::EvalUpdate {
                evals: vec![eval.clone()],
            })
            .await
            .unwrap();

        // A huge threshold age maps to index zero: nothing is old enough.
        let config = GcConfig {
            eval_gc_threshold: Duration::from_secs(365 * 24 * 3600),
            ..GcConfig::default()
        };
        let sched = h.scheduler(config);
        let trigger = core_eval(CORE_JOB_EVAL_GC, TriggeredBy::PeriodicJob, 0);
        sched.process(&trigger).await.unwrap();
        assert!(h.store.snapshot().eval_by_id(&eval.id).is_some());

        // A zero age maps to the newest witnessed index: the evaluation
        // is old enough.
        let config = GcConfig {
            eval_gc_threshold: Duration::ZERO,
            ..GcConfig::default()
        };
        let sched = h.scheduler(config);
        sched.process(&trigger).await.unwrap();
        assert!(h.store.snapshot().eval_by_id(&eval.id).is_none());
    }

    #[tokio::test]
    async fn node_gc_skips_nodes_with_allocs() {
        let h = harness();
        let job = mk_job(JobType::Batch);
        let eval = mk_terminal_eval(&job.id);
        let occupied = mk_node();
        let empty = mk_node();
        let alloc = mk_alloc(&job.id, &eval.id, &occupied.id, true);

        h.log
            .apply(LogRequest::NodeRegister {
                node: occupied.clone(),
            })
            .await
            .unwrap();
        h.log
            .apply(LogRequest::NodeRegister { node: empty.clone() })
            .await
            .unwrap();
        h.log
            .apply(LogRequest::JobRegister { job: job.clone() })
            .await
            .unwrap();
        h.log
            .apply(LogRequest::EvalUpdate {
                evals: vec![eval.clone()],
            })
            .await
            .unwrap();
        h.log
            .apply(LogRequest::AllocUpsert {
                allocs: vec![alloc],
            })
            .await
            .unwrap();

        let sched = h.scheduler(GcConfig::default());
        let trigger = core_eval(CORE_JOB_NODE_GC, TriggeredBy::ForceGc, 0);
        sched.process(&trigger).await.unwrap();

        let snap = h.store.snapshot();
        assert!(snap.node_by_id(&occupied.id).is_some());
        assert!(snap.node_by_id(&empty.id).is_none());
    }

    #[tokio::test]
    async fn node_gc_skips_ready_nodes() {
        let h = harness();
        let mut node = mk_node();
        node.status = NodeStatus::Ready;

        h.log
            .apply(LogRequest::NodeRegister { node: node.clone() })
            .await
            .unwrap();

        let sched = h.scheduler(GcConfig::default());
        let trigger = core_eval(CORE_JOB_NODE_GC, TriggeredBy::ForceGc, 0);
        sched.process(&trigger).await.unwrap();

        assert!(h.store.snapshot().node_by_id(&node.id).is_some());
    }

    #[tokio::test]
    async fn job_gc_reaps_dead_jobs_with_their_history() {
        let h = harness();
        let job = mk_job(JobType::Batch);
        let eval = mk_terminal_eval(&job.id);
        let node = mk_node();
        let alloc = mk_alloc(&job.id, &eval.id, &node.id, true);

        h.log
            .apply(LogRequest::JobRegister { job: job.clone() })
            .await
            .unwrap();
        h.log
            .apply(LogRequest::EvalUpdate {
                evals: vec![eval.clone()],
            })
            .await
            .unwrap();
        h.log
            .apply(LogRequest::AllocUpsert {
                allocs: vec![alloc.clone()],
            })
            .await
            .unwrap();

        // Terminal eval and terminal alloc settle the job as dead.
        assert_eq!(
            h.store.snapshot().job_by_id(&job.id).unwrap().status,
            JobStatus::Dead
        );

        let sched = h.scheduler(GcConfig::default());
        let trigger = core_eval(CORE_JOB_JOB_GC, TriggeredBy::ForceGc, 0);
        sched.process(&trigger).await.unwrap();

        let snap = h.store.snapshot();
        assert!(snap.job_by_id(&job.id).is_none());
        assert!(snap.eval_by_id(&eval.id).is_none());
        assert!(snap.alloc_by_id(&alloc.id).is_none());
    }

    #[tokio::test]
    async fn job_gc_keeps_jobs_with_pending_evals() {
        let h = harness();
        let job = mk_job(JobType::Batch);
        let mut pending = mk_terminal_eval(&job.id);
        pending.status = EvalStatus::Pending;

        h.log
            .apply(LogRequest::JobRegister { job: job.clone() })
            .await
            .unwrap();
        h.log
            .apply(LogRequest::EvalUpdate {
                evals: vec![pending.clone()],
            })
            .await
            .unwrap();

        let sched = h.scheduler(GcConfig::default());
        let trigger = core_eval(CORE_JOB_JOB_GC, TriggeredBy::ForceGc, 0);
        sched.process(&trigger).await.unwrap();

        assert!(h.store.snapshot().job_by_id(&job.id).is_some());
    }

    #[tokio::test]
    async fn unknown_core_job_is_rejected() {
        let h = harness();
        let sched = h.scheduler(GcConfig::default());
        let trigger = core_eval("compaction", TriggeredBy::ForceGc, 0);
        assert!(sched.process(&trigger).await.is_err());
    }

    #[tokio::test]
    async fn gc_never_writes_outside_the_log() {
        let h = harness();
        let job = mk_job(JobType::Batch);
        let eval = mk_terminal_eval(&job.id);

        h.log
            .apply(LogRequest::JobRegister { job: job.clone() })
            .await
            .unwrap();
        h.log
            .apply(LogRequest::EvalUpdate {
                evals: vec![eval.clone()],
            })
            .await
            .unwrap();

        let before = h.store.index(Table::Evals);
        let sched = h.scheduler(GcConfig::default());
        let trigger = core_eval(CORE_JOB_EVAL_GC, TriggeredBy::ForceGc, 0);
        sched.process(&trigger).await.unwrap();

        // The reap advanced the table through a fresh log index.
        assert!(h.store.index(Table::Evals) > before);
    }
}
