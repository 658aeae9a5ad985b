//! Control-plane assembly.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use flotilla_broker::{BlockedEvals, EvalBroker};
use flotilla_proto::{
    EvalStatus, JobType, TriggeredBy, CORE_JOB_EVAL_GC, CORE_JOB_JOB_GC, CORE_JOB_NODE_GC,
};
use flotilla_state::StateStore;

use crate::config::ControlConfig;
use crate::error::{ControlError, ControlResult};
use crate::gc::{core_eval, CoreScheduler};
use crate::heartbeat::HeartbeatManager;
use crate::log::{InlineLog, LogApplier, LogRequest};
use crate::periodic::PeriodicDispatcher;
use crate::service::{AllocService, EvalService, JobService, NodeService};
use crate::timetable::TimeTable;

/// Granularity of the time table's witness entries.
const TIME_TABLE_GRANULARITY: Duration = Duration::from_secs(60);
/// Retention of time table entries.
const TIME_TABLE_LIMIT: Duration = Duration::from_secs(72 * 3600);
/// How long background consumers wait per poll before re-checking for
/// shutdown.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Wires the state store, broker, tracker and services into one control
/// plane and owns the leader-only background tasks.
pub struct ControlPlane {
    config: ControlConfig,
    store: Arc<StateStore>,
    broker: Arc<EvalBroker>,
    blocked: Arc<BlockedEvals>,
    heartbeats: Arc<HeartbeatManager>,
    periodic: Arc<PeriodicDispatcher>,
    time_table: Arc<TimeTable>,
    log: Arc<dyn LogApplier>,
    node: Arc<NodeService>,
    job: Arc<JobService>,
    eval: Arc<EvalService>,
    alloc: Arc<AllocService>,
    leader_tasks: Mutex<Option<CancellationToken>>,
}

impl ControlPlane {
    /// Builds a control plane around a fresh store and the in-process
    /// log applier. Everything starts disabled; call
    /// [`ControlPlane::set_leader`] to start serving.
    #[must_use]
    pub fn new(config: ControlConfig) -> Arc<Self> {
        let store = Arc::new(StateStore::new());
        let time_table = Arc::new(TimeTable::new(TIME_TABLE_GRANULARITY, TIME_TABLE_LIMIT));
        let broker = EvalBroker::new(config.broker.visibility_timeout);
        let blocked = BlockedEvals::new(Arc::clone(&broker));
        let heartbeats = Arc::new(HeartbeatManager::new(config.heartbeat.clone()));

        let log: Arc<dyn LogApplier> = Arc::new(InlineLog::new(
            Arc::clone(&store),
            Arc::clone(&broker),
            Arc::clone(&blocked),
            Arc::clone(&time_table),
        ));

        let periodic = PeriodicDispatcher::new(Arc::clone(&store), Arc::clone(&log));

        let node = Arc::new(NodeService::new(
            Arc::clone(&store),
            Arc::clone(&log),
            Arc::clone(&heartbeats),
        ));
        let job = Arc::new(JobService::new(
            Arc::clone(&store),
            Arc::clone(&log),
            Arc::clone(&periodic),
        ));
        let eval = Arc::new(EvalService::new(
            Arc::clone(&store),
            Arc::clone(&log),
            Arc::clone(&broker),
            Arc::clone(&blocked),
        ));
        let alloc = Arc::new(AllocService::new(Arc::clone(&store), Arc::clone(&log)));

        Arc::new(Self {
            config,
            store,
            broker,
            blocked,
            heartbeats,
            periodic,
            time_table,
            log,
            node,
            job,
            eval,
            alloc,
            leader_tasks: Mutex::new(None),
        })
    }

    /// The `Node.*` service.
    #[must_use]
    pub fn nodes(&self) -> &NodeService {
        &self.node
    }

    /// The `Job.*` service.
    #[must_use]
    pub fn jobs(&self) -> &JobService {
        &self.job
    }

    /// The `Eval.*` service.
    #[must_use]
    pub fn evals(&self) -> &EvalService {
        &self.eval
    }

    /// The `Alloc.*` service.
    #[must_use]
    pub fn allocs(&self) -> &AllocService {
        &self.alloc
    }

    /// The state store.
    #[must_use]
    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// The evaluation broker.
    #[must_use]
    pub fn broker(&self) -> &Arc<EvalBroker> {
        &self.broker
    }

    /// The blocked-evaluation tracker.
    #[must_use]
    pub fn blocked(&self) -> &Arc<BlockedEvals> {
        &self.blocked
    }

    /// The periodic dispatcher.
    #[must_use]
    pub fn periodic(&self) -> &Arc<PeriodicDispatcher> {
        &self.periodic
    }

    /// The log applier.
    #[must_use]
    pub fn log(&self) -> &Arc<dyn LogApplier> {
        &self.log
    }

    /// Returns true if the plane currently acts as leader.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.leader_tasks.lock().is_some()
    }

    /// Grants or revokes leadership.
    ///
    /// Gaining leadership enables the broker, tracker, heartbeat manager
    /// and periodic dispatcher, and starts the background consumers.
    /// Losing it cancels the consumers and flushes all leader-local
    /// state.
    pub fn set_leader(self: &Arc<Self>, leader: bool) {
        let mut tasks = self.leader_tasks.lock();
        if leader == tasks.is_some() {
            return;
        }

        if leader {
            self.broker.set_enabled(true);
            self.blocked.set_enabled(true);
            self.heartbeats.set_enabled(true);
            self.periodic.set_enabled(true);

            let cancel = CancellationToken::new();
            tokio::spawn(heartbeat_sweep(Arc::clone(self), cancel.clone()));
            tokio::spawn(duplicate_reaper(Arc::clone(self), cancel.clone()));
            tokio::spawn(gc_emitter(Arc::clone(self), cancel.clone()));
            tokio::spawn(core_worker(Arc::clone(self), cancel.clone()));
            tokio::spawn(stats_emitter(Arc::clone(self), cancel.clone()));
            *tasks = Some(cancel);
            info!("leadership acquired, subsystems enabled");
        } else if let Some(cancel) = tasks.take() {
            cancel.cancel();
            self.periodic.set_enabled(false);
            self.heartbeats.set_enabled(false);
            self.blocked.set_enabled(false);
            self.broker.set_enabled(false);
            info!("leadership lost, subsystems flushed");
        }
    }

    /// Enqueues force-GC evaluations for all three core jobs, collecting
    /// every terminal entity regardless of age.
    pub fn force_gc(&self) -> ControlResult<()> {
        if !self.broker.enabled() {
            return Err(ControlError::NotLeader);
        }
        let snapshot_index = self.latest_index();
        for core_job in [CORE_JOB_EVAL_GC, CORE_JOB_NODE_GC, CORE_JOB_JOB_GC] {
            self.broker
                .enqueue(core_eval(core_job, TriggeredBy::ForceGc, snapshot_index));
        }
        Ok(())
    }

    fn latest_index(&self) -> u64 {
        self.store
            .snapshot()
            .indexes()
            .into_iter()
            .map(|(_, index)| index)
            .max()
            .unwrap_or(0)
    }
}

/// Marks nodes down when their heartbeat TTL expires.
async fn heartbeat_sweep(plane: Arc<ControlPlane>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(plane.config.heartbeat.sweep_interval);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        for node_id in plane.heartbeats.take_expired() {
            plane.node.heartbeat_expired(&node_id).await;
        }
    }
}

/// Cancels duplicate blocked evaluations through the log.
async fn duplicate_reaper(plane: Arc<ControlPlane>, cancel: CancellationToken) {
    loop {
        let duplicates = tokio::select! {
            () = cancel.cancelled() => return,
            duplicates = plane.blocked.get_duplicates(POLL_INTERVAL) => duplicates,
        };

        for mut duplicate in duplicates {
            duplicate.status = EvalStatus::Canceled;
            duplicate.status_description =
                "canceled because the job already had a blocked evaluation".to_owned();
            if let Err(error) = plane
                .log
                .apply(LogRequest::EvalUpdate {
                    evals: vec![duplicate],
                })
                .await
            {
                warn!(%error, "failed to cancel duplicate blocked evaluation");
            }
        }
    }
}

/// Periodically enqueues the core GC evaluations.
async fn gc_emitter(plane: Arc<ControlPlane>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(plane.config.gc.gc_interval);
    // The immediate first tick would GC right at promotion.
    ticker.tick().await;
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let snapshot_index = plane.latest_index();
        for core_job in [CORE_JOB_EVAL_GC, CORE_JOB_NODE_GC, CORE_JOB_JOB_GC] {
            plane
                .broker
                .enqueue(core_eval(core_job, TriggeredBy::PeriodicJob, snapshot_index));
        }
    }
}

/// Periodically logs broker and tracker gauges.
async fn stats_emitter(plane: Arc<ControlPlane>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_secs(10));
    ticker.tick().await;
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let broker = plane.broker.stats();
        let blocked = plane.blocked.stats();
        tracing::debug!(
            ready = broker.total_ready,
            unacked = broker.total_unacked,
            waiting = broker.total_waiting,
            blocked = blocked.total_blocked,
            escaped = blocked.total_escaped,
            "dispatch statistics"
        );
    }
}

/// Dequeues and runs core evaluations against read-only snapshots.
async fn core_worker(plane: Arc<ControlPlane>, cancel: CancellationToken) {
    loop {
        let dispatched = tokio::select! {
            () = cancel.cancelled() => return,
            dispatched = plane.broker.dequeue(&[JobType::Core], POLL_INTERVAL) => dispatched,
        };

        let (eval, token) = match dispatched {
            Ok(Some(dispatched)) => dispatched,
            Ok(None) => continue,
            Err(_) => {
                // Disabled; wait for cancellation.
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }
        };

        let scheduler = CoreScheduler::new(
            plane.store.snapshot(),
            Arc::clone(&plane.log),
            Arc::clone(&plane.time_table),
            plane.config.gc.clone(),
        );
        match scheduler.process(&eval).await {
            Ok(()) => {
                if let Err(error) = plane.broker.ack(&eval.id, &token) {
                    warn!(eval_id = %eval.id, %error, "core eval ack failed");
                }
            }
            Err(error) => {
                warn!(eval_id = %eval.id, %error, "core eval failed");
                if let Err(error) = plane.broker.nack(&eval.id, &token) {
                    warn!(eval_id = %eval.id, %error, "core eval nack failed");
                }
            }
        }
    }
}
