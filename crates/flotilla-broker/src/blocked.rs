//! Tracker for evaluations blocked on cluster capacity.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use flotilla_proto::{EvalId, Evaluation, JobId};

use crate::broker::EvalBroker;

/// Buffer for the capacity-change channel. Sized generously so the
/// log-apply path never blocks behind the unblock worker.
const CAPACITY_CHANGE_BUFFER: usize = 4096;

/// Tracks evaluations that produced failed placements and should not be
/// re-queued until suitable capacity appears.
///
/// Blocked evaluations split into two sets. *Captured* evaluations have
/// constraints fully expressed by computed node classes and wake only
/// when a class they have not proven infeasible changes. *Escaped*
/// evaluations referenced attributes outside the fingerprint and wake on
/// any capacity change. At most one blocked evaluation is held per job;
/// later arrivals are collected as duplicates for cancellation.
#[derive(Debug)]
pub struct BlockedEvals {
    broker: Arc<EvalBroker>,
    inner: RwLock<Inner>,
    duplicate_notify: Notify,
}

#[derive(Debug, Default)]
struct Inner {
    enabled: bool,
    captured: HashMap<EvalId, Evaluation>,
    escaped: HashMap<EvalId, Evaluation>,
    /// Jobs with a blocked evaluation, for duplicate suppression.
    jobs: HashSet<JobId>,
    /// Evaluations rejected by duplicate suppression, awaiting
    /// cancellation.
    duplicates: Vec<Evaluation>,
    stats: BlockedStats,
    capacity_tx: Option<mpsc::Sender<String>>,
    watcher_cancel: Option<CancellationToken>,
}

/// Point-in-time tracker statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockedStats {
    /// Total evaluations currently blocked.
    pub total_blocked: usize,
    /// Blocked evaluations that escaped computed node classes.
    pub total_escaped: usize,
}

impl BlockedEvals {
    /// Creates a disabled tracker that re-queues unblocked evaluations
    /// into the given broker.
    #[must_use]
    pub fn new(broker: Arc<EvalBroker>) -> Arc<Self> {
        Arc::new(Self {
            broker,
            inner: RwLock::new(Inner::default()),
            duplicate_notify: Notify::new(),
        })
    }

    /// Returns true if the tracker accepts work.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.inner.read().enabled
    }

    /// Enables or disables the tracker. Enabling starts the capacity
    /// watcher task; disabling stops it and flushes all state.
    pub fn set_enabled(self: &Arc<Self>, enabled: bool) {
        {
            let mut inner = self.inner.write();
            if inner.enabled == enabled {
                return;
            }
            inner.enabled = enabled;

            if enabled {
                let (tx, rx) = mpsc::channel(CAPACITY_CHANGE_BUFFER);
                let cancel = CancellationToken::new();
                inner.capacity_tx = Some(tx);
                inner.watcher_cancel = Some(cancel.clone());

                let tracker = Arc::clone(self);
                tokio::spawn(async move {
                    tracker.watch_capacity(rx, cancel).await;
                });
            } else if let Some(cancel) = inner.watcher_cancel.take() {
                cancel.cancel();
                inner.capacity_tx = None;
            }
        }
        if !enabled {
            self.flush();
        }
    }

    /// Tracks a blocked evaluation until a suitable capacity change
    /// re-queues it. A second blocked evaluation for the same job is
    /// recorded as a duplicate instead.
    pub fn block(&self, eval: Evaluation) {
        let mut inner = self.inner.write();
        if !inner.enabled {
            return;
        }

        if inner.jobs.contains(&eval.job_id) {
            // One blocked evaluation per job is enough; running more
            // would produce the same outcome. Park the newcomer for
            // cancellation.
            inner.duplicates.push(eval);
            drop(inner);
            self.duplicate_notify.notify_one();
            return;
        }

        inner.stats.total_blocked += 1;
        inner.jobs.insert(eval.job_id.clone());

        if eval.escaped_computed_class {
            // The job's constraints are not captured by computed node
            // classes, so any capacity change could make it feasible.
            inner.stats.total_escaped += 1;
            inner.escaped.insert(eval.id.clone(), eval);
        } else {
            inner.captured.insert(eval.id.clone(), eval);
        }
    }

    /// Signals that capacity changed for the given computed node class.
    /// The unblock work itself runs on the watcher task.
    pub fn unblock(&self, computed_class: &str) {
        let inner = self.inner.read();
        if !inner.enabled {
            return;
        }
        if let Some(tx) = &inner.capacity_tx {
            if tx.try_send(computed_class.to_owned()).is_err() {
                warn!(computed_class, "capacity change channel full, dropping signal");
            }
        }
    }

    async fn watch_capacity(&self, mut rx: mpsc::Receiver<String>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                received = rx.recv() => match received {
                    Some(computed_class) => self.run_unblock(&computed_class),
                    None => return,
                },
            }
        }
    }

    /// Moves every evaluation that could make progress on the changed
    /// class back into the broker.
    fn run_unblock(&self, computed_class: &str) {
        let unblocked = {
            let mut inner = self.inner.write();
            // A flush may have raced the channel.
            if !inner.enabled {
                return;
            }

            let mut unblocked: Vec<Evaluation> =
                Vec::with_capacity(inner.escaped.len());

            // Escaped evaluations must always be retried: any node could
            // be feasible for them.
            let escaped = std::mem::take(&mut inner.escaped);
            for (_, eval) in escaped {
                inner.jobs.remove(&eval.job_id);
                unblocked.push(eval);
            }

            // Captured evaluations skip only classes they explicitly
            // proved infeasible. A class the evaluation never saw has no
            // data against it and must be retried for correctness.
            let captured = std::mem::take(&mut inner.captured);
            for (id, eval) in captured {
                if eval.class_eligibility.get(computed_class) == Some(&false) {
                    inner.captured.insert(id, eval);
                } else {
                    inner.jobs.remove(&eval.job_id);
                    unblocked.push(eval);
                }
            }

            if !unblocked.is_empty() {
                inner.stats.total_escaped = 0;
                inner.stats.total_blocked -= unblocked.len();
            }
            unblocked
        };

        if !unblocked.is_empty() {
            self.broker.enqueue_all(unblocked);
        }
    }

    /// Returns and clears the accumulated duplicate evaluations,
    /// blocking up to `timeout` for one to arrive. A zero timeout polls
    /// once.
    pub async fn get_duplicates(&self, timeout: Duration) -> Vec<Evaluation> {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        loop {
            let notified = self.duplicate_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.write();
                if !inner.enabled {
                    return Vec::new();
                }
                if !inner.duplicates.is_empty() {
                    return std::mem::take(&mut inner.duplicates);
                }
            }

            let Some(deadline) = deadline else {
                return Vec::new();
            };

            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep_until(deadline) => return Vec::new(),
            }
        }
    }

    /// Clears all tracker state. Called when leadership is lost.
    pub fn flush(&self) {
        let mut inner = self.inner.write();
        inner.captured.clear();
        inner.escaped.clear();
        inner.jobs.clear();
        inner.duplicates.clear();
        inner.stats = BlockedStats::default();
    }

    /// Returns a snapshot of tracker statistics.
    #[must_use]
    pub fn stats(&self) -> BlockedStats {
        self.inner.read().stats
    }
}
