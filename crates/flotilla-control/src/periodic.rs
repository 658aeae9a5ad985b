//! Periodic job dispatch.
//!
//! Periodic jobs do not produce an evaluation at registration; the
//! dispatcher emits one on each schedule tick and records the launch in
//! the store. Like the broker, it runs only on the leader and rebuilds
//! its tracking set from the store when leadership is gained.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use flotilla_proto::{
    Evaluation, Job, JobId, PeriodicLaunch, TriggeredBy, ValidationError,
};
use flotilla_state::StateStore;

use crate::error::{ControlError, ControlResult};
use crate::log::{LogApplier, LogRequest};

/// Parses a periodic schedule expression.
pub fn parse_schedule(expression: &str) -> ControlResult<Schedule> {
    Schedule::from_str(expression).map_err(|e| {
        ControlError::Validation(ValidationError::InvalidSchedule {
            expression: expression.to_owned(),
            reason: e.to_string(),
        })
    })
}

#[derive(Debug, Clone)]
struct Tracked {
    job: Job,
    schedule: Schedule,
    next: DateTime<Utc>,
}

/// Emits evaluations for periodic jobs on their schedule.
pub struct PeriodicDispatcher {
    store: Arc<StateStore>,
    log: Arc<dyn LogApplier>,
    inner: Mutex<Inner>,
    update_notify: Notify,
}

struct Inner {
    enabled: bool,
    jobs: HashMap<JobId, Tracked>,
    cancel: Option<CancellationToken>,
}

impl PeriodicDispatcher {
    /// Creates a disabled dispatcher.
    #[must_use]
    pub fn new(store: Arc<StateStore>, log: Arc<dyn LogApplier>) -> Arc<Self> {
        Arc::new(Self {
            store,
            log,
            inner: Mutex::new(Inner {
                enabled: false,
                jobs: HashMap::new(),
                cancel: None,
            }),
            update_notify: Notify::new(),
        })
    }

    /// Returns true if the dispatcher emits evaluations.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.inner.lock().enabled
    }

    /// Enables or disables dispatch. Enabling rebuilds the tracking set
    /// from the store and starts the run loop; disabling stops it and
    /// clears tracking.
    pub fn set_enabled(self: &Arc<Self>, enabled: bool) {
        let mut inner = self.inner.lock();
        if inner.enabled == enabled {
            return;
        }
        inner.enabled = enabled;

        if enabled {
            let snapshot = self.store.snapshot();
            for job in snapshot.jobs_by_periodic(true) {
                let job = (*job).clone();
                if let Err(error) = track(&snapshot, &mut inner, job) {
                    warn!(%error, "skipping periodic job with invalid schedule");
                }
            }

            let cancel = CancellationToken::new();
            inner.cancel = Some(cancel.clone());
            let dispatcher = Arc::clone(self);
            tokio::spawn(async move {
                dispatcher.run(cancel).await;
            });
        } else {
            if let Some(cancel) = inner.cancel.take() {
                cancel.cancel();
            }
            inner.jobs.clear();
        }
    }

    /// Tracks a periodic job. A no-op on followers; the tracking set is
    /// rebuilt when leadership is gained.
    pub fn add(&self, job: Job) -> ControlResult<()> {
        let mut inner = self.inner.lock();
        if !inner.enabled {
            return Ok(());
        }
        track(&self.store.snapshot(), &mut inner, job)?;
        drop(inner);
        self.update_notify.notify_waiters();
        Ok(())
    }

    /// Stops tracking a job.
    pub fn remove(&self, job_id: &str) {
        let mut inner = self.inner.lock();
        inner.jobs.remove(job_id);
        drop(inner);
        self.update_notify.notify_waiters();
    }

    /// Dispatches a tracked periodic job immediately.
    pub async fn force_run(&self, job_id: &str) -> ControlResult<String> {
        let job = {
            let inner = self.inner.lock();
            if !inner.enabled {
                return Err(ControlError::NotLeader);
            }
            inner
                .jobs
                .get(job_id)
                .map(|t| t.job.clone())
                .ok_or_else(|| {
                    ControlError::InvalidRequest(format!("job {job_id:?} is not tracked"))
                })?
        };
        self.dispatch(&job, Utc::now()).await
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let next = {
                let inner = self.inner.lock();
                inner.jobs.values().map(|t| t.next).min()
            };

            let sleep_for = match next {
                Some(at) => (at - Utc::now()).to_std().unwrap_or(Duration::ZERO),
                // Nothing tracked; wake on the next add.
                None => Duration::from_secs(3600),
            };

            tokio::select! {
                () = cancel.cancelled() => return,
                () = self.update_notify.notified() => continue,
                () = tokio::time::sleep(sleep_for) => {}
            }

            let now = Utc::now();
            let due: Vec<Job> = {
                let mut inner = self.inner.lock();
                if !inner.enabled {
                    return;
                }
                let mut due = Vec::new();
                for tracked in inner.jobs.values_mut() {
                    if tracked.next > now {
                        continue;
                    }
                    due.push(tracked.job.clone());
                    // Advance before dispatching so a slow dispatch
                    // cannot double-fire.
                    if let Some(next) = tracked.schedule.after(&now).next() {
                        tracked.next = next;
                    }
                }
                due
            };

            for job in due {
                if let Err(error) = self.dispatch(&job, now).await {
                    warn!(job_id = %job.id, %error, "periodic dispatch failed");
                }
            }
        }
    }

    async fn dispatch(&self, job: &Job, launch: DateTime<Utc>) -> ControlResult<String> {
        let mut eval = Evaluation::for_job(job, TriggeredBy::PeriodicJob);
        eval.job_modify_index = job.job_modify_index;
        let eval_id = eval.id.clone();

        self.log
            .apply(LogRequest::EvalUpdate { evals: vec![eval] })
            .await?;
        self.log
            .apply(LogRequest::PeriodicLaunchUpsert {
                launch: PeriodicLaunch {
                    id: job.id.clone(),
                    launch,
                    create_index: 0,
                    modify_index: 0,
                },
            })
            .await?;

        info!(job_id = %job.id, eval_id = %eval_id, "periodic job dispatched");
        Ok(eval_id)
    }
}

fn track(
    snapshot: &flotilla_state::StateSnapshot,
    inner: &mut Inner,
    job: Job,
) -> ControlResult<()> {
    let Some(periodic) = job.periodic.clone().filter(|p| p.enabled) else {
        return Ok(());
    };
    let schedule = parse_schedule(&periodic.schedule)?;

    // Resume from the recorded launch so a leadership change does not
    // re-fire a schedule that already ran.
    let from = snapshot
        .periodic_launch_by_id(&job.id)
        .map_or_else(Utc::now, |launch| launch.launch.max(Utc::now()));

    let Some(next) = schedule.after(&from).next() else {
        return Ok(());
    };

    inner.jobs.insert(
        job.id.clone(),
        Tracked {
            job,
            schedule,
            next,
        },
    );
    Ok(())
}
