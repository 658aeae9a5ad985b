//! Job registration, deregistration and read operations.

use std::sync::Arc;

use tracing::info;

use flotilla_proto::{
    Allocation, Evaluation, Job, JobDeregisterRequest, JobEvaluateRequest, JobListRequest,
    JobRegisterRequest, JobRegisterResponse, JobSpecificRequest, QueryMeta, TriggeredBy,
};
use flotilla_state::{StateError, Table, WatchItem, WatchSet};

use crate::error::{ControlError, ControlResult};
use crate::log::{LogApplier, LogRequest};
use crate::periodic::{parse_schedule, PeriodicDispatcher};
use crate::service::blocking_query;

/// The `Job.*` RPC surface.
pub struct JobService {
    store: Arc<flotilla_state::StateStore>,
    log: Arc<dyn LogApplier>,
    periodic: Arc<PeriodicDispatcher>,
}

impl JobService {
    /// Creates the service.
    #[must_use]
    pub fn new(
        store: Arc<flotilla_state::StateStore>,
        log: Arc<dyn LogApplier>,
        periodic: Arc<PeriodicDispatcher>,
    ) -> Self {
        Self {
            store,
            log,
            periodic,
        }
    }

    /// Registers or updates a job.
    ///
    /// Non-periodic jobs produce a `job-register` evaluation immediately.
    /// Periodic jobs are handed to the periodic dispatcher instead; their
    /// evaluations are emitted on schedule.
    pub async fn register(&self, req: JobRegisterRequest) -> ControlResult<JobRegisterResponse> {
        req.job.validate()?;
        if let Some(periodic) = &req.job.periodic {
            // Surface a bad schedule before anything is written.
            parse_schedule(&periodic.schedule)?;
        }

        let job = req.job;
        let index = self
            .log
            .apply(LogRequest::JobRegister { job: job.clone() })
            .await?;

        if job.is_periodic() {
            self.periodic.add(job.clone())?;
            info!(job_id = %job.id, index, "periodic job registered");
            return Ok(JobRegisterResponse {
                eval_id: String::new(),
                eval_create_index: 0,
                job_modify_index: index,
                index,
            });
        }

        let mut eval = Evaluation::for_job(&job, TriggeredBy::JobRegister);
        eval.job_modify_index = index;
        let eval_id = eval.id.clone();
        let eval_index = self
            .log
            .apply(LogRequest::EvalUpdate { evals: vec![eval] })
            .await?;

        info!(job_id = %job.id, index, eval_id = %eval_id, "job registered");
        Ok(JobRegisterResponse {
            eval_id,
            eval_create_index: eval_index,
            job_modify_index: index,
            index: eval_index,
        })
    }

    /// Deregisters a job, producing a `job-deregister` evaluation so the
    /// schedulers stop its allocations.
    pub async fn deregister(
        &self,
        req: JobDeregisterRequest,
    ) -> ControlResult<JobRegisterResponse> {
        let job = self
            .store
            .snapshot()
            .job_by_id(&req.job_id)
            .ok_or_else(|| StateError::JobNotFound(req.job_id.clone()))?;

        let index = self
            .log
            .apply(LogRequest::JobDeregister {
                job_id: req.job_id.clone(),
            })
            .await?;

        if job.is_periodic() {
            self.periodic.remove(&req.job_id);
            if self
                .store
                .snapshot()
                .periodic_launch_by_id(&req.job_id)
                .is_some()
            {
                self.log
                    .apply(LogRequest::PeriodicLaunchDelete {
                        job_id: req.job_id.clone(),
                    })
                    .await?;
            }
        }

        let mut eval = Evaluation::for_job(&job, TriggeredBy::JobDeregister);
        eval.job_modify_index = index;
        let eval_id = eval.id.clone();
        let eval_index = self
            .log
            .apply(LogRequest::EvalUpdate { evals: vec![eval] })
            .await?;

        info!(job_id = %req.job_id, index, "job deregistered");
        Ok(JobRegisterResponse {
            eval_id,
            eval_create_index: eval_index,
            job_modify_index: index,
            index: eval_index,
        })
    }

    /// Forces a new evaluation of a registered job.
    pub async fn evaluate(&self, req: JobEvaluateRequest) -> ControlResult<JobRegisterResponse> {
        let job = self
            .store
            .snapshot()
            .job_by_id(&req.job_id)
            .ok_or_else(|| StateError::JobNotFound(req.job_id.clone()))?;

        if job.is_periodic() {
            return Err(ControlError::InvalidRequest(
                "periodic jobs are evaluated on their schedule; use force-run".to_owned(),
            ));
        }

        let mut eval = Evaluation::for_job(&job, TriggeredBy::JobRegister);
        eval.job_modify_index = job.job_modify_index;
        let eval_id = eval.id.clone();
        let eval_index = self
            .log
            .apply(LogRequest::EvalUpdate { evals: vec![eval] })
            .await?;

        Ok(JobRegisterResponse {
            eval_id,
            eval_create_index: eval_index,
            job_modify_index: job.job_modify_index,
            index: eval_index,
        })
    }

    /// Fetches a job, blocking per the query options.
    pub async fn get_job(&self, req: &JobSpecificRequest) -> (Option<Arc<Job>>, QueryMeta) {
        let items: WatchSet = [WatchItem::Job(req.job_id.clone())].into_iter().collect();
        let job_id = req.job_id.clone();
        blocking_query(
            &self.store,
            Table::Jobs,
            items,
            &req.query,
            self.log.known_leader(),
            move |snap| snap.job_by_id(&job_id),
        )
        .await
    }

    /// Lists jobs, optionally filtered by ID prefix.
    pub async fn list(&self, req: &JobListRequest) -> (Vec<Arc<Job>>, QueryMeta) {
        let items: WatchSet = [WatchItem::Table(Table::Jobs)].into_iter().collect();
        let prefix = req.prefix.clone();
        blocking_query(
            &self.store,
            Table::Jobs,
            items,
            &req.query,
            self.log.known_leader(),
            move |snap| match &prefix {
                Some(prefix) => snap.jobs_by_id_prefix(prefix),
                None => snap.jobs(),
            },
        )
        .await
    }

    /// Fetches the allocations of a job, blocking per the query options.
    pub async fn allocations(
        &self,
        req: &JobSpecificRequest,
    ) -> (Vec<Arc<Allocation>>, QueryMeta) {
        let items: WatchSet = [WatchItem::AllocJob(req.job_id.clone())]
            .into_iter()
            .collect();
        let job_id = req.job_id.clone();
        blocking_query(
            &self.store,
            Table::Allocs,
            items,
            &req.query,
            self.log.known_leader(),
            move |snap| snap.allocs_by_job(&job_id),
        )
        .await
    }
}
