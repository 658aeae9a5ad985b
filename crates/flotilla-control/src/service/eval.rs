//! Evaluation dispatch and lifecycle operations.

use std::sync::Arc;
use std::time::Duration;

use flotilla_broker::{BlockedEvals, EvalBroker};
use flotilla_proto::{
    EvalAckRequest, EvalDequeueRequest, EvalDequeueResponse, EvalListRequest, EvalReapRequest,
    EvalSpecificRequest, EvalUpdateRequest, Evaluation, GenericResponse, QueryMeta,
};
use flotilla_state::{Table, WatchItem, WatchSet};

use crate::error::{ControlError, ControlResult};
use crate::log::{LogApplier, LogRequest};
use crate::service::blocking_query;

/// The `Eval.*` RPC surface.
pub struct EvalService {
    store: Arc<flotilla_state::StateStore>,
    log: Arc<dyn LogApplier>,
    broker: Arc<EvalBroker>,
    blocked: Arc<BlockedEvals>,
}

impl EvalService {
    /// Creates the service.
    #[must_use]
    pub fn new(
        store: Arc<flotilla_state::StateStore>,
        log: Arc<dyn LogApplier>,
        broker: Arc<EvalBroker>,
        blocked: Arc<BlockedEvals>,
    ) -> Self {
        Self {
            store,
            log,
            broker,
            blocked,
        }
    }

    /// Hands the highest-priority pending evaluation to a scheduler
    /// worker, blocking up to the requested timeout.
    pub async fn dequeue(&self, req: EvalDequeueRequest) -> ControlResult<EvalDequeueResponse> {
        if req.schedulers.is_empty() {
            return Err(ControlError::InvalidRequest(
                "dequeue requires at least one scheduler type".to_owned(),
            ));
        }

        let timeout = Duration::from_millis(req.timeout_millis);
        let dispatched = self.broker.dequeue(&req.schedulers, timeout).await?;

        let (eval, token) = match dispatched {
            Some((eval, token)) => (Some(eval), token),
            None => (None, String::new()),
        };
        Ok(EvalDequeueResponse {
            eval,
            token,
            index: self.store.index(Table::Evals),
        })
    }

    /// Acknowledges a dispatched evaluation.
    pub async fn ack(&self, req: EvalAckRequest) -> ControlResult<GenericResponse> {
        self.broker.ack(&req.eval_id, &req.token)?;
        Ok(GenericResponse {
            index: self.store.index(Table::Evals),
        })
    }

    /// Rejects a dispatched evaluation, returning it to the queue.
    pub async fn nack(&self, req: EvalAckRequest) -> ControlResult<GenericResponse> {
        self.broker.nack(&req.eval_id, &req.token)?;
        Ok(GenericResponse {
            index: self.store.index(Table::Evals),
        })
    }

    /// Persists evaluation state reported by a scheduler worker. Pending
    /// evaluations re-enter the broker; blocked ones move to the tracker.
    pub async fn update(&self, req: EvalUpdateRequest) -> ControlResult<GenericResponse> {
        for eval in &req.evals {
            eval.validate()?;
        }
        let index = self
            .log
            .apply(LogRequest::EvalUpdate { evals: req.evals })
            .await?;
        Ok(GenericResponse { index })
    }

    /// Deletes evaluations and their allocations.
    pub async fn reap(&self, req: EvalReapRequest) -> ControlResult<GenericResponse> {
        let index = self
            .log
            .apply(LogRequest::EvalReap {
                evals: req.evals,
                allocs: req.allocs,
            })
            .await?;
        Ok(GenericResponse { index })
    }

    /// Fetches an evaluation, blocking per the query options.
    pub async fn get_eval(
        &self,
        req: &EvalSpecificRequest,
    ) -> (Option<Arc<Evaluation>>, QueryMeta) {
        let items: WatchSet = [WatchItem::Eval(req.eval_id.clone())].into_iter().collect();
        let eval_id = req.eval_id.clone();
        blocking_query(
            &self.store,
            Table::Evals,
            items,
            &req.query,
            self.log.known_leader(),
            move |snap| snap.eval_by_id(&eval_id),
        )
        .await
    }

    /// Lists evaluations, optionally filtered by ID prefix.
    pub async fn list(&self, req: &EvalListRequest) -> (Vec<Arc<Evaluation>>, QueryMeta) {
        let items: WatchSet = [WatchItem::Table(Table::Evals)].into_iter().collect();
        let prefix = req.prefix.clone();
        blocking_query(
            &self.store,
            Table::Evals,
            items,
            &req.query,
            self.log.known_leader(),
            move |snap| match &prefix {
                Some(prefix) => snap.evals_by_id_prefix(prefix),
                None => snap.evals(),
            },
        )
        .await
    }

    /// Returns duplicate blocked evaluations, waiting up to `timeout`
    /// for one to arrive.
    pub async fn duplicates(&self, timeout: Duration) -> Vec<Evaluation> {
        self.blocked.get_duplicates(timeout).await
    }
}
