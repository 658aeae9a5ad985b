//! Priority dispatch queue for pending evaluations.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use flotilla_proto::{EvalId, Evaluation, JobId, JobType};

use crate::error::{BrokerError, Result};

/// Priority dispatch queue shared among scheduler workers.
///
/// Evaluations are dispatched strictly by priority, FIFO within a
/// priority. At most one evaluation per job is ever in flight: a
/// same-job evaluation enqueued while another is outstanding is held
/// back and promoted when the earlier one is acknowledged. Each dispatch
/// carries a fresh receipt token and a visibility timer; if neither ack
/// nor nack arrives before the timer fires, the dispatch is silently
/// nacked and the evaluation redelivered.
#[derive(Debug)]
pub struct EvalBroker {
    inner: Mutex<Inner>,
    dequeue_notify: Notify,
    visibility_timeout: Duration,
}

#[derive(Debug, Default)]
struct Inner {
    enabled: bool,
    /// Sequence for FIFO ordering within a priority band.
    next_seq: i64,
    /// Decreasing sequence placing nacked evaluations at the head of
    /// their priority band.
    front_seq: i64,
    ready: HashMap<JobType, BinaryHeap<ReadyEval>>,
    unacked: HashMap<EvalId, Unacked>,
    waiting: HashMap<JobId, VecDeque<Evaluation>>,
    /// Jobs with an evaluation in `ready` or `unacked`.
    outstanding: HashMap<JobId, usize>,
    /// Where each known evaluation currently sits; enqueue is idempotent
    /// on evaluation ID.
    locations: HashMap<EvalId, Location>,
    counters: Counters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Ready,
    Unacked,
    Waiting,
}

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    dequeues: u64,
    acks: u64,
    nacks: u64,
    auto_nacks: u64,
}

#[derive(Debug)]
struct ReadyEval {
    priority: u32,
    seq: i64,
    eval: Evaluation,
}

impl PartialEq for ReadyEval {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for ReadyEval {}

impl PartialOrd for ReadyEval {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEval {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then earlier sequence.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
struct Unacked {
    eval: Evaluation,
    token: String,
}

impl EvalBroker {
    /// Creates a disabled broker with the given visibility timeout.
    #[must_use]
    pub fn new(visibility_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            dequeue_notify: Notify::new(),
            visibility_timeout,
        })
    }

    /// Returns true if the broker accepts work.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.inner.lock().enabled
    }

    /// Enables or disables the broker. Only the leader runs enabled;
    /// disabling flushes all state and wakes pending dequeues with an
    /// empty result.
    pub fn set_enabled(&self, enabled: bool) {
        {
            let mut inner = self.inner.lock();
            if inner.enabled == enabled {
                return;
            }
            inner.enabled = enabled;
            if !enabled {
                inner.flush();
            }
        }
        self.dequeue_notify.notify_waiters();
    }

    /// Enqueues an evaluation, honouring its `wait_millis` back-off.
    /// Enqueue is idempotent on evaluation ID and a no-op while the
    /// broker is disabled.
    pub fn enqueue(self: &Arc<Self>, eval: Evaluation) {
        if eval.wait_millis > 0 {
            let broker = Arc::clone(self);
            let delay = Duration::from_millis(eval.wait_millis);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                broker.enqueue_now(eval);
            });
            return;
        }
        self.enqueue_now(eval);
    }

    /// Enqueues a batch of evaluations.
    pub fn enqueue_all(self: &Arc<Self>, evals: Vec<Evaluation>) {
        for eval in evals {
            self.enqueue(eval);
        }
    }

    fn enqueue_now(&self, eval: Evaluation) {
        {
            let mut inner = self.inner.lock();
            if !inner.enabled {
                return;
            }
            if inner.locations.contains_key(&eval.id) {
                return;
            }

            if inner.outstanding.get(&eval.job_id).copied().unwrap_or(0) > 0 {
                // Another evaluation of this job is ready or dispatched;
                // hold this one until that completes.
                inner.locations.insert(eval.id.clone(), Location::Waiting);
                inner
                    .waiting
                    .entry(eval.job_id.clone())
                    .or_default()
                    .push_back(eval);
                return;
            }

            inner.mark_ready(eval, false);
        }
        self.dequeue_notify.notify_waiters();
    }

    /// Blocks up to `timeout` for the highest-priority evaluation whose
    /// type is in `schedulers`. A zero timeout polls once. Returns the
    /// evaluation with a fresh receipt token, or `None` on timeout or
    /// when the broker is disabled mid-wait.
    pub async fn dequeue(
        self: &Arc<Self>,
        schedulers: &[JobType],
        timeout: Duration,
    ) -> Result<Option<(Evaluation, String)>> {
        if !self.enabled() {
            return Err(BrokerError::Disabled);
        }

        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        loop {
            // Register interest before checking so an enqueue racing with
            // the check cannot be missed.
            let notified = self.dequeue_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_dispatch(schedulers) {
                Dispatch::Delivered(eval, token) => return Ok(Some((eval, token))),
                Dispatch::Disabled => return Ok(None),
                Dispatch::Empty => {}
            }

            let Some(deadline) = deadline else {
                return Ok(None);
            };

            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    fn try_dispatch(self: &Arc<Self>, schedulers: &[JobType]) -> Dispatch {
        let mut inner = self.inner.lock();
        if !inner.enabled {
            return Dispatch::Disabled;
        }

        // Pick the scheduler type whose head of queue wins the
        // (priority, FIFO) comparison.
        let best = schedulers
            .iter()
            .filter_map(|t| inner.ready.get(t).and_then(BinaryHeap::peek).map(|r| (*t, r.priority, r.seq)))
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.2.cmp(&a.2)));

        let Some((eval_type, _, _)) = best else {
            return Dispatch::Empty;
        };

        let Some(ready) = inner.ready.get_mut(&eval_type).and_then(BinaryHeap::pop) else {
            return Dispatch::Empty;
        };

        let token = Uuid::new_v4().to_string();
        let eval = ready.eval;
        inner.locations.insert(eval.id.clone(), Location::Unacked);
        inner.unacked.insert(
            eval.id.clone(),
            Unacked {
                eval: eval.clone(),
                token: token.clone(),
            },
        );
        inner.counters.dequeues += 1;
        drop(inner);

        self.start_visibility_timer(eval.id.clone(), token.clone());
        Dispatch::Delivered(eval, token)
    }

    fn start_visibility_timer(self: &Arc<Self>, eval_id: EvalId, token: String) {
        let broker = Arc::downgrade(self);
        let timeout = self.visibility_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(broker) = broker.upgrade() {
                broker.expire_unacked(&eval_id, &token);
            }
        });
    }

    /// Auto-nacks a dispatch whose visibility timer fired. A raced ack or
    /// nack wins: the token no longer matches and this is a no-op.
    fn expire_unacked(&self, eval_id: &str, token: &str) {
        {
            let mut inner = self.inner.lock();
            let matches = inner
                .unacked
                .get(eval_id)
                .is_some_and(|u| u.token == token);
            if !matches {
                return;
            }

            debug!(eval_id, "visibility timeout expired, re-queuing evaluation");
            let unacked = match inner.unacked.remove(eval_id) {
                Some(u) => u,
                None => return,
            };
            inner.counters.auto_nacks += 1;
            inner.mark_ready(unacked.eval, true);
        }
        self.dequeue_notify.notify_waiters();
    }

    /// Acknowledges a dispatch, completing the evaluation's pass through
    /// the broker and promoting any held same-job evaluation.
    pub fn ack(self: &Arc<Self>, eval_id: &str, token: &str) -> Result<()> {
        let promoted;
        {
            let mut inner = self.inner.lock();
            let unacked = inner.take_unacked(eval_id, token)?;
            inner.counters.acks += 1;
            inner.locations.remove(eval_id);

            let job_id = unacked.eval.job_id;
            match inner.outstanding.get_mut(&job_id) {
                Some(count) if *count > 1 => *count -= 1,
                _ => {
                    inner.outstanding.remove(&job_id);
                }
            }

            promoted = match inner.waiting.get_mut(&job_id) {
                Some(queue) => {
                    let next = queue.pop_front();
                    if queue.is_empty() {
                        inner.waiting.remove(&job_id);
                    }
                    next
                }
                None => None,
            };

            if let Some(next) = promoted.clone() {
                inner.mark_ready(next, false);
            }
        }
        if promoted.is_some() {
            self.dequeue_notify.notify_waiters();
        }
        Ok(())
    }

    /// Returns a dispatch to the head of the ready queue for its
    /// priority, cancelling the visibility timer by invalidating the
    /// token.
    pub fn nack(self: &Arc<Self>, eval_id: &str, token: &str) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            let unacked = inner.take_unacked(eval_id, token)?;
            inner.counters.nacks += 1;
            inner.mark_ready(unacked.eval, true);
        }
        self.dequeue_notify.notify_waiters();
        Ok(())
    }

    /// Returns a snapshot of broker statistics.
    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        let inner = self.inner.lock();

        let mut by_scheduler: HashMap<JobType, SchedulerStats> = HashMap::new();
        for (eval_type, heap) in &inner.ready {
            by_scheduler.entry(*eval_type).or_default().ready = heap.len();
        }
        for unacked in inner.unacked.values() {
            by_scheduler
                .entry(unacked.eval.eval_type)
                .or_default()
                .unacked += 1;
        }

        BrokerStats {
            total_ready: inner.ready.values().map(BinaryHeap::len).sum(),
            total_unacked: inner.unacked.len(),
            total_waiting: inner.waiting.values().map(VecDeque::len).sum(),
            by_scheduler,
            dequeues: inner.counters.dequeues,
            acks: inner.counters.acks,
            nacks: inner.counters.nacks,
            auto_nacks: inner.counters.auto_nacks,
        }
    }
}

enum Dispatch {
    Delivered(Evaluation, String),
    Empty,
    Disabled,
}

impl Inner {
    /// Places an evaluation in the ready queue for its type, claiming the
    /// job's outstanding slot. `front` queues it ahead of FIFO order
    /// within its priority band.
    fn mark_ready(&mut self, eval: Evaluation, front: bool) {
        let seq = if front {
            self.front_seq -= 1;
            self.front_seq
        } else {
            self.next_seq += 1;
            self.next_seq
        };

        *self.outstanding.entry(eval.job_id.clone()).or_insert(0) = 1;
        self.locations.insert(eval.id.clone(), Location::Ready);
        self.ready.entry(eval.eval_type).or_default().push(ReadyEval {
            priority: eval.priority,
            seq,
            eval,
        });
    }

    fn take_unacked(&mut self, eval_id: &str, token: &str) -> Result<Unacked> {
        let Some(unacked) = self.unacked.get(eval_id) else {
            return Err(BrokerError::NotOutstanding(eval_id.to_owned()));
        };
        if unacked.token != token {
            return Err(BrokerError::TokenMismatch(eval_id.to_owned()));
        }
        match self.unacked.remove(eval_id) {
            Some(unacked) => Ok(unacked),
            None => Err(BrokerError::NotOutstanding(eval_id.to_owned())),
        }
    }

    fn flush(&mut self) {
        self.ready.clear();
        self.unacked.clear();
        self.waiting.clear();
        self.outstanding.clear();
        self.locations.clear();
        self.counters = Counters::default();
    }
}

/// Point-in-time broker statistics.
#[derive(Debug, Clone, Default)]
pub struct BrokerStats {
    /// Evaluations enqueued and never dispatched.
    pub total_ready: usize,
    /// Evaluations dispatched and awaiting ack or nack.
    pub total_unacked: usize,
    /// Evaluations held behind a same-job dispatch.
    pub total_waiting: usize,
    /// Ready/unacked breakdown per scheduler type.
    pub by_scheduler: HashMap<JobType, SchedulerStats>,
    /// Dispatches handed out.
    pub dequeues: u64,
    /// Dispatches acknowledged.
    pub acks: u64,
    /// Dispatches explicitly nacked.
    pub nacks: u64,
    /// Dispatches nacked by the visibility timer.
    pub auto_nacks: u64,
}

/// Per-scheduler-type statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerStats {
    /// Evaluations ready for this scheduler type.
    pub ready: usize,
    /// Evaluations of this type awaiting ack or nack.
    pub unacked: usize,
}

#[cfg(test)]
mod tests {
    use flotilla_proto::{generate_id, EvalStatus, TriggeredBy};

    use super::*;

    fn mk_eval(job_id: &str, priority: u32, eval_type: JobType) -> Evaluation {
        Evaluation {
            id: generate_id(),
            priority,
            eval_type,
            triggered_by: TriggeredBy::JobRegister,
            job_id: job_id.to_owned(),
            job_modify_index: 0,
            node_id: None,
            node_modify_index: 0,
            status: EvalStatus::Pending,
            status_description: String::new(),
            wait_millis: 0,
            next_eval: None,
            previous_eval: None,
            class_eligibility: Default::default(),
            escaped_computed_class: false,
            snapshot_index: 0,
            create_index: 0,
            modify_index: 0,
        }
    }

    fn enabled_broker() -> Arc<EvalBroker> {
        let broker = EvalBroker::new(Duration::from_secs(30));
        broker.set_enabled(true);
        broker
    }

    #[tokio::test]
    async fn dispatch_follows_priority_then_fifo() {
        let broker = enabled_broker();
        let low = mk_eval("job-low", 20, JobType::Service);
        let high = mk_eval("job-high", 90, JobType::Service);
        let mid_a = mk_eval("job-mid-a", 50, JobType::Service);
        let mid_b = mk_eval("job-mid-b", 50, JobType::Service);

        broker.enqueue(low.clone());
        broker.enqueue(mid_a.clone());
        broker.enqueue(mid_b.clone());
        broker.enqueue(high.clone());

        let mut order = Vec::new();
        for _ in 0..4 {
            let (eval, token) = broker
                .dequeue(&[JobType::Service], Duration::ZERO)
                .await
                .unwrap()
                .expect("evaluation should be ready");
            broker.ack(&eval.id, &token).unwrap();
            order.push(eval.id);
        }

        assert_eq!(order, vec![high.id, mid_a.id, mid_b.id, low.id]);
    }

    #[tokio::test]
    async fn zero_timeout_polls_once() {
        let broker = enabled_broker();
        let got = broker
            .dequeue(&[JobType::Service], Duration::ZERO)
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn dequeue_blocks_until_enqueue() {
        let broker = enabled_broker();
        let eval = mk_eval("job-1", 50, JobType::Service);

        let waiter = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                broker
                    .dequeue(&[JobType::Service], Duration::from_secs(10))
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        broker.enqueue(eval.clone());

        let got = waiter.await.unwrap().expect("should receive the eval");
        assert_eq!(got.0.id, eval.id);
    }

    #[tokio::test(start_paused = true)]
    async fn dequeue_times_out_empty() {
        let broker = enabled_broker();
        let got = broker
            .dequeue(&[JobType::Service], Duration::from_millis(50))
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn dequeue_filters_scheduler_types() {
        let broker = enabled_broker();
        broker.enqueue(mk_eval("job-1", 50, JobType::Batch));

        let got = broker
            .dequeue(&[JobType::Service], Duration::ZERO)
            .await
            .unwrap();
        assert!(got.is_none());

        let got = broker
            .dequeue(&[JobType::Batch], Duration::ZERO)
            .await
            .unwrap()
            .expect("batch worker should receive the eval");
        assert_eq!(got.0.eval_type, JobType::Batch);
    }

    #[tokio::test]
    async fn ack_requires_matching_token() {
        let broker = enabled_broker();
        broker.enqueue(mk_eval("job-1", 50, JobType::Service));

        let (eval, token) = broker
            .dequeue(&[JobType::Service], Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(
            broker.ack(&eval.id, "bogus"),
            Err(BrokerError::TokenMismatch(_))
        ));
        assert!(matches!(
            broker.ack("unknown", &token),
            Err(BrokerError::NotOutstanding(_))
        ));
        broker.ack(&eval.id, &token).unwrap();

        // Double-ack: the dispatch is gone.
        assert!(matches!(
            broker.ack(&eval.id, &token),
            Err(BrokerError::NotOutstanding(_))
        ));
    }

    #[tokio::test]
    async fn nack_requeues_at_head_of_priority() {
        let broker = enabled_broker();
        let first = mk_eval("job-1", 50, JobType::Service);
        let second = mk_eval("job-2", 50, JobType::Service);
        broker.enqueue(first.clone());
        broker.enqueue(second.clone());

        let (eval, token) = broker
            .dequeue(&[JobType::Service], Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(eval.id, first.id);

        broker.nack(&eval.id, &token).unwrap();

        // The nacked evaluation is redelivered before its FIFO peer.
        let (eval, _) = broker
            .dequeue(&[JobType::Service], Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(eval.id, first.id);
    }

    #[tokio::test]
    async fn nack_preserves_class_eligibility() {
        let broker = enabled_broker();
        let mut eval = mk_eval("job-1", 50, JobType::Service);
        eval.class_eligibility.insert("cls-a".to_owned(), false);
        broker.enqueue(eval);

        let (eval, token) = broker
            .dequeue(&[JobType::Service], Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        broker.nack(&eval.id, &token).unwrap();

        let (eval, _) = broker
            .dequeue(&[JobType::Service], Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(eval.class_eligibility.get("cls-a"), Some(&false));
    }

    #[tokio::test]
    async fn same_job_dispatch_is_serialised() {
        let broker = enabled_broker();
        let first = mk_eval("job-1", 50, JobType::Service);
        let second = mk_eval("job-1", 50, JobType::Service);
        broker.enqueue(first.clone());
        broker.enqueue(second.clone());

        let (eval, token) = broker
            .dequeue(&[JobType::Service], Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(eval.id, first.id);

        // The second evaluation is held while the first is outstanding.
        assert!(broker
            .dequeue(&[JobType::Service], Duration::ZERO)
            .await
            .unwrap()
            .is_none());
        assert_eq!(broker.stats().total_waiting, 1);

        broker.ack(&first.id, &token).unwrap();

        let (eval, _) = broker
            .dequeue(&[JobType::Service], Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(eval.id, second.id);
    }

    #[tokio::test]
    async fn enqueue_is_idempotent() {
        let broker = enabled_broker();
        let eval = mk_eval("job-1", 50, JobType::Service);
        broker.enqueue(eval.clone());
        broker.enqueue(eval.clone());

        assert_eq!(broker.stats().total_ready, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn visibility_timeout_auto_nacks() {
        let broker = EvalBroker::new(Duration::from_millis(200));
        broker.set_enabled(true);
        let eval = mk_eval("job-1", 50, JobType::Service);
        broker.enqueue(eval.clone());

        let (first, first_token) = broker
            .dequeue(&[JobType::Service], Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;

        let (second, second_token) = broker
            .dequeue(&[JobType::Service], Duration::ZERO)
            .await
            .unwrap()
            .expect("expired dispatch should be redelivered");
        assert_eq!(first.id, second.id);
        assert_ne!(first_token, second_token, "redelivery issues a fresh token");

        let stats = broker.stats();
        assert_eq!(stats.auto_nacks, 1);
        assert_eq!(stats.dequeues, 2);

        // The stale token is no longer valid.
        assert!(broker.ack(&first.id, &first_token).is_err());
        broker.ack(&second.id, &second_token).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn ack_cancels_visibility_timeout() {
        let broker = EvalBroker::new(Duration::from_millis(100));
        broker.set_enabled(true);
        broker.enqueue(mk_eval("job-1", 50, JobType::Service));

        let (eval, token) = broker
            .dequeue(&[JobType::Service], Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        broker.ack(&eval.id, &token).unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;

        let stats = broker.stats();
        assert_eq!(stats.auto_nacks, 0);
        assert_eq!(stats.total_ready, 0);
    }

    #[tokio::test]
    async fn disabled_broker_rejects_dequeue() {
        let broker = EvalBroker::new(Duration::from_secs(30));
        let got = broker.dequeue(&[JobType::Service], Duration::ZERO).await;
        assert!(matches!(got, Err(BrokerError::Disabled)));
    }

    #[tokio::test]
    async fn disable_flushes_state() {
        let broker = enabled_broker();
        broker.enqueue(mk_eval("job-1", 50, JobType::Service));
        broker.enqueue(mk_eval("job-2", 50, JobType::Service));
        let _ = broker
            .dequeue(&[JobType::Service], Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        broker.set_enabled(false);
        broker.set_enabled(true);

        let stats = broker.stats();
        assert_eq!(stats.total_ready, 0);
        assert_eq!(stats.total_unacked, 0);
        assert_eq!(stats.total_waiting, 0);
        assert_eq!(stats.dequeues, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disable_wakes_pending_dequeue_with_empty_result() {
        let broker = enabled_broker();
        let waiter = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                broker
                    .dequeue(&[JobType::Service], Duration::from_secs(60))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        broker.set_enabled(false);

        let got = waiter.await.unwrap().unwrap();
        assert!(got.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_millis_delays_availability() {
        let broker = enabled_broker();
        let mut eval = mk_eval("job-1", 50, JobType::Service);
        eval.wait_millis = 500;
        broker.enqueue(eval.clone());

        assert!(broker
            .dequeue(&[JobType::Service], Duration::ZERO)
            .await
            .unwrap()
            .is_none());

        tokio::time::sleep(Duration::from_millis(600)).await;

        let got = broker
            .dequeue(&[JobType::Service], Duration::ZERO)
            .await
            .unwrap()
            .expect("delayed evaluation should be available");
        assert_eq!(got.0.id, eval.id);
    }

    #[tokio::test(start_paused = true)]
    async fn counters_bound_dispatches() {
        let broker = EvalBroker::new(Duration::from_millis(100));
        broker.set_enabled(true);
        for i in 0..3 {
            broker.enqueue(mk_eval(&format!("job-{i}"), 50, JobType::Service));
        }

        let (e1, t1) = broker
            .dequeue(&[JobType::Service], Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        broker.ack(&e1.id, &t1).unwrap();

        let (e2, t2) = broker
            .dequeue(&[JobType::Service], Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        broker.nack(&e2.id, &t2).unwrap();

        let _ = broker
            .dequeue(&[JobType::Service], Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stats = broker.stats();
        assert!(stats.acks + stats.nacks + stats.auto_nacks <= stats.dequeues);
        assert_eq!(stats.auto_nacks, 1);
    }
}
