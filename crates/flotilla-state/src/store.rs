//! The state store and its transactional write operations.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use tokio::sync::mpsc;

use flotilla_proto::{
    Allocation, Evaluation, Job, JobStatus, JobType, Node, NodeStatus, PeriodicLaunch,
};

use crate::error::{Result, StateError};
use crate::tables::Tables;
use crate::watch::{Table, WatchHub, WatchItem, WatchSet};

/// The authoritative in-memory database of control-plane state.
///
/// One writer commits at a time; readers hold the previously published
/// table set and never block (or are blocked by) a writer. Every object
/// returned from a read must be treated as immutable.
#[derive(Debug, Default)]
pub struct StateStore {
    current: RwLock<Arc<Tables>>,
    writer: Mutex<()>,
    watch: WatchHub,
}

/// An in-flight write transaction over a private copy of the tables.
struct Txn {
    tables: Tables,
    items: WatchSet,
}

impl StateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a point-in-time snapshot. Snapshots never observe writes
    /// committed after they were taken.
    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            tables: self.current.read().clone(),
        }
    }

    /// Returns the index row for a table, zero if never written.
    #[must_use]
    pub fn index(&self, table: Table) -> u64 {
        self.current.read().index(table)
    }

    /// Registers a signal channel for the given watch items.
    pub fn subscribe(&self, items: &WatchSet, signal: &mpsc::Sender<()>) {
        self.watch.subscribe(items, signal);
    }

    /// Removes a signal channel from the given watch items.
    pub fn unsubscribe(&self, items: &WatchSet, signal: &mpsc::Sender<()>) {
        self.watch.unsubscribe(items, signal);
    }

    fn begin(&self) -> (MutexGuard<'_, ()>, Txn) {
        let guard = self.writer.lock();
        let txn = Txn {
            tables: self.current.read().as_ref().clone(),
            items: WatchSet::new(),
        };
        (guard, txn)
    }

    /// Publishes the transaction's tables, then fires its watch items.
    /// Notification happens strictly after the new tables are visible.
    fn commit(&self, _guard: MutexGuard<'_, ()>, txn: Txn) {
        let Txn { tables, items } = txn;
        *self.current.write() = Arc::new(tables);
        self.watch.notify(&items);
    }

    fn check_index(txn: &Txn, table: Table, index: u64) -> Result<()> {
        let current = txn.tables.index(table);
        if index < current {
            return Err(StateError::StaleIndex {
                table: table.name(),
                index,
                current,
            });
        }
        Ok(())
    }

    /// Registers a node or updates its definition.
    ///
    /// Updates are assumed to come from the client, so `create_index` and
    /// the scheduler-owned `drain` flag are retained from any existing
    /// row.
    pub fn upsert_node(&self, index: u64, mut node: Node) -> Result<()> {
        let (guard, mut txn) = self.begin();
        Self::check_index(&txn, Table::Nodes, index)?;

        txn.items.add(WatchItem::Table(Table::Nodes));
        txn.items.add(WatchItem::Node(node.id.clone()));

        if let Some(existing) = txn.tables.nodes.get(&node.id) {
            node.create_index = existing.create_index;
            node.drain = existing.drain;
        } else {
            node.create_index = index;
        }
        node.modify_index = index;

        txn.tables.insert_node(Arc::new(node));
        txn.tables.set_index(Table::Nodes, index);

        self.commit(guard, txn);
        Ok(())
    }

    /// Removes a node. Allocations referencing it are left in place.
    pub fn delete_node(&self, index: u64, node_id: &str) -> Result<()> {
        let (guard, mut txn) = self.begin();
        Self::check_index(&txn, Table::Nodes, index)?;

        if txn.tables.remove_node(node_id).is_none() {
            return Err(StateError::NodeNotFound(node_id.to_owned()));
        }

        txn.items.add(WatchItem::Table(Table::Nodes));
        txn.items.add(WatchItem::Node(node_id.to_owned()));
        txn.tables.set_index(Table::Nodes, index);

        self.commit(guard, txn);
        Ok(())
    }

    /// Updates the status of a node via copy-on-write.
    pub fn update_node_status(&self, index: u64, node_id: &str, status: NodeStatus) -> Result<()> {
        self.mutate_node(index, node_id, |node| node.status = status)
    }

    /// Updates the drain mode of a node via copy-on-write.
    pub fn update_node_drain(&self, index: u64, node_id: &str, drain: bool) -> Result<()> {
        self.mutate_node(index, node_id, |node| node.drain = drain)
    }

    fn mutate_node(&self, index: u64, node_id: &str, f: impl FnOnce(&mut Node)) -> Result<()> {
        let (guard, mut txn) = self.begin();
        Self::check_index(&txn, Table::Nodes, index)?;

        let existing = txn
            .tables
            .nodes
            .get(node_id)
            .cloned()
            .ok_or_else(|| StateError::NodeNotFound(node_id.to_owned()))?;

        txn.items.add(WatchItem::Table(Table::Nodes));
        txn.items.add(WatchItem::Node(node_id.to_owned()));

        let mut updated = (*existing).clone();
        f(&mut updated);
        updated.modify_index = index;

        txn.tables.insert_node(Arc::new(updated));
        txn.tables.set_index(Table::Nodes, index);

        self.commit(guard, txn);
        Ok(())
    }

    /// Registers a job or updates its definition, recomputing its status.
    pub fn upsert_job(&self, index: u64, mut job: Job) -> Result<()> {
        let (guard, mut txn) = self.begin();
        Self::check_index(&txn, Table::Jobs, index)?;

        txn.items.add(WatchItem::Table(Table::Jobs));
        txn.items.add(WatchItem::Job(job.id.clone()));

        if let Some(existing) = txn.tables.jobs.get(&job.id) {
            job.create_index = existing.create_index;
            job.status = get_job_status(&txn.tables, &job, false);
        } else {
            job.create_index = index;
            // A first insert has no evaluations or allocations, so the
            // status is known without computing it.
            job.status = if job.is_periodic() {
                JobStatus::Running
            } else {
                JobStatus::Pending
            };
        }
        job.modify_index = index;
        job.job_modify_index = index;

        txn.tables.insert_job(Arc::new(job));
        txn.tables.set_index(Table::Jobs, index);

        self.commit(guard, txn);
        Ok(())
    }

    /// Removes a job.
    pub fn delete_job(&self, index: u64, job_id: &str) -> Result<()> {
        let (guard, mut txn) = self.begin();
        Self::check_index(&txn, Table::Jobs, index)?;

        if txn.tables.remove_job(job_id).is_none() {
            return Err(StateError::JobNotFound(job_id.to_owned()));
        }

        txn.items.add(WatchItem::Table(Table::Jobs));
        txn.items.add(WatchItem::Job(job_id.to_owned()));
        txn.tables.set_index(Table::Jobs, index);

        self.commit(guard, txn);
        Ok(())
    }

    /// Upserts a batch of evaluations, then recomputes the status of each
    /// touched job.
    pub fn upsert_evals(&self, index: u64, evals: Vec<Evaluation>) -> Result<()> {
        let (guard, mut txn) = self.begin();
        Self::check_index(&txn, Table::Evals, index)?;

        txn.items.add(WatchItem::Table(Table::Evals));

        let mut jobs: HashMap<String, Option<JobStatus>> = HashMap::with_capacity(evals.len());
        for mut eval in evals {
            txn.items.add(WatchItem::Eval(eval.id.clone()));

            if let Some(existing) = txn.tables.evals.get(&eval.id) {
                eval.create_index = existing.create_index;
            } else {
                eval.create_index = index;
            }
            eval.modify_index = index;

            jobs.insert(eval.job_id.clone(), None);
            txn.tables.insert_eval(Arc::new(eval));
        }
        txn.tables.set_index(Table::Evals, index);

        set_job_statuses(&mut txn, index, jobs, false);

        self.commit(guard, txn);
        Ok(())
    }

    /// Deletes evaluations and allocations in one transaction, then
    /// recomputes the status of the jobs the evaluations belonged to.
    /// Unknown IDs are skipped.
    pub fn delete_evals(&self, index: u64, eval_ids: &[String], alloc_ids: &[String]) -> Result<()> {
        let (guard, mut txn) = self.begin();
        Self::check_index(&txn, Table::Evals, index)?;

        txn.items.add(WatchItem::Table(Table::Evals));
        txn.items.add(WatchItem::Table(Table::Allocs));

        let mut jobs: HashMap<String, Option<JobStatus>> = HashMap::with_capacity(eval_ids.len());
        for eval_id in eval_ids {
            if let Some(eval) = txn.tables.remove_eval(eval_id) {
                txn.items.add(WatchItem::Eval(eval_id.clone()));
                jobs.insert(eval.job_id.clone(), None);
            }
        }

        for alloc_id in alloc_ids {
            if let Some(alloc) = txn.tables.remove_alloc(alloc_id) {
                txn.items.add(WatchItem::Alloc(alloc_id.clone()));
                txn.items.add(WatchItem::AllocEval(alloc.eval_id.clone()));
                txn.items.add(WatchItem::AllocJob(alloc.job_id.clone()));
                txn.items.add(WatchItem::AllocNode(alloc.node_id.clone()));
            }
        }

        txn.tables.set_index(Table::Evals, index);
        txn.tables.set_index(Table::Allocs, index);

        set_job_statuses(&mut txn, index, jobs, true);

        self.commit(guard, txn);
        Ok(())
    }

    /// Upserts allocations on the scheduler-authoritative path.
    ///
    /// Client-owned fields (`client_status`, `client_description`) are
    /// retained from any existing row.
    pub fn upsert_allocs(&self, index: u64, allocs: Vec<Allocation>) -> Result<()> {
        let (guard, mut txn) = self.begin();
        Self::check_index(&txn, Table::Allocs, index)?;

        txn.items.add(WatchItem::Table(Table::Allocs));

        let mut jobs: HashMap<String, Option<JobStatus>> = HashMap::new();
        for mut alloc in allocs {
            if let Some(existing) = txn.tables.allocs.get(&alloc.id) {
                alloc.create_index = existing.create_index;
                alloc.client_status = existing.client_status;
                alloc.client_description = existing.client_description.clone();
            } else {
                alloc.create_index = index;
            }
            alloc.modify_index = index;
            alloc.alloc_modify_index = index;

            // A live placement forces the job to running without
            // consulting the rest of its allocations.
            let force = (!alloc.is_terminal()).then_some(JobStatus::Running);
            jobs.insert(alloc.job_id.clone(), force);

            txn.items.add(WatchItem::Alloc(alloc.id.clone()));
            txn.items.add(WatchItem::AllocEval(alloc.eval_id.clone()));
            txn.items.add(WatchItem::AllocJob(alloc.job_id.clone()));
            txn.items.add(WatchItem::AllocNode(alloc.node_id.clone()));

            txn.tables.insert_alloc(Arc::new(alloc));
        }
        txn.tables.set_index(Table::Allocs, index);

        set_job_statuses(&mut txn, index, jobs, false);

        self.commit(guard, txn);
        Ok(())
    }

    /// Applies client-reported allocation state.
    ///
    /// The schedulers own the desired state; the client owns the observed
    /// state. Only `client_status`, `client_description` and `task_states`
    /// are taken from the input, and an allocation is never created from
    /// a client update: unknown IDs are skipped.
    pub fn update_allocs_from_client(&self, index: u64, allocs: Vec<Allocation>) -> Result<()> {
        let (guard, mut txn) = self.begin();
        Self::check_index(&txn, Table::Allocs, index)?;

        txn.items.add(WatchItem::Table(Table::Allocs));

        let mut jobs: HashMap<String, Option<JobStatus>> = HashMap::new();
        for alloc in allocs {
            let Some(existing) = txn.tables.allocs.get(&alloc.id).cloned() else {
                continue;
            };

            txn.items.add(WatchItem::Alloc(alloc.id.clone()));
            txn.items.add(WatchItem::AllocEval(existing.eval_id.clone()));
            txn.items.add(WatchItem::AllocJob(existing.job_id.clone()));
            txn.items.add(WatchItem::AllocNode(existing.node_id.clone()));

            let mut updated = (*existing).clone();
            updated.client_status = alloc.client_status;
            updated.client_description = alloc.client_description;
            updated.task_states = alloc.task_states;
            updated.modify_index = index;

            let force = (!updated.is_terminal()).then_some(JobStatus::Running);
            jobs.insert(updated.job_id.clone(), force);

            txn.tables.insert_alloc(Arc::new(updated));
        }
        txn.tables.set_index(Table::Allocs, index);

        set_job_statuses(&mut txn, index, jobs, false);

        self.commit(guard, txn);
        Ok(())
    }

    /// Records the last dispatch of a periodic job.
    pub fn upsert_periodic_launch(&self, index: u64, mut launch: PeriodicLaunch) -> Result<()> {
        let (guard, mut txn) = self.begin();
        Self::check_index(&txn, Table::PeriodicLaunches, index)?;

        txn.items.add(WatchItem::Table(Table::PeriodicLaunches));
        txn.items.add(WatchItem::Job(launch.id.clone()));

        if let Some(existing) = txn.tables.periodic_launches.get(&launch.id) {
            launch.create_index = existing.create_index;
        } else {
            launch.create_index = index;
        }
        launch.modify_index = index;

        txn.tables.insert_periodic_launch(Arc::new(launch));
        txn.tables.set_index(Table::PeriodicLaunches, index);

        self.commit(guard, txn);
        Ok(())
    }

    /// Deletes the launch record of a periodic job.
    pub fn delete_periodic_launch(&self, index: u64, job_id: &str) -> Result<()> {
        let (guard, mut txn) = self.begin();
        Self::check_index(&txn, Table::PeriodicLaunches, index)?;

        if txn.tables.remove_periodic_launch(job_id).is_none() {
            return Err(StateError::LaunchNotFound(job_id.to_owned()));
        }

        txn.items.add(WatchItem::Table(Table::PeriodicLaunches));
        txn.items.add(WatchItem::Job(job_id.to_owned()));
        txn.tables.set_index(Table::PeriodicLaunches, index);

        self.commit(guard, txn);
        Ok(())
    }

    /// Opens a bulk-restore transaction holding the writer lock for its
    /// whole lifetime. Rows are inserted verbatim and a single batched
    /// notification fires on commit.
    pub fn restore(&self) -> StateRestore<'_> {
        let guard = self.writer.lock();
        let tables = self.current.read().as_ref().clone();
        StateRestore {
            store: self,
            guard: Some(guard),
            tables,
            items: WatchSet::new(),
        }
    }
}

/// Sets the status of each job in the map, honouring per-job forced
/// statuses. Missing jobs are skipped.
fn set_job_statuses(
    txn: &mut Txn,
    index: u64,
    jobs: HashMap<String, Option<JobStatus>>,
    eval_delete: bool,
) {
    for (job_id, force) in jobs {
        let Some(job) = txn.tables.jobs.get(&job_id).cloned() else {
            continue;
        };

        let new_status = force.unwrap_or_else(|| get_job_status(&txn.tables, &job, eval_delete));
        if job.status == new_status {
            continue;
        }

        txn.items.add(WatchItem::Table(Table::Jobs));
        txn.items.add(WatchItem::Job(job.id.clone()));

        let mut updated = (*job).clone();
        updated.status = new_status;
        updated.modify_index = index;
        txn.tables.insert_job(Arc::new(updated));
        txn.tables.set_index(Table::Jobs, index);
    }
}

/// Derives a job's status from its allocations and evaluations.
///
/// `eval_delete` marks that the computation runs because evaluations are
/// being deleted (garbage collection), in which case an empty evaluation
/// set still means the job is dead rather than new.
fn get_job_status(tables: &Tables, job: &Job, eval_delete: bool) -> JobStatus {
    let mut has_alloc = false;
    if let Some(ids) = tables.allocs_by_job.get(&job.id) {
        for id in ids {
            has_alloc = true;
            if tables.allocs.get(id).is_some_and(|a| !a.is_terminal()) {
                return JobStatus::Running;
            }
        }
    }

    let mut has_eval = false;
    if let Some(ids) = tables.evals_by_job.get(&job.id) {
        for id in ids {
            has_eval = true;
            if tables.evals.get(id).is_some_and(|e| !e.is_terminal()) {
                return JobStatus::Pending;
            }
        }
    }

    if eval_delete || has_eval || has_alloc {
        return JobStatus::Dead;
    }

    // A job with no history is new. Periodic jobs never accrue their own
    // evaluations or allocations, so they count as running.
    if job.is_periodic() {
        JobStatus::Running
    } else {
        JobStatus::Pending
    }
}

/// A point-in-time, read-only view of the store.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    tables: Arc<Tables>,
}

impl StateSnapshot {
    /// Returns the index row for a table, zero if never written.
    #[must_use]
    pub fn index(&self, table: Table) -> u64 {
        self.tables.index(table)
    }

    /// Returns every index row.
    #[must_use]
    pub fn indexes(&self) -> Vec<(&'static str, u64)> {
        self.tables.indexes.iter().map(|(k, v)| (*k, *v)).collect()
    }

    /// Looks up a node by ID.
    #[must_use]
    pub fn node_by_id(&self, node_id: &str) -> Option<Arc<Node>> {
        self.tables.nodes.get(node_id).cloned()
    }

    /// Returns nodes whose ID starts with the prefix, ordered by ID.
    #[must_use]
    pub fn nodes_by_id_prefix(&self, prefix: &str) -> Vec<Arc<Node>> {
        prefix_scan(&self.tables.nodes, prefix)
    }

    /// Returns all nodes, ordered by ID.
    #[must_use]
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.tables.nodes.values().cloned().collect()
    }

    /// Looks up a job by ID.
    #[must_use]
    pub fn job_by_id(&self, job_id: &str) -> Option<Arc<Job>> {
        self.tables.jobs.get(job_id).cloned()
    }

    /// Returns jobs whose ID starts with the prefix, ordered by ID.
    #[must_use]
    pub fn jobs_by_id_prefix(&self, prefix: &str) -> Vec<Arc<Job>> {
        prefix_scan(&self.tables.jobs, prefix)
    }

    /// Returns all jobs, ordered by ID.
    #[must_use]
    pub fn jobs(&self) -> Vec<Arc<Job>> {
        self.tables.jobs.values().cloned().collect()
    }

    /// Returns jobs of the given scheduler type.
    #[must_use]
    pub fn jobs_by_type(&self, job_type: JobType) -> Vec<Arc<Job>> {
        self.tables
            .jobs
            .values()
            .filter(|j| j.job_type == job_type)
            .cloned()
            .collect()
    }

    /// Returns periodic or non-periodic jobs.
    #[must_use]
    pub fn jobs_by_periodic(&self, periodic: bool) -> Vec<Arc<Job>> {
        self.tables
            .jobs
            .values()
            .filter(|j| j.is_periodic() == periodic)
            .cloned()
            .collect()
    }

    /// Returns jobs eligible (or ineligible) for garbage collection.
    #[must_use]
    pub fn jobs_by_gc(&self, gc: bool) -> Vec<Arc<Job>> {
        self.tables
            .jobs
            .values()
            .filter(|j| j.gc_eligible() == gc)
            .cloned()
            .collect()
    }

    /// Looks up an evaluation by ID.
    #[must_use]
    pub fn eval_by_id(&self, eval_id: &str) -> Option<Arc<Evaluation>> {
        self.tables.evals.get(eval_id).cloned()
    }

    /// Returns evaluations whose ID starts with the prefix, ordered by ID.
    #[must_use]
    pub fn evals_by_id_prefix(&self, prefix: &str) -> Vec<Arc<Evaluation>> {
        prefix_scan(&self.tables.evals, prefix)
    }

    /// Returns all evaluations, ordered by ID.
    #[must_use]
    pub fn evals(&self) -> Vec<Arc<Evaluation>> {
        self.tables.evals.values().cloned().collect()
    }

    /// Returns the evaluations of a job.
    #[must_use]
    pub fn evals_by_job(&self, job_id: &str) -> Vec<Arc<Evaluation>> {
        self.relation(&self.tables.evals_by_job, &self.tables.evals, job_id)
    }

    /// Looks up an allocation by ID.
    #[must_use]
    pub fn alloc_by_id(&self, alloc_id: &str) -> Option<Arc<Allocation>> {
        self.tables.allocs.get(alloc_id).cloned()
    }

    /// Returns allocations whose ID starts with the prefix, ordered by ID.
    #[must_use]
    pub fn allocs_by_id_prefix(&self, prefix: &str) -> Vec<Arc<Allocation>> {
        prefix_scan(&self.tables.allocs, prefix)
    }

    /// Returns all allocations, ordered by ID.
    #[must_use]
    pub fn allocs(&self) -> Vec<Arc<Allocation>> {
        self.tables.allocs.values().cloned().collect()
    }

    /// Returns the allocations of a job.
    #[must_use]
    pub fn allocs_by_job(&self, job_id: &str) -> Vec<Arc<Allocation>> {
        self.relation(&self.tables.allocs_by_job, &self.tables.allocs, job_id)
    }

    /// Returns the allocations produced by an evaluation.
    #[must_use]
    pub fn allocs_by_eval(&self, eval_id: &str) -> Vec<Arc<Allocation>> {
        self.relation(&self.tables.allocs_by_eval, &self.tables.allocs, eval_id)
    }

    /// Returns the allocations placed on a node, regardless of status.
    #[must_use]
    pub fn allocs_by_node(&self, node_id: &str) -> Vec<Arc<Allocation>> {
        self.relation(&self.tables.allocs_by_node, &self.tables.allocs, node_id)
    }

    /// Returns the allocations placed on a node, filtered by terminality.
    #[must_use]
    pub fn allocs_by_node_terminal(&self, node_id: &str, terminal: bool) -> Vec<Arc<Allocation>> {
        self.allocs_by_node(node_id)
            .into_iter()
            .filter(|a| a.is_terminal() == terminal)
            .collect()
    }

    /// Looks up the launch record of a periodic job.
    #[must_use]
    pub fn periodic_launch_by_id(&self, job_id: &str) -> Option<Arc<PeriodicLaunch>> {
        self.tables.periodic_launches.get(job_id).cloned()
    }

    /// Returns all periodic launch records, ordered by job ID.
    #[must_use]
    pub fn periodic_launches(&self) -> Vec<Arc<PeriodicLaunch>> {
        self.tables.periodic_launches.values().cloned().collect()
    }

    fn relation<T>(
        &self,
        index: &std::collections::BTreeMap<String, std::collections::BTreeSet<String>>,
        table: &std::collections::BTreeMap<String, Arc<T>>,
        key: &str,
    ) -> Vec<Arc<T>> {
        index
            .get(key)
            .map(|ids| ids.iter().filter_map(|id| table.get(id).cloned()).collect())
            .unwrap_or_default()
    }
}

fn prefix_scan<T>(
    table: &std::collections::BTreeMap<String, Arc<T>>,
    prefix: &str,
) -> Vec<Arc<T>> {
    table
        .range(prefix.to_owned()..)
        .take_while(|(id, _)| id.starts_with(prefix))
        .map(|(_, row)| row.clone())
        .collect()
}

/// A bulk-restore transaction.
///
/// Rows are inserted verbatim, index rows included, and one batched
/// watch notification fires on commit. Dropping the guard without
/// committing aborts with no visible effect.
pub struct StateRestore<'a> {
    store: &'a StateStore,
    guard: Option<MutexGuard<'a, ()>>,
    tables: Tables,
    items: WatchSet,
}

impl StateRestore<'_> {
    /// Restores a node row.
    pub fn node(&mut self, node: Node) {
        self.items.add(WatchItem::Table(Table::Nodes));
        self.items.add(WatchItem::Node(node.id.clone()));
        self.tables.insert_node(Arc::new(node));
    }

    /// Restores a job row.
    pub fn job(&mut self, job: Job) {
        self.items.add(WatchItem::Table(Table::Jobs));
        self.items.add(WatchItem::Job(job.id.clone()));
        self.tables.insert_job(Arc::new(job));
    }

    /// Restores an evaluation row.
    pub fn eval(&mut self, eval: Evaluation) {
        self.items.add(WatchItem::Table(Table::Evals));
        self.items.add(WatchItem::Eval(eval.id.clone()));
        self.tables.insert_eval(Arc::new(eval));
    }

    /// Restores an allocation row.
    pub fn alloc(&mut self, alloc: Allocation) {
        self.items.add(WatchItem::Table(Table::Allocs));
        self.items.add(WatchItem::Alloc(alloc.id.clone()));
        self.items.add(WatchItem::AllocEval(alloc.eval_id.clone()));
        self.items.add(WatchItem::AllocJob(alloc.job_id.clone()));
        self.items.add(WatchItem::AllocNode(alloc.node_id.clone()));
        self.tables.insert_alloc(Arc::new(alloc));
    }

    /// Restores a periodic launch row.
    pub fn periodic_launch(&mut self, launch: PeriodicLaunch) {
        self.items.add(WatchItem::Table(Table::PeriodicLaunches));
        self.items.add(WatchItem::Job(launch.id.clone()));
        self.tables.insert_periodic_launch(Arc::new(launch));
    }

    /// Restores an index row.
    pub fn index(&mut self, table: Table, value: u64) {
        self.tables.set_index(table, value);
    }

    /// Publishes all restored rows atomically.
    pub fn commit(mut self) {
        if let Some(guard) = self.guard.take() {
            let tables = std::mem::take(&mut self.tables);
            let items = std::mem::take(&mut self.items);
            self.store.commit(guard, Txn { tables, items });
        }
    }

    /// Discards all restored rows.
    pub fn abort(self) {}
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use flotilla_proto::{
        generate_id, AllocClientStatus, AllocDesiredStatus, AllocMetrics, Constraint, EvalStatus,
        PeriodicConfig, Resources, Task, TaskGroup, TriggeredBy, UpdateStrategy,
    };

    use super::*;

    fn mk_node() -> Node {
        Node {
            id: generate_id(),
            datacenter: "dc1".to_owned(),
            name: "node".to_owned(),
            node_class: "general".to_owned(),
            computed_class: "cls-v1-abc".to_owned(),
            attributes: BTreeMap::new(),
            resources: Resources {
                cpu_mhz: 4000,
                memory_mb: 8192,
                disk_mb: 100_000,
                iops: 1000,
                networks: Vec::new(),
            },
            reserved: Resources::default(),
            status: NodeStatus::Init,
            status_description: String::new(),
            drain: false,
            create_index: 0,
            modify_index: 0,
        }
    }

    fn mk_job() -> Job {
        Job {
            id: generate_id(),
            name: "web".to_owned(),
            job_type: JobType::Service,
            priority: 50,
            all_at_once: false,
            datacenters: vec!["dc1".to_owned()],
            constraints: vec![Constraint {
                target: "${node.class}".to_owned(),
                operand: "=".to_owned(),
                value: "general".to_owned(),
            }],
            task_groups: vec![TaskGroup {
                name: "frontend".to_owned(),
                count: 2,
                constraints: Vec::new(),
                tasks: vec![Task {
                    name: "server".to_owned(),
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

    fn mk_eval(job: &Job) -> Evaluation {
        Evaluation::for_job(job, TriggeredBy::JobRegister)
    }

    fn mk_alloc(job: &Job, node: &Node, eval: &Evaluation) -> Allocation {
        Allocation {
            id: generate_id(),
            eval_id: eval.id.clone(),
            name: format!("{}.frontend[0]", job.name),
            node_id: node.id.clone(),
            job_id: job.id.clone(),
            task_group: "frontend".to_owned(),
            resources: Resources::default(),
            metrics: AllocMetrics::default(),
            desired_status: AllocDesiredStatus::Run,
            desired_description: String::new(),
            client_status: AllocClientStatus::Pending,
            client_description: String::new(),
            task_states: BTreeMap::new(),
            alloc_modify_index: 0,
            create_index: 0,
            modify_index: 0,
        }
    }

    #[test]
    fn node_register_then_deregister() {
        let store = StateStore::new();
        let node = mk_node();
        let node_id = node.id.clone();

        store.upsert_node(1, node).unwrap();
        let snap = store.snapshot();
        let row = snap.node_by_id(&node_id).unwrap();
        assert_eq!(row.create_index, 1);
        assert_eq!(row.modify_index, 1);
        assert_eq!(snap.index(Table::Nodes), 1);

        store.delete_node(2, &node_id).unwrap();
        let snap = store.snapshot();
        assert!(snap.node_by_id(&node_id).is_none());
        assert_eq!(snap.index(Table::Nodes), 2);
    }

    #[test]
    fn node_upsert_preserves_create_index_and_drain() {
        let store = StateStore::new();
        let node = mk_node();
        let node_id = node.id.clone();

        store.upsert_node(1, node.clone()).unwrap();
        store.update_node_drain(2, &node_id, true).unwrap();

        // The client re-registers without knowledge of the drain flag.
        let mut update = node;
        update.status = NodeStatus::Ready;
        store.upsert_node(3, update).unwrap();

        let row = store.snapshot().node_by_id(&node_id).unwrap();
        assert_eq!(row.create_index, 1);
        assert_eq!(row.modify_index, 3);
        assert_eq!(row.status, NodeStatus::Ready);
        assert!(row.drain, "drain must survive client re-registration");
    }

    #[test]
    fn node_mutations_require_existing_row() {
        let store = StateStore::new();
        assert!(matches!(
            store.update_node_status(1, "missing", NodeStatus::Ready),
            Err(StateError::NodeNotFound(_))
        ));
        assert!(matches!(
            store.update_node_drain(1, "missing", true),
            Err(StateError::NodeNotFound(_))
        ));
        assert!(matches!(
            store.delete_node(1, "missing"),
            Err(StateError::NodeNotFound(_))
        ));
    }

    #[test]
    fn snapshot_isolation() {
        let store = StateStore::new();
        let node = mk_node();
        let node_id = node.id.clone();
        store.upsert_node(1, node).unwrap();

        let before = store.snapshot();
        store.update_node_status(2, &node_id, NodeStatus::Ready).unwrap();

        assert_eq!(before.node_by_id(&node_id).unwrap().status, NodeStatus::Init);
        assert_eq!(
            store.snapshot().node_by_id(&node_id).unwrap().status,
            NodeStatus::Ready
        );
    }

    #[test]
    fn job_first_insert_status() {
        let store = StateStore::new();

        let job = mk_job();
        store.upsert_job(1, job.clone()).unwrap();
        assert_eq!(
            store.snapshot().job_by_id(&job.id).unwrap().status,
            JobStatus::Pending
        );

        let mut periodic = mk_job();
        periodic.periodic = Some(PeriodicConfig {
            enabled: true,
            schedule: "0 */5 * * * *".to_owned(),
        });
        store.upsert_job(2, periodic.clone()).unwrap();
        assert_eq!(
            store.snapshot().job_by_id(&periodic.id).unwrap().status,
            JobStatus::Running
        );
    }

    #[test]
    fn job_status_follows_evals_and_allocs() {
        let store = StateStore::new();
        let node = mk_node();
        let job = mk_job();
        store.upsert_node(1, node.clone()).unwrap();
        store.upsert_job(2, job.clone()).unwrap();

        // Pending eval keeps the job pending.
        let eval = mk_eval(&job);
        store.upsert_evals(3, vec![eval.clone()]).unwrap();
        assert_eq!(
            store.snapshot().job_by_id(&job.id).unwrap().status,
            JobStatus::Pending
        );

        // A non-terminal alloc makes the job running.
        let alloc = mk_alloc(&job, &node, &eval);
        store.upsert_allocs(4, vec![alloc.clone()]).unwrap();
        assert_eq!(
            store.snapshot().job_by_id(&job.id).unwrap().status,
            JobStatus::Running
        );

        // Terminal alloc and terminal eval: the job is dead.
        let mut done = eval.clone();
        done.status = EvalStatus::Complete;
        store.upsert_evals(5, vec![done]).unwrap();

        let mut finished = alloc.clone();
        finished.client_status = AllocClientStatus::Complete;
        store.update_allocs_from_client(6, vec![finished]).unwrap();
        assert_eq!(
            store.snapshot().job_by_id(&job.id).unwrap().status,
            JobStatus::Dead
        );
    }

    #[test]
    fn eval_delete_marks_job_dead() {
        let store = StateStore::new();
        let job = mk_job();
        store.upsert_job(1, job.clone()).unwrap();

        let mut eval = mk_eval(&job);
        eval.status = EvalStatus::Complete;
        store.upsert_evals(2, vec![eval.clone()]).unwrap();

        store.delete_evals(3, &[eval.id.clone()], &[]).unwrap();

        let snap = store.snapshot();
        assert!(snap.eval_by_id(&eval.id).is_none());
        assert_eq!(snap.job_by_id(&job.id).unwrap().status, JobStatus::Dead);
        assert_eq!(snap.index(Table::Evals), 3);
        assert_eq!(snap.index(Table::Allocs), 3);
    }

    #[test]
    fn client_update_is_authoritative_for_client_fields_only() {
        let store = StateStore::new();
        let node = mk_node();
        let job = mk_job();
        store.upsert_node(1, node.clone()).unwrap();
        store.upsert_job(2, job.clone()).unwrap();
        let eval = mk_eval(&job);
        store.upsert_evals(3, vec![eval.clone()]).unwrap();

        let alloc = mk_alloc(&job, &node, &eval);
        store.upsert_allocs(4, vec![alloc.clone()]).unwrap();

        let mut update = alloc.clone();
        update.desired_status = AllocDesiredStatus::Stop; // must be ignored
        update.client_status = AllocClientStatus::Failed;
        update.client_description = "task exited".to_owned();
        store.update_allocs_from_client(5, vec![update]).unwrap();

        let row = store.snapshot().alloc_by_id(&alloc.id).unwrap();
        assert_eq!(row.desired_status, AllocDesiredStatus::Run);
        assert_eq!(row.client_status, AllocClientStatus::Failed);
        assert_eq!(row.client_description, "task exited");
        assert_eq!(row.modify_index, 5);
        assert_eq!(row.create_index, 4);

        // Terminal alloc plus pending eval: the job goes back to pending.
        assert_eq!(
            store.snapshot().job_by_id(&job.id).unwrap().status,
            JobStatus::Pending
        );
    }

    #[test]
    fn client_update_never_creates() {
        let store = StateStore::new();
        let node = mk_node();
        let job = mk_job();
        let eval = mk_eval(&job);
        let alloc = mk_alloc(&job, &node, &eval);

        store.update_allocs_from_client(1, vec![alloc.clone()]).unwrap();
        assert!(store.snapshot().alloc_by_id(&alloc.id).is_none());
    }

    #[test]
    fn server_upsert_preserves_client_fields() {
        let store = StateStore::new();
        let node = mk_node();
        let job = mk_job();
        store.upsert_node(1, node.clone()).unwrap();
        store.upsert_job(2, job.clone()).unwrap();
        let eval = mk_eval(&job);
        store.upsert_evals(3, vec![eval.clone()]).unwrap();

        let alloc = mk_alloc(&job, &node, &eval);
        store.upsert_allocs(4, vec![alloc.clone()]).unwrap();

        let mut client = alloc.clone();
        client.client_status = AllocClientStatus::Running;
        store.update_allocs_from_client(5, vec![client]).unwrap();

        // Scheduler re-submits the alloc; the client-observed state must
        // survive.
        let mut server = alloc.clone();
        server.client_status = AllocClientStatus::Pending;
        store.upsert_allocs(6, vec![server]).unwrap();

        let row = store.snapshot().alloc_by_id(&alloc.id).unwrap();
        assert_eq!(row.client_status, AllocClientStatus::Running);
        assert_eq!(row.alloc_modify_index, 6);
    }

    #[test]
    fn prefix_and_relation_queries() {
        let store = StateStore::new();
        let mut node = mk_node();
        node.id = "aaa-node".to_owned();
        let mut other = mk_node();
        other.id = "bbb-node".to_owned();
        store.upsert_node(1, node.clone()).unwrap();
        store.upsert_node(2, other).unwrap();

        let snap = store.snapshot();
        assert_eq!(snap.nodes_by_id_prefix("aaa").len(), 1);
        assert_eq!(snap.nodes_by_id_prefix("zzz").len(), 0);
        assert_eq!(snap.nodes().len(), 2);

        let job = mk_job();
        store.upsert_job(3, job.clone()).unwrap();
        let eval = mk_eval(&job);
        store.upsert_evals(4, vec![eval.clone()]).unwrap();
        let alloc = mk_alloc(&job, &node, &eval);
        store.upsert_allocs(5, vec![alloc.clone()]).unwrap();

        let snap = store.snapshot();
        assert_eq!(snap.evals_by_job(&job.id).len(), 1);
        assert_eq!(snap.allocs_by_job(&job.id).len(), 1);
        assert_eq!(snap.allocs_by_eval(&eval.id).len(), 1);
        assert_eq!(snap.allocs_by_node(&node.id).len(), 1);
        assert_eq!(snap.allocs_by_node_terminal(&node.id, false).len(), 1);
        assert_eq!(snap.allocs_by_node_terminal(&node.id, true).len(), 0);
    }

    #[test]
    fn gc_index_reflects_job_eligibility() {
        let store = StateStore::new();
        let job = mk_job();
        store.upsert_job(1, job.clone()).unwrap();

        assert!(store.snapshot().jobs_by_gc(true).is_empty());

        // Terminal eval, then delete it: the job becomes dead and GC
        // eligible.
        let mut eval = mk_eval(&job);
        eval.status = EvalStatus::Complete;
        store.upsert_evals(2, vec![eval.clone()]).unwrap();
        store.delete_evals(3, &[eval.id], &[]).unwrap();

        let gc = store.snapshot().jobs_by_gc(true);
        assert_eq!(gc.len(), 1);
        assert_eq!(gc[0].id, job.id);
    }

    #[test]
    fn stale_index_is_rejected() {
        let store = StateStore::new();
        store.upsert_node(5, mk_node()).unwrap();

        let err = store.upsert_node(4, mk_node()).unwrap_err();
        assert!(matches!(err, StateError::StaleIndex { current: 5, .. }));
    }

    #[tokio::test]
    async fn commit_notifies_watchers() {
        let store = StateStore::new();
        let (tx, mut rx) = mpsc::channel(1);

        let items: WatchSet = [WatchItem::Table(Table::Nodes)].into_iter().collect();
        store.subscribe(&items, &tx);

        store.upsert_node(1, mk_node()).unwrap();

        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("watch notification should fire")
            .expect("channel open");
    }

    #[tokio::test]
    async fn aborted_restore_has_no_effect() {
        let store = StateStore::new();
        let node = mk_node();
        {
            let mut restore = store.restore();
            restore.node(node.clone());
            restore.abort();
        }
        assert!(store.snapshot().node_by_id(&node.id).is_none());
    }

    #[tokio::test]
    async fn restore_publishes_once() {
        let store = StateStore::new();
        let (tx, mut rx) = mpsc::channel(1);
        let items: WatchSet = [WatchItem::Table(Table::Jobs)].into_iter().collect();
        store.subscribe(&items, &tx);

        let node = mk_node();
        let mut job = mk_job();
        job.create_index = 7;
        job.modify_index = 9;

        let mut restore = store.restore();
        restore.node(node.clone());
        restore.job(job.clone());
        restore.index(Table::Nodes, 9);
        restore.index(Table::Jobs, 9);
        restore.commit();

        let snap = store.snapshot();
        assert!(snap.node_by_id(&node.id).is_some());
        let row = snap.job_by_id(&job.id).unwrap();
        assert_eq!(row.create_index, 7);
        assert_eq!(row.modify_index, 9);
        assert_eq!(snap.index(Table::Jobs), 9);

        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("restore commit should notify")
            .expect("channel open");
    }
}
