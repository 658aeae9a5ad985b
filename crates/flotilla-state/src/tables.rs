//! Copy-on-write table set backing the state store.
//!
//! Each table is an ordered map behind its own `Arc`; cloning the set is
//! a handful of reference bumps, and a write transaction only deep-clones
//! the tables it actually touches (`Arc::make_mut`). Rows themselves are
//! `Arc`-wrapped so a cloned table shares them structurally.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use flotilla_proto::{Allocation, Evaluation, Job, Node, PeriodicLaunch};

use crate::watch::Table;

/// The complete, immutable-once-published state of the store.
#[derive(Debug, Clone, Default)]
pub(crate) struct Tables {
    pub nodes: Arc<BTreeMap<String, Arc<Node>>>,
    pub jobs: Arc<BTreeMap<String, Arc<Job>>>,
    pub evals: Arc<BTreeMap<String, Arc<Evaluation>>>,
    pub allocs: Arc<BTreeMap<String, Arc<Allocation>>>,
    pub periodic_launches: Arc<BTreeMap<String, Arc<PeriodicLaunch>>>,

    /// Per-table maximum `modify_index` ever written.
    pub indexes: Arc<BTreeMap<&'static str, u64>>,

    // Foreign-key adjacency, maintained in the same transaction as the
    // rows they index.
    pub evals_by_job: Arc<BTreeMap<String, BTreeSet<String>>>,
    pub allocs_by_job: Arc<BTreeMap<String, BTreeSet<String>>>,
    pub allocs_by_eval: Arc<BTreeMap<String, BTreeSet<String>>>,
    pub allocs_by_node: Arc<BTreeMap<String, BTreeSet<String>>>,
}

impl Tables {
    /// Returns the index row for a table, zero if never written.
    pub fn index(&self, table: Table) -> u64 {
        self.indexes.get(table.name()).copied().unwrap_or(0)
    }

    /// Sets the index row for a table.
    pub fn set_index(&mut self, table: Table, index: u64) {
        Arc::make_mut(&mut self.indexes).insert(table.name(), index);
    }

    pub fn insert_node(&mut self, node: Arc<Node>) {
        Arc::make_mut(&mut self.nodes).insert(node.id.clone(), node);
    }

    pub fn remove_node(&mut self, node_id: &str) -> Option<Arc<Node>> {
        Arc::make_mut(&mut self.nodes).remove(node_id)
    }

    pub fn insert_job(&mut self, job: Arc<Job>) {
        Arc::make_mut(&mut self.jobs).insert(job.id.clone(), job);
    }

    pub fn remove_job(&mut self, job_id: &str) -> Option<Arc<Job>> {
        Arc::make_mut(&mut self.jobs).remove(job_id)
    }

    pub fn insert_eval(&mut self, eval: Arc<Evaluation>) {
        link(&mut self.evals_by_job, &eval.job_id, &eval.id);
        Arc::make_mut(&mut self.evals).insert(eval.id.clone(), eval);
    }

    pub fn remove_eval(&mut self, eval_id: &str) -> Option<Arc<Evaluation>> {
        let eval = Arc::make_mut(&mut self.evals).remove(eval_id)?;
        unlink(&mut self.evals_by_job, &eval.job_id, eval_id);
        Some(eval)
    }

    pub fn insert_alloc(&mut self, alloc: Arc<Allocation>) {
        // Re-link in case a server-side update moved the allocation; the
        // key fields are stable in practice but the index must follow the
        // row.
        if let Some(old) = self.allocs.get(&alloc.id).cloned() {
            self.unlink_alloc(&old);
        }
        link(&mut self.allocs_by_job, &alloc.job_id, &alloc.id);
        link(&mut self.allocs_by_eval, &alloc.eval_id, &alloc.id);
        link(&mut self.allocs_by_node, &alloc.node_id, &alloc.id);
        Arc::make_mut(&mut self.allocs).insert(alloc.id.clone(), alloc);
    }

    pub fn remove_alloc(&mut self, alloc_id: &str) -> Option<Arc<Allocation>> {
        let alloc = Arc::make_mut(&mut self.allocs).remove(alloc_id)?;
        self.unlink_alloc(&alloc);
        Some(alloc)
    }

    fn unlink_alloc(&mut self, alloc: &Allocation) {
        unlink(&mut self.allocs_by_job, &alloc.job_id, &alloc.id);
        unlink(&mut self.allocs_by_eval, &alloc.eval_id, &alloc.id);
        unlink(&mut self.allocs_by_node, &alloc.node_id, &alloc.id);
    }

    pub fn insert_periodic_launch(&mut self, launch: Arc<PeriodicLaunch>) {
        Arc::make_mut(&mut self.periodic_launches).insert(launch.id.clone(), launch);
    }

    pub fn remove_periodic_launch(&mut self, job_id: &str) -> Option<Arc<PeriodicLaunch>> {
        Arc::make_mut(&mut self.periodic_launches).remove(job_id)
    }
}

fn link(index: &mut Arc<BTreeMap<String, BTreeSet<String>>>, key: &str, id: &str) {
    Arc::make_mut(index)
        .entry(key.to_owned())
        .or_default()
        .insert(id.to_owned());
}

fn unlink(index: &mut Arc<BTreeMap<String, BTreeSet<String>>>, key: &str, id: &str) {
    let map = Arc::make_mut(index);
    if let Some(ids) = map.get_mut(key) {
        ids.remove(id);
        if ids.is_empty() {
            map.remove(key);
        }
    }
}
