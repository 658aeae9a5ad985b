//! Watch hub mapping state items to waiting readers.
//!
//! Blocking queries register a set of [`WatchItem`]s with a capacity-1
//! signal channel. A commit that touches any registered item fires the
//! signal once and clears the registration; delivery is best-effort
//! (`try_send`), so a waiter whose slot is already full simply re-reads.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Tables managed by the state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// Worker nodes.
    Nodes,
    /// Workload definitions.
    Jobs,
    /// Scheduling intents.
    Evals,
    /// Placement decisions.
    Allocs,
    /// Last-dispatch records for periodic jobs.
    PeriodicLaunches,
}

impl Table {
    /// Name of the table's row in the index table.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Nodes => "nodes",
            Self::Jobs => "jobs",
            Self::Evals => "evals",
            Self::Allocs => "allocs",
            Self::PeriodicLaunches => "periodic_launch",
        }
    }
}

/// A single watchable item.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatchItem {
    /// Any change to the given table.
    Table(Table),
    /// A specific node row.
    Node(String),
    /// A specific job row.
    Job(String),
    /// A specific evaluation row.
    Eval(String),
    /// A specific allocation row.
    Alloc(String),
    /// Any allocation belonging to the given evaluation.
    AllocEval(String),
    /// Any allocation belonging to the given job.
    AllocJob(String),
    /// Any allocation placed on the given node.
    AllocNode(String),
}

/// A set of watch items registered or notified together.
#[derive(Debug, Clone, Default)]
pub struct WatchSet {
    items: HashSet<WatchItem>,
}

impl WatchSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an item to the set.
    pub fn add(&mut self, item: WatchItem) {
        self.items.insert(item);
    }

    /// Iterates the items in the set.
    pub fn iter(&self) -> impl Iterator<Item = &WatchItem> {
        self.items.iter()
    }

    /// Returns true if the set holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl FromIterator<WatchItem> for WatchSet {
    fn from_iter<I: IntoIterator<Item = WatchItem>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

/// Maps watch items to waiting signal channels.
#[derive(Debug, Default)]
pub struct WatchHub {
    waiters: Mutex<HashMap<WatchItem, Vec<mpsc::Sender<()>>>>,
}

impl WatchHub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a signal channel for every item in the set.
    ///
    /// The same channel may back several items; the first matching notify
    /// fires it.
    pub fn subscribe(&self, items: &WatchSet, signal: &mpsc::Sender<()>) {
        let mut waiters = self.waiters.lock();
        for item in items.iter() {
            waiters.entry(item.clone()).or_default().push(signal.clone());
        }
    }

    /// Removes a signal channel from every item in the set.
    pub fn unsubscribe(&self, items: &WatchSet, signal: &mpsc::Sender<()>) {
        let mut waiters = self.waiters.lock();
        for item in items.iter() {
            if let Some(senders) = waiters.get_mut(item) {
                senders.retain(|s| !s.same_channel(signal));
                if senders.is_empty() {
                    waiters.remove(item);
                }
            }
        }
    }

    /// Fires every waiter registered for an item in the set, then clears
    /// those registrations. A full signal slot is a no-op.
    pub fn notify(&self, items: &WatchSet) {
        let mut fired = Vec::new();
        {
            let mut waiters = self.waiters.lock();
            for item in items.iter() {
                if let Some(senders) = waiters.remove(item) {
                    fired.extend(senders);
                }
            }
        }
        for sender in fired {
            let _ = sender.try_send(());
        }
    }
}
