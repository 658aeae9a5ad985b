//! Heartbeat TTL tracking for registered nodes.

use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::Instant;

use crate::config::HeartbeatConfig;

/// Tracks per-node heartbeat deadlines.
///
/// Each registration or status update grants the node a TTL jittered
/// into `[min, 2*min)` so renewals spread out. A periodic sweep collects
/// nodes whose deadline passed; the control plane marks those down.
/// Heartbeats are only tracked while the server is leader.
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    deadlines: DashMap<String, Instant>,
    enabled: AtomicBool,
    rng: Mutex<SmallRng>,
}

impl std::fmt::Debug for HeartbeatManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatManager")
            .field("tracked", &self.deadlines.len())
            .finish()
    }
}

impl HeartbeatManager {
    /// Creates a disabled manager.
    #[must_use]
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            deadlines: DashMap::new(),
            enabled: AtomicBool::new(false),
            rng: Mutex::new(SmallRng::from_entropy()),
        }
    }

    /// Enables or disables tracking. Disabling clears all deadlines.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.deadlines.clear();
        }
    }

    /// Grants a node a fresh TTL and tracks its deadline. The TTL is
    /// returned even when tracking is disabled so followers can still
    /// answer registrations.
    pub fn reset(&self, node_id: &str) -> Duration {
        let ttl = self.next_ttl();
        if self.enabled.load(Ordering::SeqCst) {
            self.deadlines
                .insert(node_id.to_owned(), Instant::now() + ttl);
        }
        ttl
    }

    /// Stops tracking a node.
    pub fn remove(&self, node_id: &str) {
        self.deadlines.remove(node_id);
    }

    /// Removes and returns every node whose deadline passed.
    pub fn take_expired(&self) -> Vec<String> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .deadlines
            .iter()
            .filter(|entry| *entry.value() <= now)
            .map(|entry| entry.key().clone())
            .collect();
        for node_id in &expired {
            self.deadlines.remove(node_id);
        }
        expired
    }

    /// Number of tracked nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    /// Returns true if no nodes are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    fn next_ttl(&self) -> Duration {
        let min = self.config.min_heartbeat_ttl;
        let jitter_millis = u64::try_from(min.as_millis()).unwrap_or(u64::MAX);
        if jitter_millis == 0 {
            return min;
        }
        let jitter = self.rng.lock().gen_range(0..jitter_millis);
        min + Duration::from_millis(jitter)
    }
}
