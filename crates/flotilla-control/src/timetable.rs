//! Coarse mapping between wall-clock time and log indexes.
//!
//! The garbage collector expresses its thresholds as ages ("collect
//! evaluations idle for an hour") but the store is versioned by log
//! index. The time table witnesses `(index, time)` pairs as the log
//! applies requests and answers best-effort "what index was the log at,
//! at time T" queries.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// Witness table of `(index, wall-clock)` pairs, newest first.
#[derive(Debug)]
pub struct TimeTable {
    granularity: chrono::Duration,
    limit: chrono::Duration,
    entries: RwLock<VecDeque<(u64, DateTime<Utc>)>>,
}

impl TimeTable {
    /// Creates a table that records at most one entry per `granularity`
    /// and discards entries older than `limit`.
    #[must_use]
    pub fn new(granularity: Duration, limit: Duration) -> Self {
        Self {
            granularity: chrono::Duration::from_std(granularity)
                .unwrap_or_else(|_| chrono::Duration::minutes(1)),
            limit: chrono::Duration::from_std(limit)
                .unwrap_or_else(|_| chrono::Duration::hours(72)),
            entries: RwLock::new(VecDeque::new()),
        }
    }

    /// Records that the log was at `index` at time `when`. Entries
    /// arriving within the granularity of the newest entry are dropped.
    pub fn witness(&self, index: u64, when: DateTime<Utc>) {
        let mut entries = self.entries.write();

        if let Some((_, newest)) = entries.front() {
            if when - *newest < self.granularity {
                return;
            }
        }
        entries.push_front((index, when));

        let horizon = when - self.limit;
        while entries
            .back()
            .is_some_and(|(_, recorded)| *recorded < horizon)
        {
            entries.pop_back();
        }
    }

    /// Returns the greatest witnessed index at or before `when`, zero if
    /// nothing that old was witnessed.
    #[must_use]
    pub fn nearest_index(&self, when: DateTime<Utc>) -> u64 {
        let entries = self.entries.read();
        entries
            .iter()
            .find(|(_, recorded)| *recorded <= when)
            .map(|(index, _)| *index)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_index_finds_witnessed_entry() {
        let table = TimeTable::new(Duration::from_secs(1), Duration::from_secs(3600));
        let base = Utc::now();

        table.witness(10, base);
        table.witness(20, base + chrono::Duration::seconds(10));
        table.witness(30, base + chrono::Duration::seconds(20));

        assert_eq!(table.nearest_index(base + chrono::Duration::seconds(5)), 10);
        assert_eq!(table.nearest_index(base + chrono::Duration::seconds(15)), 20);
        assert_eq!(table.nearest_index(base + chrono::Duration::seconds(60)), 30);
    }

    #[test]
    fn nearest_index_is_zero_before_first_witness() {
        let table = TimeTable::new(Duration::from_secs(1), Duration::from_secs(3600));
        let base = Utc::now();

        table.witness(10, base);
        assert_eq!(table.nearest_index(base - chrono::Duration::seconds(1)), 0);
    }

    #[test]
    fn granularity_coalesces_entries() {
        let table = TimeTable::new(Duration::from_secs(60), Duration::from_secs(3600));
        let base = Utc::now();

        table.witness(10, base);
        table.witness(11, base + chrono::Duration::seconds(1));
        table.witness(12, base + chrono::Duration::seconds(2));

        // Entries within the granularity window were dropped.
        assert_eq!(table.nearest_index(base + chrono::Duration::seconds(30)), 10);
    }

    #[test]
    fn old_entries_are_trimmed() {
        let table = TimeTable::new(Duration::from_secs(1), Duration::from_secs(100));
        let base = Utc::now();

        table.witness(10, base);
        table.witness(20, base + chrono::Duration::seconds(200));

        // The first entry fell outside the retention limit.
        assert_eq!(table.nearest_index(base + chrono::Duration::seconds(1)), 0);
    }
}
