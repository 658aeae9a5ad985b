//! RPC-surface services.
//!
//! Each service mirrors one section of the RPC surface: validation,
//! write-through-the-log, post-commit evaluation creation, and blocking
//! reads. The HTTP/API layer is a thin collaborator over these types.

pub mod alloc;
pub mod eval;
pub mod job;
pub mod node;

pub use alloc::AllocService;
pub use eval::EvalService;
pub use job::JobService;
pub use node::NodeService;

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use flotilla_proto::{QueryMeta, QueryOptions};
use flotilla_state::{StateSnapshot, StateStore, Table, WatchSet};

/// Ceiling on how long a blocking query may wait.
pub(crate) const MAX_BLOCKING_WAIT: Duration = Duration::from_secs(300);

/// Runs a read with blocking-query semantics.
///
/// If the caller supplied a `min_query_index` and the table has not
/// passed it, the read subscribes to the given watch items and waits for
/// a change or the deadline before re-reading. The response always
/// carries the table's current index, whether or not data changed.
pub(crate) async fn blocking_query<T>(
    store: &StateStore,
    table: Table,
    items: WatchSet,
    opts: &QueryOptions,
    known_leader: bool,
    read: impl Fn(&StateSnapshot) -> T,
) -> (T, QueryMeta) {
    let respond = |value: T, index: u64| {
        (
            value,
            QueryMeta {
                index,
                known_leader,
                last_contact_millis: 0,
            },
        )
    };

    let mut wait = opts.max_query_time();
    if wait.is_zero() || wait > MAX_BLOCKING_WAIT {
        wait = MAX_BLOCKING_WAIT;
    }
    let deadline = Instant::now() + wait;

    loop {
        let snap = store.snapshot();
        let index = snap.index(table);
        if opts.min_query_index == 0 || index > opts.min_query_index {
            return respond(read(&snap), index);
        }

        let (tx, mut rx) = mpsc::channel(1);
        store.subscribe(&items, &tx);

        // Re-read after subscribing: a commit between the first read and
        // the subscription would otherwise be missed.
        let snap = store.snapshot();
        let index = snap.index(table);
        if index > opts.min_query_index {
            store.unsubscribe(&items, &tx);
            return respond(read(&snap), index);
        }

        let timed_out = tokio::select! {
            _ = rx.recv() => false,
            () = tokio::time::sleep_until(deadline) => true,
        };
        store.unsubscribe(&items, &tx);

        if timed_out {
            let snap = store.snapshot();
            let index = snap.index(table);
            return respond(read(&snap), index);
        }
    }
}
