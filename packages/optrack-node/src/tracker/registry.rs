//! Registry of live operations.
//!
//! Tracks membership (not ownership) of every in-flight operation, grouped
//! by kind, and assigns per-kind monotonic ids. Membership is held by weak
//! reference, so it lapses automatically when the last `OpRef` is dropped;
//! there is no explicit unregister call to forget.

use std::sync::{Arc, Weak};
use std::time::Duration;

use optrack_core::{OpKind, OperationDump};
use parking_lot::Mutex;
use tracing::info;

use crate::config::EngineConfig;

use super::operation::{OpDetail, OpRef, Operation};

// ---------------------------------------------------------------------------
// OperationRegistry
// ---------------------------------------------------------------------------

/// Per-shard registry of live operations.
///
/// One instance is created per shard and injected into the dispatcher; two
/// shards never share a registry.
pub struct OperationRegistry {
    inner: Mutex<Inner>,
    drain_poll: Duration,
}

struct Inner {
    /// Live-operation membership per kind, indexed by `OpKind::index`.
    live: [Vec<Weak<Operation>>; OpKind::COUNT],
    /// Next id per kind. Ids are never reused within a registry.
    next_id: [u64; OpKind::COUNT],
}

impl OperationRegistry {
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                live: std::array::from_fn(|_| Vec::new()),
                next_id: [0; OpKind::COUNT],
            }),
            drain_poll: Duration::from_millis(config.drain_poll_interval_ms),
        }
    }

    /// Creates a tracked operation, assigns it the next id for its kind, and
    /// records its membership. No two live operations of the same kind ever
    /// share an id.
    pub fn create_operation<D: OpDetail>(&self, detail: D) -> OpRef {
        let mut inner = self.inner.lock();
        let idx = detail.kind().index();
        let id = inner.next_id[idx];
        inner.next_id[idx] += 1;
        let op = Arc::new(Operation::new(id, Box::new(detail)));
        let collection = &mut inner.live[idx];
        collection.retain(|weak| weak.strong_count() > 0);
        collection.push(Arc::downgrade(&op));
        op
    }

    /// Number of live operations of the given kind.
    #[must_use]
    pub fn live_count(&self, kind: OpKind) -> usize {
        self.inner.lock().live[kind.index()]
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Resolves once every kind-collection is empty.
    ///
    /// Operations complete independently from many interleaved suspension
    /// points, so there is no single completion signal to await; drain is
    /// detected by polling at the configured interval.
    pub async fn stop(&self) {
        let mut tick = tokio::time::interval(self.drain_poll);
        loop {
            tick.tick().await;
            if self.total_live() == 0 {
                info!("operation registry drained");
                return;
            }
        }
    }

    /// Snapshot of every live operation, for the diagnostic sink.
    #[must_use]
    pub fn dump_ops(&self) -> Vec<OperationDump> {
        self.inner
            .lock()
            .live
            .iter()
            .flatten()
            .filter_map(Weak::upgrade)
            .map(|op| op.dump())
            .collect()
    }

    fn total_live(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut total = 0;
        for collection in &mut inner.live {
            collection.retain(|weak| weak.strong_count() > 0);
            total += collection.len();
        }
        total
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
