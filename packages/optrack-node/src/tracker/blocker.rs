//! Blocker attribution: "what is this operation waiting on?"
//!
//! Every suspension point that can stall an operation is owned by a
//! [`Blocker`]. A [`BlockingFuture`] pairs the eventual value with the
//! blocker responsible for producing it, so the operation awaiting it can
//! attribute the wait for the duration of the suspension and the diagnostic
//! sink can reconstruct full waiting chains.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use optrack_core::BlockerDump;

// ---------------------------------------------------------------------------
// Blocker trait
// ---------------------------------------------------------------------------

/// A reason an operation may be suspended.
///
/// The set of blocker kinds is open: every pipeline phase and throttler is
/// its own blocker, and new kinds can be added without touching this module.
pub trait Blocker: Send + Sync + 'static {
    /// Kind name reported in dumps (phase name, `"throttle"`, ...).
    fn kind(&self) -> &'static str;

    /// Kind-specific state (queue depth, slot counts, ...).
    fn dump_detail(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Blockers owned by this one, recursively dumped. Leaf blockers have
    /// none.
    fn children(&self) -> Vec<BlockerDump> {
        Vec::new()
    }

    /// Full dump of this blocker and everything it owns.
    fn dump(&self) -> BlockerDump {
        BlockerDump {
            kind: self.kind().to_string(),
            detail: self.dump_detail(),
            children: self.children(),
        }
    }
}

/// Extension methods available on every concrete blocker held in an `Arc`.
pub trait BlockerExt: Blocker + Sized {
    /// Wraps `fut` together with this blocker as the attributed reason for
    /// the wait.
    fn make_blocking_future<T, F>(self: &Arc<Self>, fut: F) -> BlockingFuture<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        BlockingFuture {
            blocker: Some(Arc::clone(self) as Arc<dyn Blocker>),
            fut: fut.boxed(),
        }
    }
}

impl<B: Blocker> BlockerExt for B {}

// ---------------------------------------------------------------------------
// BlockingFuture
// ---------------------------------------------------------------------------

/// An eventual value plus the blocker responsible for producing it.
///
/// Ownership of the blocker attribution moves with the future: whichever
/// operation (or aggregate) currently holds the future is the one that
/// reports it.
pub struct BlockingFuture<T> {
    pub(crate) blocker: Option<Arc<dyn Blocker>>,
    pub(crate) fut: BoxFuture<'static, T>,
}

impl<T: Send + 'static> BlockingFuture<T> {
    /// An already-resolved value with no blocker: awaiting it never records
    /// an attribution.
    #[must_use]
    pub fn ready(value: T) -> Self {
        Self {
            blocker: None,
            fut: std::future::ready(value).boxed(),
        }
    }

    /// The blocker that will be attributed while this future is pending, if
    /// any.
    #[must_use]
    pub fn blocker(&self) -> Option<&Arc<dyn Blocker>> {
        self.blocker.as_ref()
    }

    /// Transforms the eventual value, keeping the same attribution.
    #[must_use]
    pub fn map<U, F>(self, f: F) -> BlockingFuture<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        BlockingFuture {
            blocker: self.blocker,
            fut: self.fut.map(f).boxed(),
        }
    }

    /// Awaits the value without recording any attribution. Operations go
    /// through `Operation::with_blocking_future` instead.
    pub async fn wait(self) -> T {
        self.fut.await
    }
}

// ---------------------------------------------------------------------------
// AggregateBlocker
// ---------------------------------------------------------------------------

/// Fan-in blocker owning the blockers of several concurrent sub-waits.
///
/// Lets an operation register exactly one attribution for an arbitrary
/// number of concurrent sub-futures; `dump` enumerates every owned blocker.
pub struct AggregateBlocker {
    blockers: Vec<Arc<dyn Blocker>>,
}

impl AggregateBlocker {
    /// Number of owned sub-blockers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blockers.len()
    }

    /// True when no sub-blockers are owned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blockers.is_empty()
    }
}

impl Blocker for AggregateBlocker {
    fn kind(&self) -> &'static str {
        "aggregate"
    }

    fn dump_detail(&self) -> serde_json::Value {
        serde_json::json!({ "count": self.len() })
    }

    fn children(&self) -> Vec<BlockerDump> {
        self.blockers.iter().map(|b| b.dump()).collect()
    }
}

/// Joins several blocking futures into one that resolves when the last
/// input resolves.
///
/// Each input's blocker is taken over by a single [`AggregateBlocker`], so a
/// sub-wait is never reported twice. Inputs that were already resolved (no
/// blocker) contribute no child.
#[must_use]
pub fn join_blocking_futures<T: Send + 'static>(
    futures: Vec<BlockingFuture<T>>,
) -> BlockingFuture<Vec<T>> {
    let mut futures = futures;
    let owned: Vec<Arc<dyn Blocker>> = futures
        .iter_mut()
        .filter_map(|bf| bf.blocker.take())
        .collect();
    let joined = futures_util::future::join_all(futures.into_iter().map(|bf| bf.fut));
    if owned.is_empty() {
        return BlockingFuture {
            blocker: None,
            fut: joined.boxed(),
        };
    }
    let agg = Arc::new(AggregateBlocker { blockers: owned });
    agg.make_blocking_future(joined)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
