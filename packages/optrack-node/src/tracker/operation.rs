//! Tracked operations.
//!
//! An [`Operation`] is one in-flight unit of work: an immutable type tag, an
//! id unique among live operations of the same kind, the list of blockers it
//! is currently attributed as waiting on, and retry bookkeeping used by the
//! repeat sequencer. Operations are held by shared ownership (`OpRef`)
//! across every suspension point they pass through.

use std::fmt;
use std::sync::Arc;

use optrack_core::{OpKind, OperationDump};
use parking_lot::Mutex;

use super::blocker::{Blocker, BlockingFuture};
use super::interrupt::{InterruptCondition, Interrupted};

/// Shared handle to a tracked operation.
pub type OpRef = Arc<Operation>;

// ---------------------------------------------------------------------------
// OpDetail trait
// ---------------------------------------------------------------------------

/// Dispatcher-supplied subtype of a tracked operation.
///
/// The dispatcher constructs one of these per inbound request; the tracking
/// core only reads the kind tag and the diagnostic detail.
pub trait OpDetail: Send + Sync + 'static {
    /// Static type tag for this operation.
    fn kind(&self) -> OpKind;

    /// Subtype-specific state included in dumps.
    fn dump_detail(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

// ---------------------------------------------------------------------------
// Retry state
// ---------------------------------------------------------------------------

/// Per-operation retry bookkeeping maintained by the repeat sequencer.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RetryState {
    /// Current attempt number; `None` before the first attempt begins.
    pub attempt: Option<u64>,
    /// Whether the current attempt has started executing.
    pub started: bool,
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// One tracked in-flight unit of work.
pub struct Operation {
    kind: OpKind,
    id: u64,
    detail: Box<dyn OpDetail>,
    blockers: Mutex<Vec<Arc<dyn Blocker>>>,
    retry: Mutex<RetryState>,
    /// Key of this operation's entry in a repeat sequencer's ordering map,
    /// while it has one.
    seq_key: Mutex<Option<u64>>,
}

impl Operation {
    pub(crate) fn new(id: u64, detail: Box<dyn OpDetail>) -> Self {
        Self {
            kind: detail.kind(),
            id,
            detail,
            blockers: Mutex::new(Vec::new()),
            retry: Mutex::new(RetryState::default()),
            seq_key: Mutex::new(None),
        }
    }

    /// Static type tag.
    #[must_use]
    pub fn kind(&self) -> OpKind {
        self.kind
    }

    /// Id, unique among live operations of the same kind.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Awaits `f`, attributing its blocker to this operation for the
    /// duration of the suspension.
    ///
    /// An already-resolved future passes through with no attribution. The
    /// attribution is removed on every exit path (success, error carried in
    /// `T`, or cancellation of the returned future) before the result
    /// propagates.
    pub async fn with_blocking_future<T>(&self, f: BlockingFuture<T>) -> T {
        let BlockingFuture { blocker, fut } = f;
        match blocker {
            None => fut.await,
            Some(blocker) => {
                let _guard = self.attribute(blocker);
                fut.await
            }
        }
    }

    /// Like [`Operation::with_blocking_future`], but polls `cond` at the
    /// suspension point: on entry before awaiting, and again once the wait
    /// resolves. An interrupted wait discards the resolved value (dropping
    /// any resource it carried, which releases it).
    pub async fn with_blocking_future_interruptible<T>(
        &self,
        cond: &dyn InterruptCondition,
        f: BlockingFuture<T>,
    ) -> Result<T, Interrupted> {
        cond.check()?;
        let value = self.with_blocking_future(f).await;
        cond.check()?;
        Ok(value)
    }

    /// Snapshot of this operation for the diagnostic sink.
    #[must_use]
    pub fn dump(&self) -> OperationDump {
        OperationDump {
            kind: self.kind,
            id: self.id,
            blockers: self.blockers.lock().iter().map(|b| b.dump()).collect(),
            detail: self.detail.dump_detail(),
        }
    }

    fn attribute(&self, blocker: Arc<dyn Blocker>) -> AttributionGuard<'_> {
        self.blockers.lock().push(Arc::clone(&blocker));
        AttributionGuard { op: self, blocker }
    }

    fn clear_blocker(&self, blocker: &Arc<dyn Blocker>) {
        let mut blockers = self.blockers.lock();
        if let Some(pos) = blockers.iter().position(|b| Arc::ptr_eq(b, blocker)) {
            blockers.remove(pos);
        }
    }

    // Retry bookkeeping, driven by the repeat sequencer.

    pub(crate) fn retry_snapshot(&self) -> RetryState {
        *self.retry.lock()
    }

    /// Begins a new attempt: bumps the attempt counter and clears the
    /// started flag. Returns the new attempt number (0 for the first).
    pub(crate) fn begin_attempt(&self) -> u64 {
        let mut retry = self.retry.lock();
        let attempt = retry.attempt.map_or(0, |a| a + 1);
        retry.attempt = Some(attempt);
        retry.started = false;
        attempt
    }

    pub(crate) fn mark_attempt_started(&self) {
        self.retry.lock().started = true;
    }

    /// Staircase adoption: takes over the predecessor's attempt count so a
    /// less-retried operation is never overtaken.
    pub(crate) fn adopt_attempt(&self, attempt: u64) {
        self.retry.lock().attempt = Some(attempt);
    }

    pub(crate) fn seq_key(&self) -> Option<u64> {
        *self.seq_key.lock()
    }

    pub(crate) fn set_seq_key(&self, key: Option<u64>) {
        *self.seq_key.lock() = key;
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind.name(), self.id)
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Removes an attribution when the suspension ends, whichever way it ends.
/// Drop runs on cancellation too, so diagnostic state never references a
/// completed or abandoned wait.
struct AttributionGuard<'a> {
    op: &'a Operation,
    blocker: Arc<dyn Blocker>,
}

impl Drop for AttributionGuard<'_> {
    fn drop(&mut self) {
        self.op.clear_blocker(&self.blocker);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::super::blocker::BlockerExt;
    use super::*;

    struct TestOp(OpKind);

    impl OpDetail for TestOp {
        fn kind(&self) -> OpKind {
            self.0
        }
    }

    struct StepBlocker;

    impl Blocker for StepBlocker {
        fn kind(&self) -> &'static str {
            "step"
        }
    }

    fn make_op(id: u64) -> OpRef {
        Arc::new(Operation::new(id, Box::new(TestOp(OpKind::ClientRequest))))
    }

    #[tokio::test]
    async fn ready_future_passes_through_without_attribution() {
        let op = make_op(0);
        let value = op.with_blocking_future(BlockingFuture::ready(7u32)).await;
        assert_eq!(value, 7);
        assert!(op.dump().blockers.is_empty());
    }

    #[tokio::test]
    async fn attribution_present_while_pending_and_cleared_after() {
        let op = make_op(0);
        let blocker = Arc::new(StepBlocker);
        let (tx, rx) = oneshot::channel::<u32>();
        let bf = blocker.make_blocking_future(async move { rx.await.unwrap() });

        let waiter = tokio::spawn({
            let op = Arc::clone(&op);
            async move { op.with_blocking_future(bf).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let dump = op.dump();
        assert_eq!(dump.blockers.len(), 1);
        assert_eq!(dump.blockers[0].kind, "step");

        tx.send(9).unwrap();
        assert_eq!(waiter.await.unwrap(), 9);
        assert!(op.dump().blockers.is_empty());
    }

    #[tokio::test]
    async fn attribution_cleared_when_wait_is_cancelled() {
        let op = make_op(0);
        let blocker = Arc::new(StepBlocker);
        let (_tx, rx) = oneshot::channel::<u32>();
        let bf = blocker.make_blocking_future(async move { rx.await.unwrap() });

        let waiter = tokio::spawn({
            let op = Arc::clone(&op);
            async move { op.with_blocking_future(bf).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(op.dump().blockers.len(), 1);

        waiter.abort();
        let _ = waiter.await;
        assert!(op.dump().blockers.is_empty());
    }

    #[tokio::test]
    async fn error_results_flow_through_with_attribution_released() {
        let op = make_op(0);
        let blocker = Arc::new(StepBlocker);
        let bf: BlockingFuture<anyhow::Result<u32>> =
            blocker.make_blocking_future(async { anyhow::bail!("disk offline") });
        let result = op.with_blocking_future(bf).await;
        assert!(result.is_err());
        assert!(op.dump().blockers.is_empty());
    }

    #[tokio::test]
    async fn interruption_during_wait_is_detected_after_resolution() {
        use std::sync::atomic::{AtomicBool, Ordering};

        struct StopCondition(Arc<AtomicBool>);

        impl InterruptCondition for StopCondition {
            fn may_interrupt(&self) -> Option<Interrupted> {
                self.0
                    .load(Ordering::SeqCst)
                    .then_some(Interrupted::ShuttingDown)
            }
        }

        #[derive(Debug)]
        struct DropFlag(Arc<AtomicBool>);

        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let op = make_op(0);
        let blocker = Arc::new(StepBlocker);
        let stopping = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicBool::new(false));
        let (tx, rx) = oneshot::channel::<DropFlag>();
        let bf = blocker.make_blocking_future(async move { rx.await.unwrap() });

        let waiter = tokio::spawn({
            let op = Arc::clone(&op);
            let cond = StopCondition(Arc::clone(&stopping));
            async move {
                op.with_blocking_future_interruptible(&cond, bf)
                    .await
                    .map(|_| ())
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(op.dump().blockers.len(), 1);

        // The condition fires while the wait is pending; only the check on
        // the far side of the suspension can observe it.
        stopping.store(true, Ordering::SeqCst);
        tx.send(DropFlag(Arc::clone(&dropped))).unwrap();

        assert_eq!(waiter.await.unwrap(), Err(Interrupted::ShuttingDown));
        // The resolved value was discarded, releasing what it carried.
        assert!(dropped.load(Ordering::SeqCst));
        assert!(op.dump().blockers.is_empty());
    }

    #[test]
    fn retry_bookkeeping_counts_attempts() {
        let op = make_op(3);
        assert!(op.retry_snapshot().attempt.is_none());
        assert_eq!(op.begin_attempt(), 0);
        assert!(!op.retry_snapshot().started);
        op.mark_attempt_started();
        assert!(op.retry_snapshot().started);
        assert_eq!(op.begin_attempt(), 1);
        assert!(!op.retry_snapshot().started);
        op.adopt_attempt(5);
        assert_eq!(op.retry_snapshot().attempt, Some(5));
    }

    #[test]
    fn display_names_kind_and_id() {
        let op = make_op(12);
        assert_eq!(op.to_string(), "client_request#12");
    }
}
