//! Retry ordering across a cohort of related operations.
//!
//! Operations sharing a logical resource retry independently, but their
//! attempts must not reorder: among entrants with pending retries, only the
//! earliest by id (or one whose immediate predecessor has already started
//! an attempt at least as retried as its own) may begin. A later entrant
//! that finds its predecessor ahead on retries adopts the predecessor's
//! retry count before proceeding (the staircase), so a less-retried
//! operation is never overtaken.

use std::collections::BTreeMap;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error};

use super::operation::OpRef;

// ---------------------------------------------------------------------------
// OperationRepeatSequencer
// ---------------------------------------------------------------------------

/// Ordering map for one cohort of independently retrying operations.
///
/// All entrants must be of the same operation kind: ids order the map, and
/// ids are only unique within a kind.
pub struct OperationRepeatSequencer {
    ops: Mutex<BTreeMap<u64, SeqEntry>>,
}

struct SeqEntry {
    op: OpRef,
    /// Fulfilled whenever this entrant starts an attempt and when its entry
    /// is removed; successors re-check their gate on each fulfillment.
    done: Arc<Notify>,
}

impl OperationRepeatSequencer {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ops: Mutex::new(BTreeMap::new()),
        })
    }

    /// Number of entrants currently in the ordering map.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.lock().len()
    }

    /// True when no entrants are being sequenced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.lock().is_empty()
    }

    /// Runs `func` in a retry loop under the cohort ordering discipline.
    ///
    /// `func` returning `Continue` retries; `Break` completes. On
    /// completion the operation's entry is removed and its completion
    /// signal fulfilled, unblocking the next entrant; this also happens if
    /// the loop unwinds. An error surfacing from `func` is a fatal
    /// invariant violation: mid-retry ordering state cannot be safely
    /// unwound, so after releasing successors this panics rather than
    /// continuing with possibly-corrupted order.
    pub async fn repeat<F, Fut>(self: &Arc<Self>, op: &OpRef, mut func: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<ControlFlow<()>>>,
    {
        let _cleanup = CohortCleanup {
            sequencer: Arc::clone(self),
            op: Arc::clone(op),
        };
        loop {
            self.wait_turn(op).await;
            match func().await {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(())) => return,
                Err(err) => {
                    error!(op = %op, error = %err, "retry body failed; ordering state is unrecoverable");
                    panic!("{op}: retry body failed: {err}");
                }
            }
        }
    }

    /// Blocks until `op` may begin its next attempt.
    async fn wait_turn(&self, op: &OpRef) {
        let attempt = op.begin_attempt();
        if op.seq_key().is_none() {
            debug_assert_eq!(attempt, 0);
            let mut ops = self.ops.lock();
            debug_assert!(!ops.contains_key(&op.id()), "id collision in sequencer cohort");
            ops.insert(
                op.id(),
                SeqEntry {
                    op: Arc::clone(op),
                    done: Arc::new(Notify::new()),
                },
            );
            op.set_seq_key(Some(op.id()));
        }
        loop {
            let Some(gate) = self.predecessor_gate(op) else {
                break;
            };
            let notified = gate.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            // The gate may have opened between the check and enable().
            if self.predecessor_gate(op).is_none() {
                break;
            }
            debug!(op = %op, attempt, "delaying on predecessor");
            notified.await;
        }
        op.mark_attempt_started();
        debug!(op = %op, attempt = ?op.retry_snapshot().attempt, "attempt starting");
        // Successors gate on the started flag; wake them to re-check.
        let done = self.ops.lock().get(&op.id()).map(|entry| Arc::clone(&entry.done));
        if let Some(done) = done {
            done.notify_waiters();
        }
    }

    /// Returns the predecessor's signal when `op` must keep waiting, or
    /// `None` once it may start. Adopts the predecessor's retry count on
    /// the eligible retry path.
    fn predecessor_gate(&self, op: &OpRef) -> Option<Arc<Notify>> {
        let ops = self.ops.lock();
        let (_, pred) = ops.range(..op.id()).next_back()?;
        let pred_retry = pred.op.retry_snapshot();
        let attempt = op.retry_snapshot().attempt.unwrap_or(0);
        let first = attempt == 0;
        let eligible = if first {
            pred_retry.started
        } else {
            pred_retry.started && pred_retry.attempt.unwrap_or(0) >= attempt
        };
        if eligible {
            if !first {
                op.adopt_attempt(pred_retry.attempt.unwrap_or(attempt));
            }
            None
        } else {
            Some(Arc::clone(&pred.done))
        }
    }

    fn remove(&self, op: &OpRef) {
        let Some(key) = op.seq_key() else {
            return;
        };
        let entry = self.ops.lock().remove(&key);
        op.set_seq_key(None);
        if let Some(entry) = entry {
            entry.done.notify_waiters();
        }
    }
}

/// Removes the operation's ordering entry and fulfills its completion
/// signal. Runs on every exit from `repeat`, the fatal unwind included, so
/// successors always make forward progress.
struct CohortCleanup {
    sequencer: Arc<OperationRepeatSequencer>,
    op: OpRef,
}

impl Drop for CohortCleanup {
    fn drop(&mut self) {
        self.sequencer.remove(&self.op);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
