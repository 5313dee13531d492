//! Ordered pipeline phases.
//!
//! An [`OrderedPipelinePhase`] admits at most one resident at a time, in
//! strict arrival order. The required entry idiom is enter-then-exit:
//! [`PipelineHandle::enter`] places the handle in the next phase's queue
//! *before* releasing the phase it currently resides in, which makes arrival
//! order transitive across any chain of phases: if A entered P before B,
//! A is granted every later phase no later than B.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

use super::blocker::{Blocker, BlockerExt, BlockingFuture};

// ---------------------------------------------------------------------------
// OrderedPipelinePhase
// ---------------------------------------------------------------------------

/// A named, exclusive ordering checkpoint operations pass through.
pub struct OrderedPipelinePhase {
    name: &'static str,
    state: Mutex<PhaseState>,
}

#[derive(Default)]
struct PhaseState {
    occupied: bool,
    waiters: VecDeque<oneshot::Sender<PhaseResidency>>,
}

impl OrderedPipelinePhase {
    #[must_use]
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: Mutex::new(PhaseState::default()),
        })
    }

    /// Phase name, also the blocker kind reported in dumps.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Requests residency. If the phase is free, the returned future is
    /// already resolved; otherwise the caller is appended to the FIFO queue
    /// synchronously, so queue position is fixed at call time.
    fn request_entry(self: &Arc<Self>) -> BlockingFuture<PhaseResidency> {
        let rx = {
            let mut state = self.state.lock();
            if !state.occupied {
                state.occupied = true;
                trace!(phase = self.name, "granted immediately");
                return BlockingFuture::ready(PhaseResidency {
                    phase: Some(Arc::clone(self)),
                });
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };
        let phase = Arc::clone(self);
        self.make_blocking_future(async move {
            // `phase` keeps the queue (and our sender) alive until the
            // grant arrives, so the channel cannot close first.
            let _keepalive = Arc::clone(&phase);
            rx.await.expect("phase queue dropped a waiter without granting")
        })
    }

    /// Hands residency to the next queued waiter, or frees the phase.
    /// Waiters that were cancelled while queued are skipped.
    fn release(self: &Arc<Self>) {
        loop {
            let waiter = {
                let mut state = self.state.lock();
                match state.waiters.pop_front() {
                    Some(tx) => tx,
                    None => {
                        state.occupied = false;
                        return;
                    }
                }
            };
            let residency = PhaseResidency {
                phase: Some(Arc::clone(self)),
            };
            match waiter.send(residency) {
                Ok(()) => {
                    trace!(phase = self.name, "granted to next waiter");
                    return;
                }
                Err(mut dead) => {
                    // Receiver gone: disarm so dropping it does not release
                    // the phase a second time, then try the next waiter.
                    dead.phase.take();
                }
            }
        }
    }
}

impl Blocker for OrderedPipelinePhase {
    fn kind(&self) -> &'static str {
        self.name
    }

    fn dump_detail(&self) -> serde_json::Value {
        let state = self.state.lock();
        serde_json::json!({
            "occupied": state.occupied,
            "waiters": state.waiters.len(),
        })
    }
}

// ---------------------------------------------------------------------------
// PhaseResidency
// ---------------------------------------------------------------------------

/// Exclusive residency of one phase. Dropping it releases the phase and
/// grants the next waiter, including when the holder is cancelled before it
/// ever observes the grant.
pub struct PhaseResidency {
    phase: Option<Arc<OrderedPipelinePhase>>,
}

impl PhaseResidency {
    #[must_use]
    fn phase_name(&self) -> Option<&'static str> {
        self.phase.as_ref().map(|p| p.name)
    }
}

impl Drop for PhaseResidency {
    fn drop(&mut self) {
        if let Some(phase) = self.phase.take() {
            phase.release();
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineHandle
// ---------------------------------------------------------------------------

/// One operation's pipeline residency state. A handle has exactly one owner
/// and resides in at most one phase at any instant.
pub struct PipelineHandle {
    slot: Arc<Mutex<Option<PhaseResidency>>>,
}

impl PipelineHandle {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Resolves once the handle holds exclusive residency of `phase`.
    ///
    /// The handle is appended to `phase`'s queue synchronously, before any
    /// previously held phase is released, never the reverse, so ordering
    /// established in the old phase carries into the new one.
    pub fn enter(&mut self, phase: &Arc<OrderedPipelinePhase>) -> BlockingFuture<()> {
        let pending = phase.request_entry();
        self.exit();
        let slot = Arc::clone(&self.slot);
        pending.map(move |residency| {
            *slot.lock() = Some(residency);
        })
    }

    /// Releases current residency, if any. Idempotent.
    pub fn exit(&mut self) {
        let prev = self.slot.lock().take();
        drop(prev);
    }

    /// Name of the phase currently resided in, if any.
    #[must_use]
    pub fn current_phase(&self) -> Option<&'static str> {
        self.slot.lock().as_ref().and_then(PhaseResidency::phase_name)
    }
}

impl Default for PipelineHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        self.exit();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    type OrderLog = Arc<Mutex<Vec<String>>>;

    #[tokio::test]
    async fn grants_follow_arrival_order() {
        let phase = OrderedPipelinePhase::new("process");
        let log: OrderLog = Arc::new(Mutex::new(Vec::new()));

        // First arrival takes residency immediately; keep it held while the
        // others queue up.
        let mut holder = PipelineHandle::new();
        holder.enter(&phase).wait().await;

        let mut tasks = Vec::new();
        for i in 0..4 {
            // Enqueue synchronously so arrival order is deterministic.
            let mut handle = PipelineHandle::new();
            let entry = handle.enter(&phase);
            let log = Arc::clone(&log);
            tasks.push(tokio::spawn(async move {
                entry.wait().await;
                log.lock().push(format!("op{i}"));
                // Vary how long each op holds the phase; order must not care.
                tokio::time::sleep(Duration::from_millis(5 * (4 - i))).await;
                drop(handle);
            }));
        }

        drop(holder);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*log.lock(), vec!["op0", "op1", "op2", "op3"]);
    }

    #[tokio::test]
    async fn order_is_transitive_across_phase_chain() {
        let prepare = OrderedPipelinePhase::new("prepare");
        let process = OrderedPipelinePhase::new("process");
        let log: OrderLog = Arc::new(Mutex::new(Vec::new()));

        // Both ops enter "prepare" in order, then move to "process". The
        // first op dawdles between phases; the second must still not overtake
        // it in "process".
        let mut h1 = PipelineHandle::new();
        let mut h2 = PipelineHandle::new();
        let e1 = h1.enter(&prepare);
        let e2 = h2.enter(&prepare);

        let t1 = tokio::spawn({
            let process = Arc::clone(&process);
            let log = Arc::clone(&log);
            async move {
                e1.wait().await;
                // Slow async step while holding "prepare".
                tokio::time::sleep(Duration::from_millis(40)).await;
                h1.enter(&process).wait().await;
                log.lock().push("op1".to_string());
                drop(h1);
            }
        });
        let t2 = tokio::spawn({
            let process = Arc::clone(&process);
            let log = Arc::clone(&log);
            async move {
                e2.wait().await;
                h2.enter(&process).wait().await;
                log.lock().push("op2".to_string());
                drop(h2);
            }
        });

        t1.await.unwrap();
        t2.await.unwrap();
        assert_eq!(*log.lock(), vec!["op1", "op2"]);
    }

    #[tokio::test]
    async fn exit_is_idempotent_and_runs_on_drop() {
        let phase = OrderedPipelinePhase::new("process");
        let mut handle = PipelineHandle::new();
        handle.enter(&phase).wait().await;
        assert_eq!(handle.current_phase(), Some("process"));
        handle.exit();
        assert_eq!(handle.current_phase(), None);
        handle.exit();

        // Phase is free again.
        let mut next = PipelineHandle::new();
        next.enter(&phase).wait().await;
        drop(next);

        // Drop of a resident handle also releases.
        let mut last = PipelineHandle::new();
        last.enter(&phase).wait().await;
        drop(last);
        let mut after = PipelineHandle::new();
        after.enter(&phase).wait().await;
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_wedge_the_phase() {
        let phase = OrderedPipelinePhase::new("process");
        let mut holder = PipelineHandle::new();
        holder.enter(&phase).wait().await;

        // Queue two waiters, then cancel the first while it is queued.
        let mut cancelled = PipelineHandle::new();
        let entry_cancelled = cancelled.enter(&phase);
        let mut survivor = PipelineHandle::new();
        let entry_survivor = survivor.enter(&phase);

        let doomed = tokio::spawn(async move {
            entry_cancelled.wait().await;
            drop(cancelled);
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        doomed.abort();
        let _ = doomed.await;

        drop(holder);
        // The grant skips the dead waiter and reaches the survivor.
        tokio::time::timeout(Duration::from_millis(200), entry_survivor.wait())
            .await
            .expect("survivor should be granted after the cancelled waiter is skipped");
        assert_eq!(survivor.current_phase(), Some("process"));
    }

    #[tokio::test]
    async fn phase_dump_reports_queue_depth() {
        let phase = OrderedPipelinePhase::new("process");
        let mut holder = PipelineHandle::new();
        holder.enter(&phase).wait().await;
        let mut waiting = PipelineHandle::new();
        let _entry = waiting.enter(&phase);

        let dump = phase.dump();
        assert_eq!(dump.kind, "process");
        assert_eq!(dump.detail["occupied"], serde_json::json!(true));
        assert_eq!(dump.detail["waiters"], serde_json::json!(1));
    }
}
