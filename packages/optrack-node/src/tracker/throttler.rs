//! Admission control for in-flight operations.
//!
//! The throttler bounds how many operations run concurrently; it never picks
//! which waiter runs next itself. Pending acquirers are handed to an
//! external [`ThrottleScheduler`] keyed by their [`ScheduleParams`], and the
//! throttler admits whatever the scheduler dequeues; admission order is
//! scheduler-defined, not FIFO.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;

use optrack_core::ScheduleParams;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::config::EngineConfig;

use super::blocker::{Blocker, BlockerExt, BlockingFuture};
use super::operation::OpRef;

// ---------------------------------------------------------------------------
// ThrottleScheduler trait
// ---------------------------------------------------------------------------

/// Identifies one pending admission handed to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket(pub u64);

/// External waiter-selection policy.
///
/// `dequeue` may be called while throttler-internal locks are held, so
/// implementations must not call back into the throttler.
pub trait ThrottleScheduler: Send + Sync + 'static {
    /// Records a pending admission with its scheduling parameters.
    fn enqueue(&self, ticket: Ticket, params: ScheduleParams);

    /// Picks the next pending admission, or `None` when nothing is queued.
    fn dequeue(&self) -> Option<Ticket>;
}

/// Trivial scheduler admitting waiters strictly in arrival order. Used when
/// no cost/priority policy is plugged in.
#[derive(Default)]
pub struct FifoScheduler {
    queue: Mutex<VecDeque<Ticket>>,
}

impl ThrottleScheduler for FifoScheduler {
    fn enqueue(&self, ticket: Ticket, _params: ScheduleParams) {
        self.queue.lock().push_back(ticket);
    }

    fn dequeue(&self) -> Option<Ticket> {
        self.queue.lock().pop_front()
    }
}

// ---------------------------------------------------------------------------
// OperationThrottler
// ---------------------------------------------------------------------------

/// Bounds the number of concurrently admitted operations.
///
/// `in_progress <= max_in_progress` holds at all times; `max_in_progress`
/// of zero disables admission control entirely.
pub struct OperationThrottler {
    scheduler: Box<dyn ThrottleScheduler>,
    state: Mutex<ThrottleState>,
}

struct ThrottleState {
    max_in_progress: u64,
    in_progress: u64,
    pending: u64,
    next_ticket: u64,
    waiters: HashMap<Ticket, oneshot::Sender<ThrottleSlot>>,
}

impl OperationThrottler {
    #[must_use]
    pub fn new(config: &EngineConfig, scheduler: Box<dyn ThrottleScheduler>) -> Arc<Self> {
        Arc::new(Self {
            scheduler,
            state: Mutex::new(ThrottleState {
                max_in_progress: config.max_in_progress,
                in_progress: 0,
                pending: 0,
                next_ticket: 0,
                waiters: HashMap::new(),
            }),
        })
    }

    /// Applies a live capacity change. Raising the limit wakes pending
    /// acquirers; lowering it never preempts already-admitted operations,
    /// it only tightens future admissions.
    pub fn update_from_config(self: &Arc<Self>, config: &EngineConfig) {
        {
            let mut state = self.state.lock();
            debug!(
                from = state.max_in_progress,
                to = config.max_in_progress,
                "throttler capacity updated"
            );
            state.max_in_progress = config.max_in_progress;
        }
        self.wake();
    }

    /// True when admission control is active.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.state.lock().max_in_progress > 0
    }

    /// Currently admitted operation count.
    #[must_use]
    pub fn in_progress(&self) -> u64 {
        self.state.lock().in_progress
    }

    /// Currently queued acquirer count.
    #[must_use]
    pub fn pending(&self) -> u64 {
        self.state.lock().pending
    }

    /// Runs `f` under one admission slot.
    ///
    /// With admission control disabled, `f` runs immediately with no
    /// blocking. Otherwise a slot is acquired through the scheduler (the
    /// wait attributed to `op`), held for the span of `f`, and released on
    /// every exit path. A cancelled acquisition never counts as admitted.
    pub async fn with_throttle<T, F, Fut>(
        self: &Arc<Self>,
        op: &OpRef,
        params: ScheduleParams,
        f: F,
    ) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if !self.enabled() {
            return f().await;
        }
        let slot = op.with_blocking_future(self.acquire(params)).await;
        let result = f().await;
        drop(slot);
        result
    }

    /// Repeats [`OperationThrottler::with_throttle`] until `f` returns
    /// `false`, re-acquiring the admission budget once per iteration.
    pub async fn with_throttle_while<F, Fut>(
        self: &Arc<Self>,
        op: &OpRef,
        params: ScheduleParams,
        mut f: F,
    ) -> anyhow::Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<bool>>,
    {
        loop {
            let cont = self.with_throttle(op, params, &mut f).await?;
            if !cont {
                return Ok(());
            }
        }
    }

    /// Requests one slot. Resolved immediately when capacity is free and no
    /// one is queued ahead; otherwise the acquirer is registered with the
    /// scheduler and admitted when selected.
    fn acquire(self: &Arc<Self>, params: ScheduleParams) -> BlockingFuture<ThrottleSlot> {
        let (ticket, rx) = {
            let mut state = self.state.lock();
            if state.pending == 0 && state.in_progress < state.max_in_progress {
                state.in_progress += 1;
                return BlockingFuture::ready(self.slot());
            }
            let ticket = Ticket(state.next_ticket);
            state.next_ticket += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.insert(ticket, tx);
            state.pending += 1;
            (ticket, rx)
        };
        self.scheduler.enqueue(ticket, params);
        // A slot may have been released between registration and enqueue.
        self.wake();
        let keepalive = Arc::clone(self);
        self.make_blocking_future(async move {
            let _keepalive = keepalive;
            rx.await
                .expect("throttler dropped a pending acquirer without granting")
        })
    }

    fn release(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            state.in_progress -= 1;
        }
        self.wake();
    }

    /// Admits scheduler-selected waiters while capacity remains.
    fn wake(self: &Arc<Self>) {
        loop {
            let waiter = {
                let mut state = self.state.lock();
                if state.max_in_progress == 0 || state.in_progress >= state.max_in_progress {
                    return;
                }
                let Some(ticket) = self.scheduler.dequeue() else {
                    return;
                };
                state.pending -= 1;
                state.in_progress += 1;
                state.waiters.remove(&ticket)
            };
            let Some(tx) = waiter else {
                let mut state = self.state.lock();
                state.in_progress -= 1;
                continue;
            };
            if let Err(mut dead) = tx.send(self.slot()) {
                // Acquirer cancelled while queued: the slot was never
                // observed, so it must not stay counted.
                dead.throttler.take();
                let mut state = self.state.lock();
                state.in_progress -= 1;
            }
        }
    }

    fn slot(self: &Arc<Self>) -> ThrottleSlot {
        ThrottleSlot {
            throttler: Some(Arc::clone(self)),
        }
    }
}

impl Blocker for OperationThrottler {
    fn kind(&self) -> &'static str {
        "throttle"
    }

    fn dump_detail(&self) -> serde_json::Value {
        let state = self.state.lock();
        serde_json::json!({
            "max_in_progress": state.max_in_progress,
            "in_progress": state.in_progress,
            "pending": state.pending,
        })
    }
}

/// One admission slot, released on drop.
pub struct ThrottleSlot {
    throttler: Option<Arc<OperationThrottler>>,
}

impl Drop for ThrottleSlot {
    fn drop(&mut self) {
        if let Some(throttler) = self.throttler.take() {
            throttler.release();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
