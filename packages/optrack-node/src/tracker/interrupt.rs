//! Cooperative cancellation.
//!
//! An [`InterruptCondition`] is polled at suspension points; when it fires,
//! the operation is cancelled with an [`Interrupted`] error. Cancellation is
//! lazy: it takes effect at the next suspension point after the condition
//! becomes true, never in the middle of code between checkpoints. The
//! dispatcher classifies errors with [`is_interruption`] to retry or
//! redirect cancelled operations instead of surfacing them as failures.

use std::sync::Arc;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Interrupted
// ---------------------------------------------------------------------------

/// Cancellation-class errors raised through an interrupt condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Interrupted {
    /// The shard-map epoch the operation depends on has advanced past the
    /// value it started with.
    #[error("shard map epoch advanced past the operation's epoch (primary: {was_primary})")]
    EpochChanged {
        /// Whether this node is still primary for the shard, which decides
        /// how the dispatcher redirects the operation.
        was_primary: bool,
    },
    /// The owning node is shutting down.
    #[error("node is shutting down")]
    ShuttingDown,
}

/// True when `err` carries a cancellation-class error anywhere in its
/// chain. Callers special-case these for retry/redirect rather than
/// treating them as hard failures.
#[must_use]
pub fn is_interruption(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<Interrupted>().is_some())
}

// ---------------------------------------------------------------------------
// InterruptCondition trait
// ---------------------------------------------------------------------------

/// Pluggable cancellation predicate, supplied per operation kind and polled
/// at every suspension point.
pub trait InterruptCondition: Send + Sync {
    /// Returns the cancellation to deliver, or `None` to continue.
    fn may_interrupt(&self) -> Option<Interrupted>;

    /// Checkpoint form of [`InterruptCondition::may_interrupt`].
    ///
    /// # Errors
    ///
    /// Returns the pending cancellation when the condition has fired.
    fn check(&self) -> Result<(), Interrupted> {
        match self.may_interrupt() {
            Some(interrupted) => Err(interrupted),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// EpochInterruptCondition
// ---------------------------------------------------------------------------

/// Shard state consulted by [`EpochInterruptCondition`].
pub trait ShardView: Send + Sync {
    /// Current shard-map epoch.
    fn current_epoch(&self) -> u64;
    /// Whether the owning node is shutting down.
    fn is_stopping(&self) -> bool;
    /// Whether this node is primary for the shard.
    fn is_primary(&self) -> bool;
}

/// Canonical interrupt condition: fires when the shard-map epoch advances
/// past the value captured at construction, or when the node is stopping.
pub struct EpochInterruptCondition {
    view: Arc<dyn ShardView>,
    epoch: u64,
}

impl EpochInterruptCondition {
    /// Captures the current epoch from `view`; the condition fires once the
    /// view's epoch moves past it.
    #[must_use]
    pub fn new(view: Arc<dyn ShardView>) -> Self {
        let epoch = view.current_epoch();
        Self { view, epoch }
    }

    /// Epoch the operation started with.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl InterruptCondition for EpochInterruptCondition {
    fn may_interrupt(&self) -> Option<Interrupted> {
        if self.view.current_epoch() != self.epoch {
            return Some(Interrupted::EpochChanged {
                was_primary: self.view.is_primary(),
            });
        }
        if self.view.is_stopping() {
            return Some(Interrupted::ShuttingDown);
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
