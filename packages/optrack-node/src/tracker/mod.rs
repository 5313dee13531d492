//! Request tracking, ordering, and admission control.
//!
//! This module implements the substrate every request on a node runs on:
//!
//! 1. **Wait attribution** (`blocker`): `BlockingFuture` ties a suspension
//!    to the `Blocker` responsible for it
//! 2. **Identity and liveness** (`operation`, `registry`): per-kind ids,
//!    live-set membership, diagnostic dumps, shutdown drain
//! 3. **Pipeline ordering** (`pipeline`): FIFO exclusive phases chained
//!    through `PipelineHandle` for transitive order
//! 4. **Admission control** (`throttler`): bounded concurrency with a
//!    pluggable scheduler
//! 5. **Retry ordering** (`sequencer`): arrival-order replay across
//!    re-submissions
//! 6. **Cancellation** (`interrupt`): epoch-scoped cooperative interrupts

pub mod blocker;
pub mod interrupt;
pub mod operation;
pub mod pipeline;
pub mod registry;
pub mod sequencer;
pub mod throttler;

// Re-export key types for convenient access.
pub use blocker::{join_blocking_futures, AggregateBlocker, Blocker, BlockerExt, BlockingFuture};
pub use interrupt::{
    is_interruption, EpochInterruptCondition, InterruptCondition, Interrupted, ShardView,
};
pub use operation::{OpDetail, OpRef, Operation};
pub use pipeline::{OrderedPipelinePhase, PipelineHandle};
pub use registry::OperationRegistry;
pub use sequencer::OperationRepeatSequencer;
pub use throttler::{FifoScheduler, OperationThrottler, ThrottleScheduler, Ticket};

use std::sync::Arc;

use crate::config::EngineConfig;

// ---------------------------------------------------------------------------
// ShardContext
// ---------------------------------------------------------------------------

/// Tracking facilities shared by every operation on one shard worker.
pub struct ShardContext {
    /// Live set and id allocator.
    pub registry: Arc<OperationRegistry>,
    /// Admission control for throttled kinds.
    pub throttler: Arc<OperationThrottler>,
}

impl ShardContext {
    #[must_use]
    pub fn new(config: &EngineConfig, scheduler: Box<dyn ThrottleScheduler>) -> Self {
        Self {
            registry: Arc::new(OperationRegistry::new(config)),
            throttler: OperationThrottler::new(config, scheduler),
        }
    }

    /// Applies a config reload to the tracking layer.
    pub fn update_from_config(&self, config: &EngineConfig) {
        self.throttler.update_from_config(config);
    }

    /// Waits for every live operation to complete.
    pub async fn stop(&self) {
        self.registry.stop().await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
