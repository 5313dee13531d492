//! Request-tracking and ordering substrate for a storage node's
//! cooperative request-processing engine.

pub mod config;
pub mod tracker;

pub use config::EngineConfig;
pub use tracker::{
    is_interruption, join_blocking_futures, AggregateBlocker, Blocker, BlockerExt, BlockingFuture,
    EpochInterruptCondition, FifoScheduler, InterruptCondition, Interrupted, OpDetail, OpRef,
    Operation, OperationRegistry, OperationRepeatSequencer, OperationThrottler,
    OrderedPipelinePhase, PipelineHandle, ShardContext, ShardView, ThrottleScheduler, Ticket,
};
