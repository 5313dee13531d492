//! Engine configuration consumed by the tracking core.

/// Node-level configuration for the operation tracking engine.
///
/// Controls admission capacity and registry drain behavior. The throttler
/// re-reads this live via `OperationThrottler::update_from_config`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Unique identifier for this node, used in log context.
    pub node_id: String,
    /// Maximum number of concurrently admitted operations. Zero disables
    /// admission control entirely: callers run immediately.
    pub max_in_progress: u64,
    /// Interval between registry drain polls during shutdown, in
    /// milliseconds.
    pub drain_poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            max_in_progress: 0,
            drain_poll_interval_ms: 100,
        }
    }
}
