//! Scheduler parameter records.
//!
//! The throttler does not pick among pending acquirers itself; it hands each
//! waiter to an external scheduler together with this record and admits
//! whatever the scheduler dequeues next.

use serde::{Deserialize, Serialize};

/// Priority class of an operation, as seen by the external scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    /// Must run ahead of everything else (peering, shard-map advances).
    Immediate,
    /// Client-facing work.
    Client,
    /// Background work (recovery, scrub-like maintenance).
    Background,
}

/// Parameters handed to the external scheduler for one pending admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleParams {
    /// Relative cost estimate for this admission.
    pub cost: u64,
    /// Priority class used to pick among pending acquirers.
    pub class: PriorityClass,
    /// Owning entity (shard id) the scheduler may use for fairness.
    pub owner: u64,
}

impl ScheduleParams {
    /// Client-class params with unit cost.
    #[must_use]
    pub fn client(owner: u64) -> Self {
        Self {
            cost: 1,
            class: PriorityClass::Client,
            owner,
        }
    }

    /// Background-class params with unit cost.
    #[must_use]
    pub fn background(owner: u64) -> Self {
        Self {
            cost: 1,
            class: PriorityClass::Background,
            owner,
        }
    }
}
