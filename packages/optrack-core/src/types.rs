//! Operation type codes.
//!
//! The set of operation kinds is closed and known at compile time, so it is
//! an exhaustive enum rather than an open trait: adding a kind without
//! handling it everywhere is a compile error.

use serde::{Deserialize, Serialize};

/// Static type tag carried by every tracked operation.
///
/// Each kind gets its own registry collection and its own monotonically
/// increasing id counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    /// Client-facing read/write request against an object.
    ClientRequest,
    /// Cluster membership/peering event delivered to a shard.
    ClusterEvent,
    /// Advance of the shard map to a newer epoch.
    ShardMapAdvance,
    /// Creation of a new shard on this node.
    ShardCreation,
    /// Write replicated from another node.
    ReplicatedWrite,
    /// Background recovery of degraded objects.
    Recovery,
    /// Sub-operation spawned by a background recovery.
    RecoverySub,
}

impl OpKind {
    /// All kinds, in registry-collection order.
    pub const ALL: [OpKind; 7] = [
        OpKind::ClientRequest,
        OpKind::ClusterEvent,
        OpKind::ShardMapAdvance,
        OpKind::ShardCreation,
        OpKind::ReplicatedWrite,
        OpKind::Recovery,
        OpKind::RecoverySub,
    ];

    /// Number of distinct kinds (registry collection count).
    pub const COUNT: usize = Self::ALL.len();

    /// Stable lowercase name, used in logs and dump output.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            OpKind::ClientRequest => "client_request",
            OpKind::ClusterEvent => "cluster_event",
            OpKind::ShardMapAdvance => "shard_map_advance",
            OpKind::ShardCreation => "shard_creation",
            OpKind::ReplicatedWrite => "replicated_write",
            OpKind::Recovery => "recovery",
            OpKind::RecoverySub => "recovery_sub",
        }
    }

    /// Index into per-kind registry arrays.
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            OpKind::ClientRequest => 0,
            OpKind::ClusterEvent => 1,
            OpKind::ShardMapAdvance => 2,
            OpKind::ShardCreation => 3,
            OpKind::ReplicatedWrite => 4,
            OpKind::Recovery => 5,
            OpKind::RecoverySub => 6,
        }
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
