//! Diagnostic dump trees.
//!
//! These are the structured payloads handed to the diagnostic sink when an
//! operator asks "what is operation X waiting on?". Blocker dumps nest: an
//! aggregate blocker reports every blocker it owns as a child.

use serde::{Deserialize, Serialize};

use crate::types::OpKind;

/// One blocker in a waiting chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockerDump {
    /// Blocker kind name (phase name, "throttle", "aggregate", ...).
    pub kind: String,
    /// Kind-specific state (queue depth, slot counts, ...).
    #[serde(skip_serializing_if = "serde_json::Value::is_null", default)]
    pub detail: serde_json::Value,
    /// Owned sub-blockers, recursively dumped.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub children: Vec<BlockerDump>,
}

impl BlockerDump {
    /// Total number of blockers in this tree, this node included.
    #[must_use]
    pub fn tree_size(&self) -> usize {
        1 + self.children.iter().map(BlockerDump::tree_size).sum::<usize>()
    }
}

/// Snapshot of one in-flight operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationDump {
    /// Static type tag.
    pub kind: OpKind,
    /// Id, unique among live operations of the same kind.
    pub id: u64,
    /// Everything the operation is currently attributed as waiting on.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub blockers: Vec<BlockerDump>,
    /// Subtype-specific state contributed by the dispatcher.
    #[serde(skip_serializing_if = "serde_json::Value::is_null", default)]
    pub detail: serde_json::Value,
}
