//! Pipeline error types.

use thiserror::Error;

use crate::graph::{NodeId, SlotId};

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors that can occur during graph mutation, batch generation or a run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A connect request violated a structural rule.
    #[error("cannot connect {source_slot} to {target_slot}: {reason}")]
    InvalidConnection {
        /// Requested source slot.
        source_slot: SlotId,
        /// Requested target slot.
        target_slot: SlotId,
        /// Which rule was violated.
        reason: String,
    },

    /// An operation would introduce, or discovered, a cycle among data edges.
    #[error("cycle detected: {detail}")]
    CycleDetected {
        /// Description of the offending edge or region.
        detail: String,
    },

    /// Loop extraction found a node whose branches disagree on the loop root.
    #[error("node {node_id} is reachable from multiple loop starts")]
    AmbiguousLoopRoot {
        /// Node where the conflicting tags met.
        node_id: NodeId,
        /// All candidate loop-start nodes.
        candidates: Vec<NodeId>,
    },

    /// A generated batch left one or more input slots without rows.
    #[error("incomplete data batch for node {node_id}: no rows for {}", missing.join(", "))]
    IncompleteBatch {
        /// Node whose batches were being generated.
        node_id: NodeId,
        /// Input slots with zero rows in the offending batch.
        missing: Vec<String>,
    },

    /// A merging batch could not be reduced to single-row batches.
    #[error("batch for node {node_id} has {rows} rows in slot {slot}, expected exactly one")]
    NonSingularBatch {
        /// Node whose batches were being reduced.
        node_id: NodeId,
        /// First slot with more than one row.
        slot: String,
        /// Observed row count.
        rows: usize,
    },

    /// A node lookup failed.
    #[error("unknown node {node_id}")]
    UnknownNode {
        /// The missing node.
        node_id: NodeId,
    },

    /// A slot lookup failed.
    #[error("unknown slot {slot}")]
    UnknownSlot {
        /// The missing slot.
        slot: SlotId,
    },

    /// A node was inserted with an ID already present in the graph.
    #[error("node {node_id} already exists in the graph")]
    DuplicateNode {
        /// The conflicting node ID.
        node_id: NodeId,
    },

    /// No workload is registered for a node kind.
    #[error("no workload registered for node {node_id} of kind {kind}")]
    MissingWorkload {
        /// Node awaiting execution.
        node_id: NodeId,
        /// Its declared kind.
        kind: String,
    },

    /// A node workload failed.
    #[error("node {node_id} failed: {message}")]
    NodeFailed {
        /// The failed node.
        node_id: NodeId,
        /// Failure message.
        message: String,
    },

    /// The run was cancelled cooperatively.
    #[error("pipeline run cancelled")]
    Cancelled,

    /// A graph definition could not be applied.
    #[error("invalid pipeline definition: {0}")]
    InvalidDefinition(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// Human-readable explanation, suitable for direct UI surfacing.
    pub fn explain(&self) -> String {
        self.to_string()
    }

    /// Suggested remedy for the failure, when one exists.
    pub fn remedy(&self) -> Option<&'static str> {
        match self {
            Self::InvalidConnection { .. } => {
                Some("check slot directions and disconnect the existing source of the target slot")
            }
            Self::CycleDetected { .. } => {
                Some("remove one of the connections along the cycle; pipelines must stay acyclic")
            }
            Self::AmbiguousLoopRoot { .. } => {
                Some("restructure the graph so each loop region has a single entry node")
            }
            Self::IncompleteBatch { .. } => Some(
                "check that all inputs carry matching metadata tags, or enable skipping of \
                 incomplete batches",
            ),
            Self::NonSingularBatch { .. } => Some(
                "adjust the column matching so each batch holds exactly one row per slot, or \
                 use a node that accepts merged batches",
            ),
            Self::MissingWorkload { .. } => {
                Some("register a workload for this node kind before scheduling the run")
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::SlotDirection;

    #[test]
    fn test_incomplete_batch_message() {
        let err = PipelineError::IncompleteBatch {
            node_id: NodeId::new(),
            missing: vec!["image".to_string(), "mask".to_string()],
        };
        assert!(err.explain().contains("image, mask"));
        assert!(err.remedy().is_some());
    }

    #[test]
    fn test_invalid_connection_names_slots() {
        let node_id = NodeId::new();
        let err = PipelineError::InvalidConnection {
            source_slot: SlotId::new(node_id, SlotDirection::Output, "out"),
            target_slot: SlotId::new(node_id, SlotDirection::Input, "in"),
            reason: "target already has an incoming edge".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("out"));
        assert!(text.contains("incoming edge"));
    }
}
