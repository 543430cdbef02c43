//! Edge data stored in the structural graph.

use serde::{Deserialize, Serialize};

/// Kind of a structural edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    /// A data connection from an output slot to an input slot.
    Data,
    /// Implicit same-node input to output edge, keeps single-node components
    /// connected in the structural graph. Never carries data.
    Internal,
}

/// Edge weight in the structural graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeData {
    /// Kind of the edge.
    pub kind: EdgeKind,
    /// Whether a user-facing edit may remove this edge.
    pub user_can_disconnect: bool,
}

impl EdgeData {
    /// Creates a data edge.
    pub const fn data(user_can_disconnect: bool) -> Self {
        Self {
            kind: EdgeKind::Data,
            user_can_disconnect,
        }
    }

    /// Creates an internal same-node connectivity edge.
    pub const fn internal() -> Self {
        Self {
            kind: EdgeKind::Internal,
            user_can_disconnect: false,
        }
    }

    /// Whether this is a data connection.
    pub const fn is_data(&self) -> bool {
        matches!(self.kind, EdgeKind::Data)
    }
}
