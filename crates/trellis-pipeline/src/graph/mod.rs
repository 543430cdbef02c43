//! Pipeline graph structures.
//!
//! This module provides the structural model of a pipeline:
//! - [`PipelineGraph`]: nodes and slot-to-slot connections with cycle
//!   prevention, cached topological traversal and change notifications
//! - [`Node`] / [`NodeSpec`]: node records and declared ports
//! - [`SlotId`] / [`SlotInfo`] / [`DataStore`]: slot identity, declarations
//!   and the row-oriented data plane
//! - [`GraphDefinition`]: serializable structural definition
//! - [`LoopGroup`]: extracted single-entry loop regions

mod definition;
mod edge;
mod graph;
mod id;
mod loops;
mod node;
mod slot;

pub use definition::{EdgeDefinition, GraphDefinition, GraphMetadata, NodeDefinition};
pub use edge::{EdgeData, EdgeKind};
pub use graph::{GraphEvent, PipelineGraph, Severity, ValidityIssue, ValidityReport};
pub use id::{CompartmentId, NodeId, make_unique_alias};
pub use loops::LoopGroup;
pub use node::{CategoryCapabilities, Node, NodeCategory, NodeSpec};
pub use slot::{DataRow, DataSlot, DataStore, RowMetadata, SlotDirection, SlotId, SlotInfo, SlotRole};
