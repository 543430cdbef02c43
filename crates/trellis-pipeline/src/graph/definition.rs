//! Serializable structural definition of a pipeline graph.
//!
//! A [`GraphDefinition`] holds exactly the tuple set needed to reconstruct a
//! graph: node records plus edges as (source node, source slot, target node,
//! target slot). Data rows are never serialized.

use jiff::Timestamp;
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::PipelineResult;

use super::graph::PipelineGraph;
use super::id::{CompartmentId, NodeId};
use super::node::{Node, NodeCategory};
use super::slot::SlotInfo;

/// Metadata about a pipeline definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphMetadata {
    /// Display name of the pipeline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Free-form description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Semantic version of the pipeline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    /// Creation timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<Timestamp>,
    /// Last modification timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<Timestamp>,
}

impl GraphMetadata {
    /// Creates empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the version.
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// Stamps creation and modification times with the current instant.
    pub fn touched_now(mut self) -> Self {
        let now = Timestamp::now();
        self.created_at.get_or_insert(now);
        self.updated_at = Some(now);
        self
    }
}

/// Serializable record of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Stable node ID.
    pub id: NodeId,
    /// Kind reference.
    pub kind: String,
    /// Display name.
    pub name: String,
    /// Node category.
    #[serde(default)]
    pub category: NodeCategory,
    /// Human-readable alias at save time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Compartment the node belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compartment: Option<CompartmentId>,
    /// Enabled flag.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Pass-through flag.
    #[serde(default)]
    pub pass_through: bool,
    /// Declared input slots, in order.
    #[serde(default)]
    pub inputs: Vec<SlotInfo>,
    /// Declared output slots, in order.
    #[serde(default)]
    pub outputs: Vec<SlotInfo>,
}

fn default_true() -> bool {
    true
}

/// Serializable record of one data edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeDefinition {
    /// Node owning the source output slot.
    #[serde(rename = "source-node")]
    pub source_node: NodeId,
    /// Name of the source output slot.
    #[serde(rename = "source-slot")]
    pub source_slot: String,
    /// Node owning the target input slot.
    #[serde(rename = "target-node")]
    pub target_node: NodeId,
    /// Name of the target input slot.
    #[serde(rename = "target-slot")]
    pub target_slot: String,
    /// Whether user-facing edits may remove the edge.
    #[serde(default = "default_true")]
    pub user_can_disconnect: bool,
}

/// Serializable structural definition of a pipeline graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDefinition {
    /// Pipeline metadata.
    #[serde(default)]
    pub metadata: GraphMetadata,
    /// Node records.
    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,
    /// Edge records.
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
}

impl GraphDefinition {
    /// Captures the structure of a graph.
    pub fn from_graph(graph: &PipelineGraph, metadata: GraphMetadata) -> Self {
        let mut nodes = Vec::with_capacity(graph.node_count());
        for node_id in graph.node_ids() {
            // node_ids() only yields present nodes.
            let Ok(node) = graph.node(node_id) else {
                continue;
            };
            nodes.push(NodeDefinition {
                id: node_id,
                kind: node.kind().to_string(),
                name: node.name().to_string(),
                category: node.category(),
                alias: graph.alias(node_id).map(str::to_string),
                compartment: node.compartment(),
                enabled: node.is_enabled(),
                pass_through: node.is_pass_through(),
                inputs: node.inputs().cloned().collect(),
                outputs: node.outputs().cloned().collect(),
            });
        }
        let edges = graph
            .data_edges()
            .into_iter()
            .map(|(source, target, data)| EdgeDefinition {
                source_node: source.node_id,
                source_slot: source.name,
                target_node: target.node_id,
                target_slot: target.name,
                user_can_disconnect: data.user_can_disconnect,
            })
            .collect();
        Self {
            metadata,
            nodes,
            edges,
        }
    }

    /// Reconstructs a graph from the definition.
    pub fn build(&self) -> PipelineResult<PipelineGraph> {
        let mut graph = PipelineGraph::new();
        graph.begin_update();
        let result = self.build_into(&mut graph);
        graph.end_update();
        result.map(|_| graph)
    }

    fn build_into(&self, graph: &mut PipelineGraph) -> PipelineResult<()> {
        for record in &self.nodes {
            let mut node = Node::new(&record.kind, &record.name).with_category(record.category);
            if let Some(compartment) = record.compartment {
                node.set_compartment(Some(compartment));
            }
            node.set_enabled(record.enabled);
            node.set_pass_through(record.pass_through);
            for info in &record.inputs {
                node.declare_input(info.clone());
            }
            for info in &record.outputs {
                node.declare_output(info.clone());
            }
            graph.insert_node_with_id(record.id, node)?;
        }
        for edge in &self.edges {
            graph.connect(
                &super::slot::SlotId::output(edge.source_node, edge.source_slot.clone()),
                &super::slot::SlotId::input(edge.target_node, edge.target_slot.clone()),
                edge.user_can_disconnect,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use crate::graph::SlotId;

    use super::*;

    fn test_node_id(n: u128) -> NodeId {
        NodeId::from_uuid(Uuid::from_u128(n))
    }

    fn sample_graph() -> PipelineGraph {
        let mut graph = PipelineGraph::new();
        let a = graph
            .insert_node_with_id(
                test_node_id(1),
                Node::new("source", "Source").with_output(SlotInfo::new("out", "image")),
            )
            .unwrap();
        let b = graph
            .insert_node_with_id(
                test_node_id(2),
                Node::new("sink", "Sink").with_input(SlotInfo::new("in", "image")),
            )
            .unwrap();
        graph
            .connect(&SlotId::output(a, "out"), &SlotId::input(b, "in"), true)
            .unwrap();
        graph
    }

    #[test]
    fn test_round_trip_preserves_structure() {
        let mut original = sample_graph();
        let definition = GraphDefinition::from_graph(
            &original,
            GraphMetadata::new().with_name("sample"),
        );

        let mut rebuilt = definition.build().unwrap();
        assert_eq!(rebuilt.node_count(), original.node_count());
        assert_eq!(rebuilt.traverse().unwrap(), original.traverse().unwrap());
        assert_eq!(
            rebuilt
                .data_edges()
                .into_iter()
                .map(|(s, t, _)| (s, t))
                .collect::<Vec<_>>(),
            original
                .data_edges()
                .into_iter()
                .map(|(s, t, _)| (s, t))
                .collect::<Vec<_>>(),
        );
    }

    #[test]
    fn test_json_round_trip() {
        let graph = sample_graph();
        let definition = GraphDefinition::from_graph(&graph, GraphMetadata::new());
        let json = serde_json::to_string(&definition).unwrap();
        assert!(json.contains("source-node"));
        let parsed: GraphDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, definition);
    }

    #[test]
    fn test_build_rejects_bad_edge() {
        let graph = sample_graph();
        let mut definition = GraphDefinition::from_graph(&graph, GraphMetadata::new());
        definition.edges.push(EdgeDefinition {
            source_node: test_node_id(1),
            source_slot: "missing".to_string(),
            target_node: test_node_id(2),
            target_slot: "in".to_string(),
            user_can_disconnect: true,
        });
        assert!(definition.build().is_err());
    }
}
