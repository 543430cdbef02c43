//! Node records, declared ports and category capabilities.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use strum::Display;

use super::id::CompartmentId;
use super::slot::SlotInfo;

/// Category of a node, mapped to capability flags through a closed table.
#[derive(Debug, Display, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum NodeCategory {
    /// Ordinary processing node.
    #[default]
    Standard,
    /// Infrastructure node managed by the system, hidden from users.
    Internal,
    /// Designated entry of a loop region.
    LoopStart,
    /// Designated exit of a loop region.
    LoopEnd,
}

/// Capability flags attached to a node category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategoryCapabilities {
    /// Shown in an editor surface.
    pub visible: bool,
    /// Users may create nodes of this category.
    pub user_creatable: bool,
    /// Users may delete nodes of this category.
    pub user_deletable: bool,
    /// Nodes of this category may be copied out into a sub-graph.
    pub extractable: bool,
}

impl NodeCategory {
    /// Returns the capability flags for this category.
    pub const fn capabilities(&self) -> CategoryCapabilities {
        match self {
            Self::Standard => CategoryCapabilities {
                visible: true,
                user_creatable: true,
                user_deletable: true,
                extractable: true,
            },
            Self::Internal => CategoryCapabilities {
                visible: false,
                user_creatable: false,
                user_deletable: false,
                extractable: false,
            },
            Self::LoopStart | Self::LoopEnd => CategoryCapabilities {
                visible: true,
                user_creatable: true,
                user_deletable: true,
                extractable: false,
            },
        }
    }
}

/// Declares the ports and category of a node kind.
///
/// Node types implement this instead of being introspected at runtime; the
/// graph reads the declarations once at insert time and again on repair.
pub trait NodeSpec {
    /// Kind reference, unique per node type.
    fn kind(&self) -> &str;

    /// Category of nodes of this kind.
    fn category(&self) -> NodeCategory {
        NodeCategory::Standard
    }

    /// Declared input ports, in order.
    fn input_slots(&self) -> Vec<SlotInfo>;

    /// Declared output ports, in order.
    fn output_slots(&self) -> Vec<SlotInfo>;
}

/// A node in the pipeline graph.
///
/// The node ID is owned by the graph; a `Node` value holds everything else:
/// kind reference, declared slots, compartment and scheduling flags.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    kind: String,
    name: String,
    category: NodeCategory,
    compartment: Option<CompartmentId>,
    enabled: bool,
    pass_through: bool,
    inputs: IndexMap<String, SlotInfo>,
    outputs: IndexMap<String, SlotInfo>,
}

impl Node {
    /// Creates a node with no slots.
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            category: NodeCategory::Standard,
            compartment: None,
            enabled: true,
            pass_through: false,
            inputs: IndexMap::new(),
            outputs: IndexMap::new(),
        }
    }

    /// Creates a node from a kind declaration.
    pub fn from_spec(spec: &dyn NodeSpec, name: impl Into<String>) -> Self {
        let mut node = Self::new(spec.kind(), name).with_category(spec.category());
        for info in spec.input_slots() {
            node.declare_input(info);
        }
        for info in spec.output_slots() {
            node.declare_output(info);
        }
        node
    }

    /// Sets the category.
    pub fn with_category(mut self, category: NodeCategory) -> Self {
        self.category = category;
        self
    }

    /// Sets the compartment.
    pub fn with_compartment(mut self, compartment: CompartmentId) -> Self {
        self.compartment = Some(compartment);
        self
    }

    /// Adds an input slot declaration.
    pub fn with_input(mut self, info: SlotInfo) -> Self {
        self.declare_input(info);
        self
    }

    /// Adds an output slot declaration.
    pub fn with_output(mut self, info: SlotInfo) -> Self {
        self.declare_output(info);
        self
    }

    /// Declares an input slot, replacing any previous declaration of the name.
    pub fn declare_input(&mut self, info: SlotInfo) {
        self.inputs.insert(info.name.clone(), info);
    }

    /// Declares an output slot, replacing any previous declaration of the name.
    pub fn declare_output(&mut self, info: SlotInfo) {
        self.outputs.insert(info.name.clone(), info);
    }

    /// Retracts an input slot declaration. Returns whether it existed.
    pub fn retract_input(&mut self, name: &str) -> bool {
        self.inputs.shift_remove(name).is_some()
    }

    /// Retracts an output slot declaration. Returns whether it existed.
    pub fn retract_output(&mut self, name: &str) -> bool {
        self.outputs.shift_remove(name).is_some()
    }

    /// Kind reference of the node.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Display name of the node.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renames the node. The graph regenerates the alias on the next rebuild.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Category of the node.
    pub fn category(&self) -> NodeCategory {
        self.category
    }

    /// Compartment the node belongs to, if any.
    pub fn compartment(&self) -> Option<CompartmentId> {
        self.compartment
    }

    /// Moves the node into (or out of) a compartment.
    pub fn set_compartment(&mut self, compartment: Option<CompartmentId>) {
        self.compartment = compartment;
    }

    /// Whether the node participates in runs.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enables or disables the node.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Whether the node forwards its input unchanged instead of executing.
    pub fn is_pass_through(&self) -> bool {
        self.pass_through
    }

    /// Sets the pass-through flag.
    pub fn set_pass_through(&mut self, pass_through: bool) {
        self.pass_through = pass_through;
    }

    /// Declared input slot by name.
    pub fn input(&self, name: &str) -> Option<&SlotInfo> {
        self.inputs.get(name)
    }

    /// Declared output slot by name.
    pub fn output(&self, name: &str) -> Option<&SlotInfo> {
        self.outputs.get(name)
    }

    /// Declared input slots, in declaration order.
    pub fn inputs(&self) -> impl Iterator<Item = &SlotInfo> {
        self.inputs.values()
    }

    /// Declared output slots, in declaration order.
    pub fn outputs(&self) -> impl Iterator<Item = &SlotInfo> {
        self.outputs.values()
    }

    /// Number of declared input slots.
    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    /// Number of declared output slots.
    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// Whether pass-through forwarding applies to this node's shape.
    ///
    /// Forwarding needs at most one input and one output, with the output
    /// accepting the input's kind.
    pub fn pass_through_applicable(&self) -> bool {
        if self.inputs.len() > 1 || self.outputs.len() > 1 {
            return false;
        }
        match (self.inputs.values().next(), self.outputs.values().next()) {
            (Some(input), Some(output)) => {
                input.data_kind == output.data_kind
                    || input.data_kind == "*"
                    || output.data_kind == "*"
            }
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter_node() -> Node {
        Node::new("filter", "Filter")
            .with_input(SlotInfo::new("in", "image"))
            .with_output(SlotInfo::new("out", "image"))
    }

    #[test]
    fn test_slot_declarations_are_ordered() {
        let node = Node::new("merge", "Merge")
            .with_input(SlotInfo::new("b", "image"))
            .with_input(SlotInfo::new("a", "image"));
        let names: Vec<_> = node.inputs().map(|info| info.name.as_str()).collect();
        assert_eq!(names, ["b", "a"]);
    }

    #[test]
    fn test_duplicate_declaration_replaces() {
        let mut node = filter_node();
        node.declare_input(SlotInfo::new("in", "mask"));
        assert_eq!(node.input_count(), 1);
        assert_eq!(node.input("in").unwrap().data_kind, "mask");
    }

    #[test]
    fn test_pass_through_applicability() {
        assert!(filter_node().pass_through_applicable());

        let mismatched = Node::new("convert", "Convert")
            .with_input(SlotInfo::new("in", "image"))
            .with_output(SlotInfo::new("out", "table"));
        assert!(!mismatched.pass_through_applicable());

        let two_inputs = filter_node().with_input(SlotInfo::new("mask", "mask"));
        assert!(!two_inputs.pass_through_applicable());
    }

    #[test]
    fn test_category_capabilities() {
        assert!(NodeCategory::Standard.capabilities().user_deletable);
        assert!(!NodeCategory::Internal.capabilities().visible);
        assert!(!NodeCategory::LoopStart.capabilities().extractable);
    }
}
