//! The pipeline graph: slot-level structure, connectivity and derived state.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use petgraph::Direction;
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use tokio::sync::mpsc;

use crate::error::{PipelineError, PipelineResult};

use super::edge::EdgeData;
use super::id::{CompartmentId, NodeId, make_unique_alias};
use super::node::Node;
use super::slot::{SlotDirection, SlotId};

const TRACING_TARGET: &str = "trellis_pipeline::graph";

/// Structural change notification delivered to graph watchers.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphEvent {
    /// A node was inserted.
    NodeAdded(NodeId),
    /// A node was removed.
    NodeRemoved(NodeId),
    /// A data edge was inserted.
    Connected {
        /// Source output slot.
        source: SlotId,
        /// Target input slot.
        target: SlotId,
    },
    /// A data edge was removed.
    Disconnected {
        /// Source output slot.
        source: SlotId,
        /// Target input slot.
        target: SlotId,
    },
    /// Coalesced notification emitted after a bulk update.
    Changed {
        /// Graph generation after the update.
        generation: u64,
    },
}

/// Severity of a validation diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    /// Advisory only.
    Warning,
    /// The graph cannot run as configured.
    Error,
}

/// One validation diagnostic.
#[derive(Debug, Clone)]
pub struct ValidityIssue {
    /// Severity of the issue.
    pub severity: Severity,
    /// Node the issue concerns.
    pub node_id: NodeId,
    /// Slot the issue concerns, if slot-specific.
    pub slot: Option<String>,
    /// Human-readable description.
    pub message: String,
}

/// Aggregated validation diagnostics for a whole graph.
#[derive(Debug, Clone, Default)]
pub struct ValidityReport {
    issues: Vec<ValidityIssue>,
}

impl ValidityReport {
    /// All collected issues.
    pub fn issues(&self) -> &[ValidityIssue] {
        &self.issues
    }

    /// Whether no error-severity issue was collected.
    pub fn is_valid(&self) -> bool {
        !self
            .issues
            .iter()
            .any(|issue| issue.severity == Severity::Error)
    }

    fn push(&mut self, issue: ValidityIssue) {
        self.issues.push(issue);
    }
}

#[derive(Debug, Clone)]
struct TraversalCache {
    generation: u64,
    slots: Vec<SlotId>,
    nodes: Vec<NodeId>,
}

/// Directed pipeline graph over nodes and their slots.
///
/// Slots are the vertices of the underlying structural graph; every node
/// additionally carries implicit input-to-output edges so that nodes without
/// data connections stay connected components. Data edges are kept acyclic
/// with at most one incoming edge per input slot.
///
/// Structural mutations are expected to be externally serialized; the graph
/// is a single-writer structure.
#[derive(Debug)]
pub struct PipelineGraph {
    graph: StableDiGraph<SlotId, EdgeData>,
    slot_indices: HashMap<SlotId, NodeIndex>,
    nodes: IndexMap<NodeId, Node>,
    aliases: HashMap<NodeId, String>,
    alias_lookup: HashMap<String, NodeId>,
    generation: u64,
    cache: Option<TraversalCache>,
    watchers: Vec<mpsc::UnboundedSender<GraphEvent>>,
    suppressed: u32,
    pending_notification: bool,
}

impl PipelineGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self {
            graph: StableDiGraph::new(),
            slot_indices: HashMap::new(),
            nodes: IndexMap::new(),
            aliases: HashMap::new(),
            alias_lookup: HashMap::new(),
            generation: 0,
            cache: None,
            watchers: Vec::new(),
            suppressed: 0,
            pending_notification: false,
        }
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Whether a node exists.
    pub fn contains_node(&self, node_id: NodeId) -> bool {
        self.nodes.contains_key(&node_id)
    }

    /// Node IDs in insertion order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    /// Returns a node by ID.
    pub fn node(&self, node_id: NodeId) -> PipelineResult<&Node> {
        self.nodes
            .get(&node_id)
            .ok_or(PipelineError::UnknownNode { node_id })
    }

    /// Returns a node for mutation.
    ///
    /// After changing the node's slot declarations the caller must invoke
    /// [`repair_graph`](Self::repair_graph) to reconcile the structure.
    pub fn node_mut(&mut self, node_id: NodeId) -> PipelineResult<&mut Node> {
        self.nodes
            .get_mut(&node_id)
            .ok_or(PipelineError::UnknownNode { node_id })
    }

    /// Human-readable alias of a node.
    pub fn alias(&self, node_id: NodeId) -> Option<&str> {
        self.aliases.get(&node_id).map(String::as_str)
    }

    /// Looks a node up by alias.
    pub fn node_by_alias(&self, alias: &str) -> Option<NodeId> {
        self.alias_lookup.get(alias).copied()
    }

    /// Monotonic generation counter, bumped on every structural mutation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Inserts a node under a fresh random ID.
    pub fn insert_node(&mut self, node: Node) -> PipelineResult<NodeId> {
        self.insert_node_with_id(NodeId::new(), node)
    }

    /// Inserts a node under an explicit ID, failing on duplicates.
    pub fn insert_node_with_id(&mut self, node_id: NodeId, node: Node) -> PipelineResult<NodeId> {
        if self.nodes.contains_key(&node_id) {
            return Err(PipelineError::DuplicateNode { node_id });
        }
        let alias = {
            let taken: HashSet<String> = self.alias_lookup.keys().cloned().collect();
            make_unique_alias(node.name(), &taken)
        };
        self.aliases.insert(node_id, alias.clone());
        self.alias_lookup.insert(alias, node_id);
        self.nodes.insert(node_id, node);
        self.wire_node(node_id);
        self.touch();
        tracing::debug!(target: TRACING_TARGET, node_id = %node_id, "inserted node");
        self.notify(GraphEvent::NodeAdded(node_id));
        Ok(node_id)
    }

    /// Removes a node, releasing its slots and incident edges.
    pub fn remove_node(&mut self, node_id: NodeId) -> PipelineResult<Node> {
        let node = self
            .nodes
            .shift_remove(&node_id)
            .ok_or(PipelineError::UnknownNode { node_id })?;
        let owned: Vec<SlotId> = self
            .slot_indices
            .keys()
            .filter(|slot| slot.node_id == node_id)
            .cloned()
            .collect();
        for slot in owned {
            if let Some(index) = self.slot_indices.remove(&slot) {
                self.graph.remove_node(index);
            }
        }
        if let Some(alias) = self.aliases.remove(&node_id) {
            self.alias_lookup.remove(&alias);
        }
        self.touch();
        tracing::debug!(target: TRACING_TARGET, node_id = %node_id, "removed node");
        self.notify(GraphEvent::NodeRemoved(node_id));
        Ok(node)
    }

    /// Reassigns a node's ID, updating all owning maps atomically.
    pub fn rekey_node(&mut self, old_id: NodeId, new_id: NodeId) -> PipelineResult<()> {
        if !self.nodes.contains_key(&old_id) {
            return Err(PipelineError::UnknownNode { node_id: old_id });
        }
        if old_id != new_id && self.nodes.contains_key(&new_id) {
            return Err(PipelineError::DuplicateNode { node_id: new_id });
        }
        if old_id == new_id {
            return Ok(());
        }
        self.nodes = self
            .nodes
            .drain(..)
            .map(|(id, node)| if id == old_id { (new_id, node) } else { (id, node) })
            .collect();
        let moved: Vec<(SlotId, NodeIndex)> = self
            .slot_indices
            .iter()
            .filter(|(slot, _)| slot.node_id == old_id)
            .map(|(slot, index)| (slot.clone(), *index))
            .collect();
        for (slot, index) in moved {
            self.slot_indices.remove(&slot);
            let rekeyed = SlotId::new(new_id, slot.direction, slot.name);
            if let Some(weight) = self.graph.node_weight_mut(index) {
                *weight = rekeyed.clone();
            }
            self.slot_indices.insert(rekeyed, index);
        }
        if let Some(alias) = self.aliases.remove(&old_id) {
            self.alias_lookup.insert(alias.clone(), new_id);
            self.aliases.insert(new_id, alias);
        }
        self.touch();
        tracing::debug!(
            target: TRACING_TARGET,
            old_id = %old_id,
            new_id = %new_id,
            "rekeyed node",
        );
        self.notify(GraphEvent::Changed {
            generation: self.generation,
        });
        Ok(())
    }

    /// Connects an output slot to an input slot.
    ///
    /// Fails without mutating the graph when a structural rule is violated
    /// or the edge would introduce a cycle.
    pub fn connect(
        &mut self,
        source: &SlotId,
        target: &SlotId,
        user_can_disconnect: bool,
    ) -> PipelineResult<()> {
        let source_index = self.slot_index(source)?;
        let target_index = self.slot_index(target)?;
        self.check_connect_rules(source, target, target_index, false)?;
        if self.would_cycle(source_index, target_index) {
            return Err(PipelineError::CycleDetected {
                detail: format!("connecting {source} to {target} would close a loop"),
            });
        }
        self.graph
            .add_edge(source_index, target_index, EdgeData::data(user_can_disconnect));
        self.touch();
        tracing::debug!(target: TRACING_TARGET, source = %source, "connected slots");
        self.notify(GraphEvent::Connected {
            source: source.clone(),
            target: target.clone(),
        });
        Ok(())
    }

    /// Authoritative connectivity check, including cycle detection.
    ///
    /// `user` additionally enforces data-kind convertibility, as required for
    /// user-facing edits.
    pub fn can_connect(&self, source: &SlotId, target: &SlotId, user: bool) -> bool {
        let (Ok(source_index), Ok(target_index)) =
            (self.slot_index(source), self.slot_index(target))
        else {
            return false;
        };
        self.check_connect_rules(source, target, target_index, user)
            .is_ok()
            && !self.would_cycle(source_index, target_index)
    }

    /// Fast connectivity pre-check for interactive hinting.
    ///
    /// Runs only the O(degree) structural rules and does NOT guarantee
    /// acyclicity; [`can_connect`](Self::can_connect) is the ground truth.
    pub fn can_connect_fast(&self, source: &SlotId, target: &SlotId, user: bool) -> bool {
        let Ok(target_index) = self.slot_index(target) else {
            return false;
        };
        if self.slot_index(source).is_err() {
            return false;
        }
        self.check_connect_rules(source, target, target_index, user)
            .is_ok()
    }

    /// Removes the data edge between two slots.
    ///
    /// Returns `false` without failing when no such edge exists, or when
    /// `user` is set and the edge disallows user disconnection.
    pub fn disconnect(
        &mut self,
        source: &SlotId,
        target: &SlotId,
        user: bool,
    ) -> PipelineResult<bool> {
        let source_index = self.slot_index(source)?;
        let target_index = self.slot_index(target)?;
        let Some(edge) = self.graph.find_edge(source_index, target_index) else {
            return Ok(false);
        };
        let data = &self.graph[edge];
        if !data.is_data() || (user && !data.user_can_disconnect) {
            return Ok(false);
        }
        self.graph.remove_edge(edge);
        self.touch();
        tracing::debug!(target: TRACING_TARGET, source = %source, "disconnected slots");
        self.notify(GraphEvent::Disconnected {
            source: source.clone(),
            target: target.clone(),
        });
        Ok(true)
    }

    /// Removes every data edge incident to a slot. Returns how many.
    pub fn disconnect_all(&mut self, slot: &SlotId) -> PipelineResult<usize> {
        let index = self.slot_index(slot)?;
        let incident: Vec<_> = self
            .graph
            .edges_directed(index, Direction::Incoming)
            .chain(self.graph.edges_directed(index, Direction::Outgoing))
            .filter(|edge| edge.weight().is_data())
            .map(|edge| edge.id())
            .collect();
        let removed = incident.len();
        for edge in incident {
            self.graph.remove_edge(edge);
        }
        if removed > 0 {
            self.touch();
            self.notify(GraphEvent::Changed {
                generation: self.generation,
            });
        }
        Ok(removed)
    }

    /// The output slot feeding an input slot, if connected.
    pub fn source_slot(&self, input: &SlotId) -> PipelineResult<Option<SlotId>> {
        let index = self.slot_index(input)?;
        Ok(self.incoming_source(index))
    }

    /// All input slots fed by an output slot.
    pub fn target_slots(&self, output: &SlotId) -> PipelineResult<Vec<SlotId>> {
        let index = self.slot_index(output)?;
        Ok(self
            .graph
            .edges_directed(index, Direction::Outgoing)
            .filter(|edge| edge.weight().is_data())
            .map(|edge| self.graph[edge.target()].clone())
            .collect())
    }

    /// All data edges as `(source, target, edge)` triples.
    pub fn data_edges(&self) -> Vec<(SlotId, SlotId, EdgeData)> {
        self.graph
            .edge_references()
            .filter(|edge| edge.weight().is_data())
            .map(|edge| {
                (
                    self.graph[edge.source()].clone(),
                    self.graph[edge.target()].clone(),
                    edge.weight().clone(),
                )
            })
            .collect()
    }

    /// Data edges running from node `a` to node `b`.
    pub fn edges_between(&self, a: NodeId, b: NodeId) -> Vec<(SlotId, SlotId)> {
        self.graph
            .edge_references()
            .filter(|edge| edge.weight().is_data())
            .filter(|edge| {
                self.graph[edge.source()].node_id == a && self.graph[edge.target()].node_id == b
            })
            .map(|edge| {
                (
                    self.graph[edge.source()].clone(),
                    self.graph[edge.target()].clone(),
                )
            })
            .collect()
    }

    /// Slots with no data edge: inputs lacking a source, outputs lacking
    /// targets. Deterministic node-insertion/declaration order.
    pub fn unconnected_slots(&self) -> Vec<SlotId> {
        let mut result = Vec::new();
        for (&node_id, node) in &self.nodes {
            for info in node.inputs() {
                let slot = SlotId::input(node_id, info.name.clone());
                if let Some(&index) = self.slot_indices.get(&slot)
                    && self.incoming_source(index).is_none()
                {
                    result.push(slot);
                }
            }
            for info in node.outputs() {
                let slot = SlotId::output(node_id, info.name.clone());
                if let Some(&index) = self.slot_indices.get(&slot)
                    && !self
                        .graph
                        .edges_directed(index, Direction::Outgoing)
                        .any(|edge| edge.weight().is_data())
                {
                    result.push(slot);
                }
            }
        }
        result
    }

    /// Output slots that could legally feed `target`.
    ///
    /// `fast` trades the acyclicity guarantee for O(degree) per candidate.
    pub fn available_sources(
        &self,
        target: &SlotId,
        user: bool,
        fast: bool,
    ) -> PipelineResult<Vec<SlotId>> {
        self.slot_index(target)?;
        Ok(self
            .all_slots(SlotDirection::Output)
            .into_iter()
            .filter(|candidate| {
                if fast {
                    self.can_connect_fast(candidate, target, user)
                } else {
                    self.can_connect(candidate, target, user)
                }
            })
            .collect())
    }

    /// Input slots that `source` could legally feed.
    pub fn available_targets(
        &self,
        source: &SlotId,
        user: bool,
        fast: bool,
    ) -> PipelineResult<Vec<SlotId>> {
        self.slot_index(source)?;
        Ok(self
            .all_slots(SlotDirection::Input)
            .into_iter()
            .filter(|candidate| {
                if fast {
                    self.can_connect_fast(source, candidate, user)
                } else {
                    self.can_connect(source, candidate, user)
                }
            })
            .collect())
    }

    /// Reconciles the structural graph with current slot declarations.
    ///
    /// Adds vertices and internal edges for newly declared slots, removes
    /// vertices for retracted ones. Idempotent; emits one notification only
    /// when something actually changed.
    pub fn repair_graph(&mut self) -> bool {
        let mut modified = false;

        let declared: HashSet<SlotId> = self
            .nodes
            .iter()
            .flat_map(|(&node_id, node)| {
                node.inputs()
                    .map(move |info| SlotId::input(node_id, info.name.clone()))
                    .chain(
                        node.outputs()
                            .map(move |info| SlotId::output(node_id, info.name.clone())),
                    )
            })
            .collect();

        let retracted: Vec<SlotId> = self
            .slot_indices
            .keys()
            .filter(|slot| !declared.contains(*slot))
            .cloned()
            .collect();
        for slot in retracted {
            if let Some(index) = self.slot_indices.remove(&slot) {
                self.graph.remove_node(index);
                modified = true;
            }
        }

        for slot in declared {
            if !self.slot_indices.contains_key(&slot) {
                let index = self.graph.add_node(slot.clone());
                self.slot_indices.insert(slot, index);
                modified = true;
            }
        }

        // Internal input->output edges per node.
        let node_ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        for node_id in node_ids {
            modified |= self.wire_internal_edges(node_id);
        }

        if modified {
            self.touch();
            tracing::debug!(target: TRACING_TARGET, "repaired graph structure");
            self.notify(GraphEvent::Changed {
                generation: self.generation,
            });
        }
        modified
    }

    /// Nodes in topological order.
    ///
    /// Reduced from the slot-level order by first output-slot appearance;
    /// nodes without any data edge are appended at the end in insertion
    /// order. Cached until the next structural mutation.
    pub fn traverse(&mut self) -> PipelineResult<Vec<NodeId>> {
        self.ensure_cache()?;
        Ok(self
            .cache
            .as_ref()
            .map(|cache| cache.nodes.clone())
            .unwrap_or_default())
    }

    /// Slots in topological order. Cached like [`traverse`](Self::traverse).
    pub fn traverse_slots(&mut self) -> PipelineResult<Vec<SlotId>> {
        self.ensure_cache()?;
        Ok(self
            .cache
            .as_ref()
            .map(|cache| cache.slots.clone())
            .unwrap_or_default())
    }

    /// Nodes that will not run: disabled ones, plus (when `cascading`) nodes
    /// with an unfilled required input or a required input sourced from a
    /// deactivated node.
    pub fn deactivated_nodes(&mut self, cascading: bool) -> PipelineResult<HashSet<NodeId>> {
        if !cascading {
            return Ok(self
                .nodes
                .iter()
                .filter(|(_, node)| !node.is_enabled())
                .map(|(&id, _)| id)
                .collect());
        }
        let order = self.traverse()?;
        let mut deactivated = HashSet::new();
        for node_id in order {
            let node = &self.nodes[&node_id];
            if !node.is_enabled() {
                deactivated.insert(node_id);
                continue;
            }
            for info in node.inputs() {
                if info.optional {
                    continue;
                }
                let slot = SlotId::input(node_id, info.name.clone());
                let source = self
                    .slot_indices
                    .get(&slot)
                    .and_then(|&index| self.incoming_source(index));
                match source {
                    None => {
                        deactivated.insert(node_id);
                        break;
                    }
                    Some(source) if deactivated.contains(&source.node_id) => {
                        deactivated.insert(node_id);
                        break;
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(deactivated)
    }

    /// Validates the graph, aggregating all violations instead of halting.
    pub fn report_validity(&self) -> ValidityReport {
        let mut report = ValidityReport::default();
        for (&node_id, node) in &self.nodes {
            if !node.is_enabled() || node.is_pass_through() {
                continue;
            }
            for info in node.inputs() {
                if info.optional {
                    continue;
                }
                let slot = SlotId::input(node_id, info.name.clone());
                let connected = self
                    .slot_indices
                    .get(&slot)
                    .is_some_and(|&index| self.incoming_source(index).is_some());
                if !connected {
                    report.push(ValidityIssue {
                        severity: Severity::Error,
                        node_id,
                        slot: Some(info.name.clone()),
                        message: format!("required input {} is not connected", info.name),
                    });
                }
            }
        }
        report
    }

    /// Inserts all nodes and data edges of another graph into this one.
    ///
    /// Fails upfront on any node-ID conflict; emits a single coalesced
    /// notification at the end.
    pub fn merge_from(&mut self, other: &PipelineGraph) -> PipelineResult<()> {
        if let Some(&node_id) = other.nodes.keys().find(|id| self.nodes.contains_key(*id)) {
            return Err(PipelineError::DuplicateNode { node_id });
        }
        self.begin_update();
        let result = (|| {
            for (&node_id, node) in &other.nodes {
                self.insert_node_with_id(node_id, node.clone())?;
            }
            for (source, target, data) in other.data_edges() {
                self.connect(&source, &target, data.user_can_disconnect)?;
            }
            Ok(())
        })();
        self.end_update();
        result
    }

    /// Copies a subset of nodes, and every data edge between them, into a
    /// new graph. Node IDs are preserved.
    pub fn extract(&self, node_ids: &[NodeId]) -> PipelineResult<PipelineGraph> {
        let selected: HashSet<NodeId> = node_ids.iter().copied().collect();
        let mut sub = PipelineGraph::new();
        sub.begin_update();
        for (&node_id, node) in &self.nodes {
            if !selected.contains(&node_id) {
                continue;
            }
            sub.insert_node_with_id(node_id, node.clone())?;
        }
        for node_id in &selected {
            if !self.nodes.contains_key(node_id) {
                return Err(PipelineError::UnknownNode { node_id: *node_id });
            }
        }
        for (source, target, data) in self.data_edges() {
            if selected.contains(&source.node_id) && selected.contains(&target.node_id) {
                sub.connect(&source, &target, data.user_can_disconnect)?;
            }
        }
        sub.end_update();
        Ok(sub)
    }

    /// Nodes belonging to a compartment, in insertion order.
    pub fn nodes_in_compartment(&self, compartment: CompartmentId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.compartment() == Some(compartment))
            .map(|(&id, _)| id)
            .collect()
    }

    /// Subscribes to structural change notifications.
    ///
    /// Watchers are dropped automatically once the receiver is closed.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<GraphEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.push(tx);
        rx
    }

    /// Starts a bulk update: notifications are coalesced into a single
    /// [`GraphEvent::Changed`] when the matching [`end_update`](Self::end_update)
    /// closes the scope.
    pub fn begin_update(&mut self) {
        self.suppressed += 1;
    }

    /// Ends a bulk update, emitting the coalesced notification if anything
    /// changed.
    pub fn end_update(&mut self) {
        self.suppressed = self.suppressed.saturating_sub(1);
        if self.suppressed == 0 && self.pending_notification {
            self.pending_notification = false;
            let event = GraphEvent::Changed {
                generation: self.generation,
            };
            self.watchers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    fn slot_index(&self, slot: &SlotId) -> PipelineResult<NodeIndex> {
        self.slot_indices
            .get(slot)
            .copied()
            .ok_or_else(|| PipelineError::UnknownSlot { slot: slot.clone() })
    }

    fn incoming_source(&self, index: NodeIndex) -> Option<SlotId> {
        self.graph
            .edges_directed(index, Direction::Incoming)
            .find(|edge| edge.weight().is_data())
            .map(|edge| self.graph[edge.source()].clone())
    }

    fn check_connect_rules(
        &self,
        source: &SlotId,
        target: &SlotId,
        target_index: NodeIndex,
        user: bool,
    ) -> PipelineResult<()> {
        let reject = |reason: &str| {
            Err(PipelineError::InvalidConnection {
                source_slot: source.clone(),
                target_slot: target.clone(),
                reason: reason.to_string(),
            })
        };
        if source.direction != SlotDirection::Output {
            return reject("source is not an output slot");
        }
        if target.direction != SlotDirection::Input {
            return reject("target is not an input slot");
        }
        if source.node_id == target.node_id {
            return reject("source and target belong to the same node");
        }
        if self.incoming_source(target_index).is_some() {
            return reject("target already has an incoming edge");
        }
        if user {
            let source_kind = self
                .nodes
                .get(&source.node_id)
                .and_then(|node| node.output(&source.name))
                .map(|info| info.data_kind.clone());
            let target_kind = self
                .nodes
                .get(&target.node_id)
                .and_then(|node| node.input(&target.name))
                .map(|info| info.data_kind.clone());
            match (source_kind, target_kind) {
                (Some(from), Some(to)) if kinds_convertible(&from, &to) => {}
                _ => return reject("data kinds are not convertible"),
            }
        }
        Ok(())
    }

    fn would_cycle(&self, source_index: NodeIndex, target_index: NodeIndex) -> bool {
        let mut probe = self.graph.clone();
        probe.add_edge(source_index, target_index, EdgeData::data(true));
        is_cyclic_directed(&probe)
    }

    fn all_slots(&self, direction: SlotDirection) -> Vec<SlotId> {
        let mut result = Vec::new();
        for (&node_id, node) in &self.nodes {
            let infos: Vec<&str> = match direction {
                SlotDirection::Input => node.inputs().map(|info| info.name.as_str()).collect(),
                SlotDirection::Output => node.outputs().map(|info| info.name.as_str()).collect(),
            };
            for name in infos {
                result.push(SlotId::new(node_id, direction, name));
            }
        }
        result
    }

    fn wire_node(&mut self, node_id: NodeId) {
        let slots: Vec<SlotId> = {
            let node = &self.nodes[&node_id];
            node.inputs()
                .map(|info| SlotId::input(node_id, info.name.clone()))
                .chain(node.outputs().map(|info| SlotId::output(node_id, info.name.clone())))
                .collect()
        };
        for slot in slots {
            if !self.slot_indices.contains_key(&slot) {
                let index = self.graph.add_node(slot.clone());
                self.slot_indices.insert(slot, index);
            }
        }
        self.wire_internal_edges(node_id);
    }

    fn wire_internal_edges(&mut self, node_id: NodeId) -> bool {
        let node = match self.nodes.get(&node_id) {
            Some(node) => node,
            None => return false,
        };
        let inputs: Vec<SlotId> = node
            .inputs()
            .map(|info| SlotId::input(node_id, info.name.clone()))
            .collect();
        let outputs: Vec<SlotId> = node
            .outputs()
            .map(|info| SlotId::output(node_id, info.name.clone()))
            .collect();
        let mut modified = false;
        for input in &inputs {
            for output in &outputs {
                let (Some(&from), Some(&to)) =
                    (self.slot_indices.get(input), self.slot_indices.get(output))
                else {
                    continue;
                };
                if self.graph.find_edge(from, to).is_none() {
                    self.graph.add_edge(from, to, EdgeData::internal());
                    modified = true;
                }
            }
        }
        modified
    }

    fn ensure_cache(&mut self) -> PipelineResult<()> {
        if self
            .cache
            .as_ref()
            .is_some_and(|cache| cache.generation == self.generation)
        {
            return Ok(());
        }
        let sorted =
            toposort(&self.graph, None).map_err(|cycle| PipelineError::CycleDetected {
                detail: format!("traversal failed at slot {}", self.graph[cycle.node_id()]),
            })?;
        let slots: Vec<SlotId> = sorted.iter().map(|&index| self.graph[index].clone()).collect();

        let mut with_data_edges = HashSet::new();
        for edge in self.graph.edge_references() {
            if edge.weight().is_data() {
                with_data_edges.insert(self.graph[edge.source()].node_id);
                with_data_edges.insert(self.graph[edge.target()].node_id);
            }
        }

        let mut nodes = Vec::with_capacity(self.nodes.len());
        let mut seen = HashSet::new();
        for slot in &slots {
            if slot.direction == SlotDirection::Output
                && with_data_edges.contains(&slot.node_id)
                && seen.insert(slot.node_id)
            {
                nodes.push(slot.node_id);
            }
        }
        for &node_id in self.nodes.keys() {
            if seen.insert(node_id) {
                nodes.push(node_id);
            }
        }

        self.cache = Some(TraversalCache {
            generation: self.generation,
            slots,
            nodes,
        });
        Ok(())
    }

    fn touch(&mut self) {
        self.generation += 1;
        self.cache = None;
    }

    fn notify(&mut self, event: GraphEvent) {
        if self.suppressed > 0 {
            self.pending_notification = true;
            return;
        }
        self.watchers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl Default for PipelineGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for PipelineGraph {
    /// Clones the structure only; watchers stay with the original.
    fn clone(&self) -> Self {
        Self {
            graph: self.graph.clone(),
            slot_indices: self.slot_indices.clone(),
            nodes: self.nodes.clone(),
            aliases: self.aliases.clone(),
            alias_lookup: self.alias_lookup.clone(),
            generation: self.generation,
            cache: self.cache.clone(),
            watchers: Vec::new(),
            suppressed: 0,
            pending_notification: false,
        }
    }
}

fn kinds_convertible(from: &str, to: &str) -> bool {
    from == to || from == "*" || to == "*"
}
