//! Slot declarations and the row-oriented data plane.
//!
//! Slots are the typed, directional endpoints of nodes. The structural graph
//! stores slots as vertices; the data a slot carries during a run lives in a
//! separate [`DataStore`] so the graph itself stays purely structural.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use strum::Display;

use super::id::NodeId;

/// Direction of a slot relative to its owning node.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SlotDirection {
    /// The slot receives data from an upstream output.
    Input,
    /// The slot produces data for downstream inputs.
    Output,
}

/// Role of a slot within batch construction.
#[derive(Debug, Display, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SlotRole {
    /// Plain data slot, participates in batch matching.
    #[default]
    Data,
    /// Parametric-looping slot, excluded from batch matching.
    Parameter,
}

/// Declared shape of a slot: its name, accepted data kind and flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotInfo {
    /// Slot name, unique within the owning node per direction.
    pub name: String,
    /// Accepted data kind tag. `"*"` accepts any kind.
    pub data_kind: String,
    /// Whether the slot may stay unconnected on an enabled node.
    #[serde(default)]
    pub optional: bool,
    /// Role of the slot within batch construction.
    #[serde(default)]
    pub role: SlotRole,
}

impl SlotInfo {
    /// Creates a required data slot declaration.
    pub fn new(name: impl Into<String>, data_kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_kind: data_kind.into(),
            optional: false,
            role: SlotRole::Data,
        }
    }

    /// Marks the slot as optional.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Sets the slot role.
    pub fn with_role(mut self, role: SlotRole) -> Self {
        self.role = role;
        self
    }
}

/// Identity of a slot for graph purposes: owning node, direction and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotId {
    /// Owning node.
    pub node_id: NodeId,
    /// Slot direction.
    pub direction: SlotDirection,
    /// Slot name.
    pub name: String,
}

impl SlotId {
    /// Creates a slot identity.
    pub fn new(node_id: NodeId, direction: SlotDirection, name: impl Into<String>) -> Self {
        Self {
            node_id,
            direction,
            name: name.into(),
        }
    }

    /// Shorthand for an input slot identity.
    pub fn input(node_id: NodeId, name: impl Into<String>) -> Self {
        Self::new(node_id, SlotDirection::Input, name)
    }

    /// Shorthand for an output slot identity.
    pub fn output(node_id: NodeId, name: impl Into<String>) -> Self {
        Self::new(node_id, SlotDirection::Output, name)
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.node_id, self.direction, self.name)
    }
}

/// Per-row metadata tags, string key to string value.
pub type RowMetadata = BTreeMap<String, String>;

/// One data row: an opaque payload plus its metadata tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRow {
    /// Opaque payload. The core never inspects it.
    pub payload: serde_json::Value,
    /// Metadata tags used for batch matching.
    #[serde(default)]
    pub metadata: RowMetadata,
}

impl DataRow {
    /// Creates a row from a payload and metadata tags.
    pub fn new(payload: serde_json::Value, metadata: RowMetadata) -> Self {
        Self { payload, metadata }
    }
}

/// Ordered collection of rows held by one slot during a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSlot {
    rows: Vec<DataRow>,
}

impl DataSlot {
    /// Creates an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a row.
    pub fn append(&mut self, payload: serde_json::Value, metadata: RowMetadata) {
        self.rows.push(DataRow::new(payload, metadata));
    }

    /// Number of rows.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Whether the slot holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Returns a row by index.
    pub fn row(&self, index: usize) -> Option<&DataRow> {
        self.rows.get(index)
    }

    /// Returns the metadata tags of a row.
    pub fn metadata_of(&self, index: usize) -> Option<&RowMetadata> {
        self.rows.get(index).map(|row| &row.metadata)
    }

    /// Iterates over all rows in order.
    pub fn rows(&self) -> impl Iterator<Item = &DataRow> {
        self.rows.iter()
    }

    /// Removes all rows.
    pub fn clear(&mut self) {
        self.rows.clear();
    }
}

/// Run-time storage mapping each slot to its rows.
///
/// The batch builder and scheduler read and write rows exclusively through
/// this store; the structural graph never holds data.
#[derive(Debug, Clone, Default)]
pub struct DataStore {
    slots: HashMap<SlotId, DataSlot>,
}

impl DataStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensures an (empty) entry exists for the given slot.
    pub fn ensure_slot(&mut self, slot_id: SlotId) -> &mut DataSlot {
        self.slots.entry(slot_id).or_default()
    }

    /// Returns the rows of a slot, if present.
    pub fn slot(&self, slot_id: &SlotId) -> Option<&DataSlot> {
        self.slots.get(slot_id)
    }

    /// Returns the rows of a slot for mutation, if present.
    pub fn slot_mut(&mut self, slot_id: &SlotId) -> Option<&mut DataSlot> {
        self.slots.get_mut(slot_id)
    }

    /// Number of rows in a slot. Missing slots count as zero.
    pub fn row_count(&self, slot_id: &SlotId) -> usize {
        self.slots.get(slot_id).map_or(0, DataSlot::row_count)
    }

    /// Returns the metadata of one row of a slot.
    pub fn metadata_of(&self, slot_id: &SlotId, row: usize) -> Option<&RowMetadata> {
        self.slots.get(slot_id).and_then(|slot| slot.metadata_of(row))
    }

    /// Appends a row to a slot, creating the slot entry when missing.
    pub fn append_row(
        &mut self,
        slot_id: SlotId,
        payload: serde_json::Value,
        metadata: RowMetadata,
    ) {
        self.slots.entry(slot_id).or_default().append(payload, metadata);
    }

    /// Removes all rows from every slot.
    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_store_append_and_count() {
        let mut store = DataStore::new();
        let slot = SlotId::output(NodeId::new(), "out");
        assert_eq!(store.row_count(&slot), 0);

        store.append_row(slot.clone(), json!({"v": 1}), RowMetadata::new());
        store.append_row(slot.clone(), json!({"v": 2}), RowMetadata::new());
        assert_eq!(store.row_count(&slot), 2);
    }

    #[test]
    fn test_metadata_lookup() {
        let mut store = DataStore::new();
        let slot = SlotId::input(NodeId::new(), "in");
        let mut tags = RowMetadata::new();
        tags.insert("#sample".to_string(), "a".to_string());
        store.append_row(slot.clone(), json!(null), tags.clone());

        assert_eq!(store.metadata_of(&slot, 0), Some(&tags));
        assert_eq!(store.metadata_of(&slot, 1), None);
    }
}
