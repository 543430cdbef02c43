//! The data-batch matching engine.
//!
//! Given the input slots of one node, each a sequence of rows with metadata
//! tags, the builder partitions all rows into batches so that rows sharing
//! the same reference-key values land in the same batch.

use std::collections::{BTreeSet, HashSet};

use indexmap::IndexMap;

use crate::error::{PipelineError, PipelineResult};
use crate::graph::{DataSlot, NodeId, RowMetadata};

use super::key::BatchKey;
use super::strategy::{ColumnMatching, KeyFilter, MergeMode, ReferenceKeys, reference_keys};

const TRACING_TARGET: &str = "trellis_pipeline::batch";

/// Settings controlling batch generation for one node.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BatchSettings {
    /// Reference key policy.
    #[serde(default)]
    pub column_matching: ColumnMatching,
    /// Filter for [`ColumnMatching::Custom`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_filter: Option<KeyFilter>,
    /// Silently drop incomplete batches instead of failing.
    #[serde(default)]
    pub skip_incomplete: bool,
    /// Conflict resolution for non-key metadata.
    #[serde(default)]
    pub merge_mode: MergeMode,
}

/// A batch allowing zero, one or many rows per contributing slot.
///
/// Transient: built per run and discarded after node invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct MergingBatch {
    node_id: NodeId,
    rows: IndexMap<String, Vec<usize>>,
    optional: HashSet<String>,
    metadata: RowMetadata,
}

impl MergingBatch {
    /// Node the batch belongs to.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Row indices of one slot. Unknown slots yield an empty slice.
    pub fn rows(&self, slot: &str) -> &[usize] {
        self.rows.get(slot).map_or(&[], Vec::as_slice)
    }

    /// Contributing slots with their row indices, in slot order.
    pub fn slot_rows(&self) -> impl Iterator<Item = (&str, &[usize])> {
        self.rows
            .iter()
            .map(|(name, rows)| (name.as_str(), rows.as_slice()))
    }

    /// Aggregated metadata of the batch.
    pub fn metadata(&self) -> &RowMetadata {
        &self.metadata
    }

    /// Whether any required contributing slot has zero rows in this batch.
    /// Optional slots never count as missing.
    pub fn is_incomplete(&self) -> bool {
        self.rows
            .iter()
            .any(|(name, rows)| rows.is_empty() && !self.optional.contains(name))
    }

    /// Whether every contributing slot has exactly one row.
    pub fn is_single(&self) -> bool {
        self.rows.values().all(|rows| rows.len() == 1)
    }
}

/// A strict batch: exactly one row per contributing slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    node_id: NodeId,
    rows: IndexMap<String, usize>,
    metadata: RowMetadata,
}

impl Batch {
    /// Node the batch belongs to.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Row index of one slot.
    pub fn row(&self, slot: &str) -> Option<usize> {
        self.rows.get(slot).copied()
    }

    /// Aggregated metadata of the batch.
    pub fn metadata(&self) -> &RowMetadata {
        &self.metadata
    }
}

/// Reduces merging batches to strict single-row batches.
///
/// Slots without rows are dropped from the resulting batch; the whole
/// reduction fails if any batch holds more than one row for some slot, so
/// nothing is ever truncated silently.
pub fn convert_to_single_batches(batches: &[MergingBatch]) -> PipelineResult<Vec<Batch>> {
    let mut result = Vec::with_capacity(batches.len());
    for batch in batches {
        let mut rows = IndexMap::new();
        for (slot, indices) in batch.slot_rows() {
            match indices {
                [] => {}
                [row] => {
                    rows.insert(slot.to_string(), *row);
                }
                many => {
                    return Err(PipelineError::NonSingularBatch {
                        node_id: batch.node_id,
                        slot: slot.to_string(),
                        rows: many.len(),
                    });
                }
            }
        }
        result.push(Batch {
            node_id: batch.node_id,
            rows,
            metadata: batch.metadata.clone(),
        });
    }
    Ok(result)
}

/// Partitions the rows of a node's input slots into matched batches.
#[derive(Debug)]
pub struct BatchBuilder<'a> {
    node_id: NodeId,
    settings: BatchSettings,
    slots: Vec<(String, &'a DataSlot, bool)>,
}

impl<'a> BatchBuilder<'a> {
    /// Creates a builder with default settings.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            settings: BatchSettings::default(),
            slots: Vec::new(),
        }
    }

    /// Sets the generation settings.
    pub fn with_settings(mut self, settings: BatchSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Adds a required contributing input slot.
    pub fn with_slot(mut self, name: impl Into<String>, slot: &'a DataSlot) -> Self {
        self.slots.push((name.into(), slot, false));
        self
    }

    /// Adds an optional contributing input slot. Batches without rows for
    /// this slot stay complete.
    pub fn with_optional_slot(mut self, name: impl Into<String>, slot: &'a DataSlot) -> Self {
        self.slots.push((name.into(), slot, true));
        self
    }

    /// Builds the batch set.
    ///
    /// Batches are sorted by their aggregated metadata, so identical inputs
    /// always yield the same run order. Incomplete batches are dropped or
    /// fatal depending on [`BatchSettings::skip_incomplete`].
    pub fn build(self) -> PipelineResult<Vec<MergingBatch>> {
        let observed: Vec<BTreeSet<String>> = self
            .slots
            .iter()
            .map(|(_, slot, _)| {
                slot.rows()
                    .flat_map(|row| row.metadata.keys().cloned())
                    .collect()
            })
            .collect();
        let optional: HashSet<String> = self
            .slots
            .iter()
            .filter(|(_, _, optional)| *optional)
            .map(|(name, _, _)| name.clone())
            .collect();
        let reference = reference_keys(
            self.settings.column_matching,
            self.settings.custom_filter.as_ref(),
            &observed,
        );

        let mut groups: IndexMap<BatchKey, IndexMap<String, Vec<usize>>> = IndexMap::new();
        let empty_rows = || -> IndexMap<String, Vec<usize>> {
            self.slots
                .iter()
                .map(|(name, _, _)| (name.clone(), Vec::new()))
                .collect()
        };
        match &reference {
            ReferenceKeys::MergeAll => {
                let group = groups.entry(BatchKey::default()).or_insert_with(empty_rows);
                for (name, slot, _) in &self.slots {
                    group[name].extend(0..slot.row_count());
                }
            }
            ReferenceKeys::SplitAll => {
                for (name, slot, _) in &self.slots {
                    for row in 0..slot.row_count() {
                        let group = groups
                            .entry(BatchKey::synthetic(name, row))
                            .or_insert_with(empty_rows);
                        group[name].push(row);
                    }
                }
            }
            ReferenceKeys::Keys(keys) => {
                for (name, slot, _) in &self.slots {
                    for (row, data) in slot.rows().enumerate() {
                        let key = BatchKey::from_metadata(keys, &data.metadata);
                        let group = groups.entry(key).or_insert_with(empty_rows);
                        group[name].push(row);
                    }
                }
            }
        }

        let mut batches = Vec::with_capacity(groups.len());
        for (key, rows) in groups {
            let metadata = self.aggregate_metadata(&rows);
            let batch = MergingBatch {
                node_id: self.node_id,
                rows,
                optional: optional.clone(),
                metadata,
            };
            if batch.is_incomplete() {
                if self.settings.skip_incomplete {
                    tracing::debug!(
                        target: TRACING_TARGET,
                        node_id = %self.node_id,
                        key = %key,
                        "skipping incomplete batch",
                    );
                    continue;
                }
                let missing = batch
                    .slot_rows()
                    .filter(|(name, rows)| rows.is_empty() && !optional.contains(*name))
                    .map(|(name, _)| name.to_string())
                    .collect();
                return Err(PipelineError::IncompleteBatch {
                    node_id: self.node_id,
                    missing,
                });
            }
            batches.push(batch);
        }

        batches.sort_by(|a, b| a.metadata.iter().cmp(b.metadata.iter()));
        Ok(batches)
    }

    fn aggregate_metadata(&self, rows: &IndexMap<String, Vec<usize>>) -> RowMetadata {
        let mut metadata = RowMetadata::new();
        for (name, slot, _) in &self.slots {
            let Some(indices) = rows.get(name) else {
                continue;
            };
            for &row in indices {
                let Some(tags) = slot.metadata_of(row) else {
                    continue;
                };
                for (key, incoming) in tags {
                    match metadata.get(key) {
                        None => {
                            metadata.insert(key.clone(), incoming.clone());
                        }
                        Some(existing) if existing == incoming => {}
                        Some(existing) => {
                            match self.settings.merge_mode.resolve(existing, incoming) {
                                Some(resolved) => {
                                    metadata.insert(key.clone(), resolved);
                                }
                                None => {
                                    metadata.remove(key);
                                }
                            }
                        }
                    }
                }
            }
        }
        metadata
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::*;

    fn test_node_id() -> NodeId {
        NodeId::from_uuid(Uuid::from_u128(7))
    }

    fn tags(pairs: &[(&str, &str)]) -> RowMetadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn slot_with(rows: &[&[(&str, &str)]]) -> DataSlot {
        let mut slot = DataSlot::new();
        for row in rows {
            slot.append(json!(null), tags(row));
        }
        slot
    }

    fn union_settings() -> BatchSettings {
        BatchSettings {
            column_matching: ColumnMatching::Union,
            ..BatchSettings::default()
        }
    }

    #[test]
    fn test_union_matches_equal_values() {
        let left = slot_with(&[&[("a", "x")]]);
        let right = slot_with(&[&[("a", "x")]]);
        let batches = BatchBuilder::new(test_node_id())
            .with_settings(union_settings())
            .with_slot("left", &left)
            .with_slot("right", &right)
            .build()
            .unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].rows("left"), &[0]);
        assert_eq!(batches[0].rows("right"), &[0]);
    }

    #[test]
    fn test_union_splits_mismatched_values() {
        let left = slot_with(&[&[("a", "x")]]);
        let right = slot_with(&[&[("a", "y")]]);
        let settings = BatchSettings {
            column_matching: ColumnMatching::Union,
            skip_incomplete: true,
            ..BatchSettings::default()
        };
        let batches = BatchBuilder::new(test_node_id())
            .with_settings(settings)
            .with_slot("left", &left)
            .with_slot("right", &right)
            .build()
            .unwrap();
        // Both batches are incomplete and get skipped.
        assert!(batches.is_empty());
    }

    #[test]
    fn test_merge_all_yields_one_batch() {
        let left = slot_with(&[&[("a", "x")], &[("a", "y")]]);
        let right = slot_with(&[&[("b", "z")]]);
        let settings = BatchSettings {
            column_matching: ColumnMatching::MergeAll,
            ..BatchSettings::default()
        };
        let batches = BatchBuilder::new(test_node_id())
            .with_settings(settings)
            .with_slot("left", &left)
            .with_slot("right", &right)
            .build()
            .unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].rows("left"), &[0, 1]);
        assert_eq!(batches[0].rows("right"), &[0]);
    }

    #[test]
    fn test_merge_all_with_no_slots() {
        let settings = BatchSettings {
            column_matching: ColumnMatching::MergeAll,
            ..BatchSettings::default()
        };
        let batches = BatchBuilder::new(test_node_id())
            .with_settings(settings)
            .build()
            .unwrap();
        assert_eq!(batches.len(), 1);
        assert!(!batches[0].is_incomplete());
    }

    #[test]
    fn test_split_all_yields_singletons() {
        let slot = slot_with(&[&[("a", "x")], &[("a", "x")], &[("a", "y")]]);
        let settings = BatchSettings {
            column_matching: ColumnMatching::SplitAll,
            ..BatchSettings::default()
        };
        let batches = BatchBuilder::new(test_node_id())
            .with_settings(settings)
            .with_slot("in", &slot)
            .build()
            .unwrap();
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(MergingBatch::is_single));
    }

    #[test]
    fn test_prefix_hash_ignores_unprefixed_keys() {
        let left = slot_with(&[&[("#sample", "s1"), ("path", "/a")]]);
        let right = slot_with(&[&[("#sample", "s1"), ("path", "/b")]]);
        let batches = BatchBuilder::new(test_node_id())
            .with_slot("left", &left)
            .with_slot("right", &right)
            .build()
            .unwrap();
        // Default PrefixHashUnion: only #sample participates, paths differ.
        assert_eq!(batches.len(), 1);
    }

    #[test]
    fn test_empty_optional_slot_stays_complete() {
        let image = slot_with(&[&[("#id", "a")], &[("#id", "b")]]);
        let mask = slot_with(&[]);
        let batches = BatchBuilder::new(test_node_id())
            .with_slot("image", &image)
            .with_optional_slot("mask", &mask)
            .build()
            .unwrap();
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|batch| !batch.is_incomplete()));
        assert_eq!(batches[0].rows("mask"), &[] as &[usize]);
    }

    #[test]
    fn test_incomplete_fails_without_skip() {
        let left = slot_with(&[&[("a", "x")]]);
        let right = slot_with(&[]);
        let err = BatchBuilder::new(test_node_id())
            .with_settings(union_settings())
            .with_slot("left", &left)
            .with_slot("right", &right)
            .build()
            .unwrap_err();
        match err {
            PipelineError::IncompleteBatch { missing, .. } => {
                assert_eq!(missing, vec!["right".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_incomplete_skipped_with_flag() {
        let left = slot_with(&[&[("a", "x")]]);
        let right = slot_with(&[]);
        let settings = BatchSettings {
            column_matching: ColumnMatching::Union,
            skip_incomplete: true,
            ..BatchSettings::default()
        };
        let batches = BatchBuilder::new(test_node_id())
            .with_settings(settings)
            .with_slot("left", &left)
            .with_slot("right", &right)
            .build()
            .unwrap();
        assert!(batches.is_empty());
    }

    #[test]
    fn test_batches_sorted_by_metadata() {
        let slot = slot_with(&[&[("#id", "beta")], &[("#id", "alpha")]]);
        let batches = BatchBuilder::new(test_node_id())
            .with_slot("in", &slot)
            .build()
            .unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].metadata().get("#id"), Some(&"alpha".to_string()));
        assert_eq!(batches[1].metadata().get("#id"), Some(&"beta".to_string()));
    }

    #[test]
    fn test_merge_mode_resolves_conflicts() {
        let left = slot_with(&[&[("#id", "s"), ("note", "one")]]);
        let right = slot_with(&[&[("#id", "s"), ("note", "two")]]);
        let settings = BatchSettings {
            merge_mode: MergeMode::OverwriteExisting,
            ..BatchSettings::default()
        };
        let batches = BatchBuilder::new(test_node_id())
            .with_settings(settings)
            .with_slot("left", &left)
            .with_slot("right", &right)
            .build()
            .unwrap();
        assert_eq!(batches[0].metadata().get("note"), Some(&"two".to_string()));
    }

    #[test]
    fn test_convert_to_single_batches() {
        let left = slot_with(&[&[("#id", "a")], &[("#id", "b")]]);
        let right = slot_with(&[&[("#id", "a")], &[("#id", "b")]]);
        let batches = BatchBuilder::new(test_node_id())
            .with_slot("left", &left)
            .with_slot("right", &right)
            .build()
            .unwrap();
        let singles = convert_to_single_batches(&batches).unwrap();
        assert_eq!(singles.len(), 2);
        assert_eq!(singles[0].row("left"), Some(0));
        assert_eq!(singles[0].row("right"), Some(0));
    }

    #[test]
    fn test_convert_rejects_multi_row_slot() {
        let left = slot_with(&[&[("#id", "a")], &[("#id", "a")]]);
        let right = slot_with(&[&[("#id", "a")]]);
        let batches = BatchBuilder::new(test_node_id())
            .with_slot("left", &left)
            .with_slot("right", &right)
            .build()
            .unwrap();
        let err = convert_to_single_batches(&batches).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::NonSingularBatch { rows: 2, .. }
        ));
    }
}
