//! Batch keys: the hash/equality keys that group rows across slots.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::graph::RowMetadata;

/// Immutable mapping from reference key to the value observed in one row.
///
/// Absence is an explicit marker distinct from any string value, so two rows
/// both missing the same reference key still match each other. Used only
/// during batch construction, never retained afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchKey {
    entries: BTreeMap<String, Option<String>>,
}

impl BatchKey {
    /// Builds the key of a row over the given reference key set.
    pub fn from_metadata(reference: &BTreeSet<String>, metadata: &RowMetadata) -> Self {
        let entries = reference
            .iter()
            .map(|key| (key.clone(), metadata.get(key).cloned()))
            .collect();
        Self { entries }
    }

    /// Builds a synthetic key unique to one row, used by split-all matching.
    pub fn synthetic(slot: &str, row: usize) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert("uid".to_string(), Some(format!("{slot}:{row}")));
        Self { entries }
    }

    /// Key/value entries, sorted by key.
    pub fn entries(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_deref()))
    }

    /// Whether the key carries no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in &self.entries {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            match value {
                Some(value) => write!(f, "{key}={value}")?,
                None => write!(f, "{key}=<absent>")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> RowMetadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn reference(keys: &[&str]) -> BTreeSet<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn test_matching_values_are_equal() {
        let reference = reference(&["a"]);
        let left = BatchKey::from_metadata(&reference, &tags(&[("a", "x")]));
        let right = BatchKey::from_metadata(&reference, &tags(&[("a", "x"), ("b", "y")]));
        assert_eq!(left, right);
    }

    #[test]
    fn test_absent_matches_absent_but_not_present() {
        let reference = reference(&["a", "b"]);
        let both_missing_b = (
            BatchKey::from_metadata(&reference, &tags(&[("a", "x")])),
            BatchKey::from_metadata(&reference, &tags(&[("a", "x")])),
        );
        assert_eq!(both_missing_b.0, both_missing_b.1);

        let with_b = BatchKey::from_metadata(&reference, &tags(&[("a", "x"), ("b", "")]));
        assert_ne!(both_missing_b.0, with_b);
    }

    #[test]
    fn test_synthetic_keys_are_unique_per_row() {
        assert_ne!(BatchKey::synthetic("in", 0), BatchKey::synthetic("in", 1));
        assert_ne!(BatchKey::synthetic("in", 0), BatchKey::synthetic("other", 0));
    }
}
