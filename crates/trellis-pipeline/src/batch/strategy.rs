//! Column matching strategies and annotation merge policies.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use strum::Display;

/// Sentinel prefix marking metadata keys that participate in prefix-hash
/// matching.
pub const HASH_PREFIX: char = '#';

/// Policy for computing the reference key set used in batch matching.
#[derive(Debug, Display, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ColumnMatching {
    /// Union of all keys seen across all slots.
    Union,
    /// Intersection of keys seen across all slots.
    Intersection,
    /// Union restricted to keys starting with [`HASH_PREFIX`].
    #[default]
    PrefixHashUnion,
    /// Intersection restricted to keys starting with [`HASH_PREFIX`].
    PrefixHashIntersection,
    /// Empty key set: all rows fall into a single batch.
    MergeAll,
    /// Every row becomes its own singleton batch.
    SplitAll,
    /// Caller-supplied include/exclude filter over the observed keys.
    Custom,
}

/// Include/exclude filter used by [`ColumnMatching::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "mode", content = "keys")]
pub enum KeyFilter {
    /// Keep only the listed keys.
    Include(BTreeSet<String>),
    /// Keep everything except the listed keys.
    Exclude(BTreeSet<String>),
}

impl KeyFilter {
    /// Whether a key passes the filter.
    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Include(keys) => keys.contains(key),
            Self::Exclude(keys) => !keys.contains(key),
        }
    }
}

/// Resolved reference key set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceKeys {
    /// Match rows on these metadata keys.
    Keys(BTreeSet<String>),
    /// Single batch holding every row.
    MergeAll,
    /// One singleton batch per row.
    SplitAll,
}

/// Computes the reference key set from the keys observed per slot.
///
/// `observed` holds one key set per contributing slot, in slot order.
pub fn reference_keys(
    strategy: ColumnMatching,
    filter: Option<&KeyFilter>,
    observed: &[BTreeSet<String>],
) -> ReferenceKeys {
    match strategy {
        ColumnMatching::MergeAll => ReferenceKeys::MergeAll,
        ColumnMatching::SplitAll => ReferenceKeys::SplitAll,
        ColumnMatching::Union => ReferenceKeys::Keys(union(observed)),
        ColumnMatching::Intersection => ReferenceKeys::Keys(intersection(observed)),
        ColumnMatching::PrefixHashUnion => ReferenceKeys::Keys(
            union(observed)
                .into_iter()
                .filter(|key| key.starts_with(HASH_PREFIX))
                .collect(),
        ),
        ColumnMatching::PrefixHashIntersection => ReferenceKeys::Keys(
            intersection(observed)
                .into_iter()
                .filter(|key| key.starts_with(HASH_PREFIX))
                .collect(),
        ),
        ColumnMatching::Custom => {
            let all = union(observed);
            let keys = match filter {
                Some(filter) => all.into_iter().filter(|key| filter.matches(key)).collect(),
                None => all,
            };
            ReferenceKeys::Keys(keys)
        }
    }
}

fn union(observed: &[BTreeSet<String>]) -> BTreeSet<String> {
    observed.iter().flatten().cloned().collect()
}

fn intersection(observed: &[BTreeSet<String>]) -> BTreeSet<String> {
    let mut sets = observed.iter();
    let Some(first) = sets.next() else {
        return BTreeSet::new();
    };
    sets.fold(first.clone(), |acc, set| {
        acc.intersection(set).cloned().collect()
    })
}

/// Policy for resolving conflicting values of a non-key metadata field.
///
/// Applied as a binary reducer `(existing, incoming) -> resolved`, once per
/// duplicate key, in slot/row encounter order.
#[derive(Debug, Display, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum MergeMode {
    /// Keep both values, joined in encounter order.
    #[default]
    Merge,
    /// The incoming value wins.
    OverwriteExisting,
    /// The existing value wins.
    KeepExisting,
    /// Drop the field entirely on conflict.
    Discard,
}

impl MergeMode {
    /// Resolves a conflict. `None` removes the field.
    pub fn resolve(&self, existing: &str, incoming: &str) -> Option<String> {
        match self {
            Self::Merge => {
                if existing == incoming {
                    Some(existing.to_string())
                } else {
                    Some(format!("{existing}, {incoming}"))
                }
            }
            Self::OverwriteExisting => Some(incoming.to_string()),
            Self::KeepExisting => Some(existing.to_string()),
            Self::Discard => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_union_and_intersection() {
        let observed = vec![keys(&["a", "b"]), keys(&["b", "c"])];
        assert_eq!(
            reference_keys(ColumnMatching::Union, None, &observed),
            ReferenceKeys::Keys(keys(&["a", "b", "c"]))
        );
        assert_eq!(
            reference_keys(ColumnMatching::Intersection, None, &observed),
            ReferenceKeys::Keys(keys(&["b"]))
        );
    }

    #[test]
    fn test_prefix_filtering() {
        let observed = vec![keys(&["#sample", "path"]), keys(&["#sample", "#day"])];
        assert_eq!(
            reference_keys(ColumnMatching::PrefixHashUnion, None, &observed),
            ReferenceKeys::Keys(keys(&["#sample", "#day"]))
        );
        assert_eq!(
            reference_keys(ColumnMatching::PrefixHashIntersection, None, &observed),
            ReferenceKeys::Keys(keys(&["#sample"]))
        );
    }

    #[test]
    fn test_custom_filter() {
        let observed = vec![keys(&["a", "b", "c"])];
        let include = KeyFilter::Include(keys(&["a", "c"]));
        assert_eq!(
            reference_keys(ColumnMatching::Custom, Some(&include), &observed),
            ReferenceKeys::Keys(keys(&["a", "c"]))
        );
        let exclude = KeyFilter::Exclude(keys(&["a"]));
        assert_eq!(
            reference_keys(ColumnMatching::Custom, Some(&exclude), &observed),
            ReferenceKeys::Keys(keys(&["b", "c"]))
        );
    }

    #[test]
    fn test_merge_modes() {
        assert_eq!(MergeMode::Merge.resolve("x", "x"), Some("x".to_string()));
        assert_eq!(MergeMode::Merge.resolve("x", "y"), Some("x, y".to_string()));
        assert_eq!(
            MergeMode::OverwriteExisting.resolve("x", "y"),
            Some("y".to_string())
        );
        assert_eq!(
            MergeMode::KeepExisting.resolve("x", "y"),
            Some("x".to_string())
        );
        assert_eq!(MergeMode::Discard.resolve("x", "y"), None);
    }
}
