//! Data-batch matching.
//!
//! Partitions multi-input data streams into matched execution units based on
//! the key-value metadata tags attached to each row:
//! - [`BatchKey`]: hash/equality key grouping rows across slots
//! - [`ColumnMatching`] / [`KeyFilter`] / [`MergeMode`]: matching policies
//! - [`BatchBuilder`]: the matching engine producing [`MergingBatch`]es,
//!   reducible to strict [`Batch`]es

mod builder;
mod key;
mod strategy;

pub use builder::{Batch, BatchBuilder, BatchSettings, MergingBatch, convert_to_single_batches};
pub use key::BatchKey;
pub use strategy::{
    ColumnMatching, HASH_PREFIX, KeyFilter, MergeMode, ReferenceKeys, reference_keys,
};
