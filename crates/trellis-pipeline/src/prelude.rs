//! Prelude module for convenient imports.
//!
//! This module re-exports commonly used types for ergonomic imports:
//!
//! ```rust
//! use trellis_pipeline::prelude::*;
//! ```

pub use crate::batch::{
    Batch, BatchBuilder, BatchSettings, ColumnMatching, MergeMode, MergingBatch,
};
pub use crate::error::{PipelineError, PipelineResult};
pub use crate::graph::{
    DataStore, GraphDefinition, GraphMetadata, Node, NodeCategory, NodeId, PipelineGraph, SlotId,
    SlotInfo,
};
pub use crate::run::{RunConfig, RunReport, Scheduler, Workload, WorkloadRegistry};
