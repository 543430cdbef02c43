#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

pub mod batch;
mod error;
pub mod graph;
pub mod run;

#[doc(hidden)]
pub mod prelude;

pub use error::{PipelineError, PipelineResult};

/// Tracing target for pipeline operations.
pub const TRACING_TARGET: &str = "trellis_pipeline";
