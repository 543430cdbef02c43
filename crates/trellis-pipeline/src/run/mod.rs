//! Pipeline execution.
//!
//! - [`RunConfig`]: worker count and parallelization
//! - [`Scheduler`]: the per-node execution loop
//! - [`Workload`] / [`WorkloadRegistry`]: node implementations by kind
//! - [`RunReport`]: final per-node states and captured failures

mod config;
mod scheduler;

pub use config::RunConfig;
pub use scheduler::{
    BatchContext, NodeFailure, NodeState, OutputRow, RunReport, Scheduler, Workload,
    WorkloadRegistry,
};
