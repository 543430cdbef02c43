//! The per-node execution loop.
//!
//! Walks the topological order, skips deactivated and pass-through nodes,
//! builds the batch set of each remaining node and invokes its workload once
//! per batch, optionally in parallel across batches of that node. Nodes are
//! never executed in parallel with each other.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use strum::Display;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::batch::{BatchBuilder, BatchSettings, MergingBatch};
use crate::error::{PipelineError, PipelineResult};
use crate::graph::{DataRow, DataStore, NodeId, PipelineGraph, RowMetadata, SlotId, SlotRole};

use super::config::RunConfig;

const TRACING_TARGET: &str = "trellis_pipeline::run";

/// Execution state of one node during a run.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[strum(serialize_all = "lowercase")]
pub enum NodeState {
    /// Not reached yet.
    Pending,
    /// Batches are being dispatched.
    Running,
    /// All batches finished successfully.
    Completed,
    /// Deactivated or forwarded via pass-through.
    Skipped,
    /// At least one batch failed, or an upstream dependency failed.
    Failed,
}

/// One captured node failure.
#[derive(Debug, Clone)]
pub struct NodeFailure {
    /// The failed node.
    pub node_id: NodeId,
    /// Failure message.
    pub message: String,
}

/// Final per-node states and captured failures of a run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    states: IndexMap<NodeId, NodeState>,
    failures: Vec<NodeFailure>,
}

impl RunReport {
    fn new(order: &[NodeId]) -> Self {
        Self {
            states: order.iter().map(|&id| (id, NodeState::Pending)).collect(),
            failures: Vec::new(),
        }
    }

    /// State of one node.
    pub fn state(&self, node_id: NodeId) -> Option<NodeState> {
        self.states.get(&node_id).copied()
    }

    /// All node states, in traversal order.
    pub fn states(&self) -> impl Iterator<Item = (NodeId, NodeState)> + '_ {
        self.states.iter().map(|(&id, &state)| (id, state))
    }

    /// All captured failures.
    pub fn failures(&self) -> &[NodeFailure] {
        &self.failures
    }

    /// Whether no node failed.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
            && !self
                .states
                .values()
                .any(|state| *state == NodeState::Failed)
    }

    fn set(&mut self, node_id: NodeId, state: NodeState) {
        self.states.insert(node_id, state);
    }

    fn fail(&mut self, node_id: NodeId, message: impl Into<String>) {
        self.states.insert(node_id, NodeState::Failed);
        self.failures.push(NodeFailure {
            node_id,
            message: message.into(),
        });
    }
}

/// One produced output row, addressed by output slot name.
#[derive(Debug, Clone)]
pub struct OutputRow {
    /// Target output slot.
    pub slot: String,
    /// Opaque payload.
    pub payload: serde_json::Value,
    /// Metadata tags attached to the row.
    pub metadata: RowMetadata,
}

/// Everything a workload needs to process one batch.
///
/// Input rows are materialized copies; workloads never touch the shared
/// store directly.
#[derive(Debug, Clone)]
pub struct BatchContext {
    /// Node being executed.
    pub node_id: NodeId,
    /// Index of the batch in deterministic iteration order.
    pub batch_index: usize,
    /// Aggregated batch metadata.
    pub metadata: RowMetadata,
    inputs: IndexMap<String, Vec<DataRow>>,
    cancel: CancellationToken,
}

impl BatchContext {
    /// Rows of one input slot within this batch.
    pub fn input_rows(&self, slot: &str) -> &[DataRow] {
        self.inputs.get(slot).map_or(&[], Vec::as_slice)
    }

    /// All input slots with their rows, in slot order.
    pub fn inputs(&self) -> impl Iterator<Item = (&str, &[DataRow])> {
        self.inputs
            .iter()
            .map(|(name, rows)| (name.as_str(), rows.as_slice()))
    }

    /// Cooperative cancellation flag; long-running workloads should poll
    /// this between units of work.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A node workload: processes one batch and returns the produced rows.
#[async_trait]
pub trait Workload: Send + Sync {
    /// Batch generation settings for nodes running this workload.
    fn batch_settings(&self) -> BatchSettings {
        BatchSettings::default()
    }

    /// Processes one batch.
    async fn process(&self, ctx: BatchContext) -> PipelineResult<Vec<OutputRow>>;
}

/// Maps node kinds to their workloads.
#[derive(Default, Clone)]
pub struct WorkloadRegistry {
    workloads: HashMap<String, Arc<dyn Workload>>,
}

impl WorkloadRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a workload for a node kind.
    pub fn register(&mut self, kind: impl Into<String>, workload: Arc<dyn Workload>) {
        self.workloads.insert(kind.into(), workload);
    }

    /// Resolves the workload for a node kind.
    pub fn resolve(&self, kind: &str) -> Option<Arc<dyn Workload>> {
        self.workloads.get(kind).cloned()
    }
}

impl std::fmt::Debug for WorkloadRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkloadRegistry")
            .field("kinds", &self.workloads.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Executes a pipeline graph against a data store.
#[derive(Debug)]
pub struct Scheduler {
    config: RunConfig,
    registry: WorkloadRegistry,
    semaphore: Arc<Semaphore>,
}

impl Scheduler {
    /// Creates a scheduler.
    pub fn new(config: RunConfig, registry: WorkloadRegistry) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.workers.max(1)));
        Self {
            config,
            registry,
            semaphore,
        }
    }

    /// Runs the graph to completion.
    ///
    /// Nodes execute strictly in topological order; batches of one node may
    /// run in parallel. Batch failures are captured per batch, fail the
    /// owning node and propagate as missing output to dependents; sibling
    /// batches are never aborted. Structural mutation of the graph during a
    /// run is unsupported and must be prevented by the caller.
    pub async fn run(
        &self,
        graph: &mut PipelineGraph,
        store: &mut DataStore,
        cancel: &CancellationToken,
    ) -> PipelineResult<RunReport> {
        graph.repair_graph();
        let order = graph.traverse()?;
        let deactivated = graph.deactivated_nodes(true)?;
        let mut report = RunReport::new(&order);

        // Every declared slot gets a store entry upfront.
        let declared: Vec<SlotId> = order
            .iter()
            .filter_map(|&node_id| graph.node(node_id).ok().map(|node| (node_id, node)))
            .flat_map(|(node_id, node)| {
                node.inputs()
                    .map(move |info| SlotId::input(node_id, info.name.clone()))
                    .chain(
                        node.outputs()
                            .map(move |info| SlotId::output(node_id, info.name.clone())),
                    )
                    .collect::<Vec<_>>()
            })
            .collect();
        for slot in declared {
            store.ensure_slot(slot);
        }

        tracing::info!(
            target: TRACING_TARGET,
            nodes = order.len(),
            workers = self.config.workers,
            "starting pipeline run",
        );

        for node_id in order {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let node = graph.node(node_id)?.clone();

            if !node.is_enabled() || deactivated.contains(&node_id) {
                tracing::debug!(target: TRACING_TARGET, node_id = %node_id, "skipping node");
                report.set(node_id, NodeState::Skipped);
                continue;
            }

            if self.upstream_failed(graph, &node, node_id, &report)? {
                report.fail(node_id, "required input sourced from a failed node");
                continue;
            }

            self.pull_inputs(graph, &node, node_id, store)?;

            if node.is_pass_through() && node.pass_through_applicable() {
                self.forward_pass_through(&node, node_id, store);
                tracing::debug!(target: TRACING_TARGET, node_id = %node_id, "pass-through node");
                report.set(node_id, NodeState::Skipped);
                continue;
            }

            let Some(workload) = self.registry.resolve(node.kind()) else {
                let err = PipelineError::MissingWorkload {
                    node_id,
                    kind: node.kind().to_string(),
                };
                report.fail(node_id, err.explain());
                continue;
            };

            let contexts = {
                let mut builder =
                    BatchBuilder::new(node_id).with_settings(workload.batch_settings());
                for info in node.inputs() {
                    if info.role != SlotRole::Data {
                        continue;
                    }
                    let slot_id = SlotId::input(node_id, info.name.clone());
                    if let Some(slot) = store.slot(&slot_id) {
                        builder = if info.optional {
                            builder.with_optional_slot(info.name.clone(), slot)
                        } else {
                            builder.with_slot(info.name.clone(), slot)
                        };
                    }
                }
                match builder.build() {
                    Ok(batches) => self.materialize_contexts(node_id, &batches, store, cancel),
                    Err(err) => {
                        report.fail(node_id, err.explain());
                        continue;
                    }
                }
            };

            report.set(node_id, NodeState::Running);
            tracing::debug!(
                target: TRACING_TARGET,
                node_id = %node_id,
                batches = contexts.len(),
                "executing node",
            );

            let failures = self
                .execute_batches(node_id, &workload, contexts, store, cancel)
                .await?;
            if failures.is_empty() {
                report.set(node_id, NodeState::Completed);
            } else {
                for message in failures {
                    report.fail(node_id, message);
                }
            }
        }

        tracing::info!(
            target: TRACING_TARGET,
            success = report.is_success(),
            failures = report.failures().len(),
            "pipeline run finished",
        );
        Ok(report)
    }

    fn upstream_failed(
        &self,
        graph: &PipelineGraph,
        node: &crate::graph::Node,
        node_id: NodeId,
        report: &RunReport,
    ) -> PipelineResult<bool> {
        for info in node.inputs() {
            if info.optional {
                continue;
            }
            let slot = SlotId::input(node_id, info.name.clone());
            if let Some(source) = graph.source_slot(&slot)?
                && report.state(source.node_id) == Some(NodeState::Failed)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Copies rows from each connected source output slot into this node's
    /// input slots.
    fn pull_inputs(
        &self,
        graph: &PipelineGraph,
        node: &crate::graph::Node,
        node_id: NodeId,
        store: &mut DataStore,
    ) -> PipelineResult<()> {
        for info in node.inputs() {
            let input_id = SlotId::input(node_id, info.name.clone());
            let Some(source) = graph.source_slot(&input_id)? else {
                continue;
            };
            let rows: Vec<DataRow> = store
                .slot(&source)
                .map(|slot| slot.rows().cloned().collect())
                .unwrap_or_default();
            for row in rows {
                store.append_row(input_id.clone(), row.payload, row.metadata);
            }
        }
        Ok(())
    }

    fn forward_pass_through(
        &self,
        node: &crate::graph::Node,
        node_id: NodeId,
        store: &mut DataStore,
    ) {
        let (Some(input), Some(output)) = (node.inputs().next(), node.outputs().next()) else {
            return;
        };
        let input_id = SlotId::input(node_id, input.name.clone());
        let output_id = SlotId::output(node_id, output.name.clone());
        let rows: Vec<DataRow> = store
            .slot(&input_id)
            .map(|slot| slot.rows().cloned().collect())
            .unwrap_or_default();
        for row in rows {
            store.append_row(output_id.clone(), row.payload, row.metadata);
        }
    }

    fn materialize_contexts(
        &self,
        node_id: NodeId,
        batches: &[MergingBatch],
        store: &DataStore,
        cancel: &CancellationToken,
    ) -> Vec<BatchContext> {
        batches
            .iter()
            .enumerate()
            .map(|(batch_index, batch)| {
                let inputs = batch
                    .slot_rows()
                    .map(|(name, indices)| {
                        let slot_id = SlotId::input(node_id, name);
                        let rows = indices
                            .iter()
                            .filter_map(|&index| {
                                store
                                    .slot(&slot_id)
                                    .and_then(|slot| slot.row(index))
                                    .cloned()
                            })
                            .collect();
                        (name.to_string(), rows)
                    })
                    .collect();
                BatchContext {
                    node_id,
                    batch_index,
                    metadata: batch.metadata().clone(),
                    inputs,
                    cancel: cancel.clone(),
                }
            })
            .collect()
    }

    /// Dispatches the batches of one node, returning captured failure
    /// messages. Output rows append in dispatch order when single-threaded
    /// and in completion order under parallel execution.
    async fn execute_batches(
        &self,
        node_id: NodeId,
        workload: &Arc<dyn Workload>,
        contexts: Vec<BatchContext>,
        store: &mut DataStore,
        cancel: &CancellationToken,
    ) -> PipelineResult<Vec<String>> {
        let mut failures = Vec::new();
        let parallel = self.config.parallel_enabled() && contexts.len() > 1;

        if !parallel {
            for ctx in contexts {
                if cancel.is_cancelled() {
                    return Err(PipelineError::Cancelled);
                }
                match workload.process(ctx).await {
                    Ok(rows) => self.append_outputs(node_id, rows, store),
                    Err(err) => failures.push(err.explain()),
                }
            }
            return Ok(failures);
        }

        let mut join_set: JoinSet<PipelineResult<Vec<OutputRow>>> = JoinSet::new();
        let mut cancelled = false;
        for ctx in contexts {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| PipelineError::Cancelled)?;
            let workload = Arc::clone(workload);
            join_set.spawn(async move {
                let _permit = permit;
                workload.process(ctx).await
            });
        }
        // Join barrier: already-dispatched batches run to completion even
        // when a sibling fails or the run is cancelled.
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(rows)) => self.append_outputs(node_id, rows, store),
                Ok(Err(err)) => failures.push(err.explain()),
                Err(join_err) => failures.push(format!("batch task failed: {join_err}")),
            }
        }
        if cancelled {
            return Err(PipelineError::Cancelled);
        }
        Ok(failures)
    }

    fn append_outputs(&self, node_id: NodeId, rows: Vec<OutputRow>, store: &mut DataStore) {
        for row in rows {
            store.append_row(
                SlotId::output(node_id, row.slot),
                row.payload,
                row.metadata,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use crate::graph::{Node, SlotInfo};

    use super::*;

    fn test_node_id(n: u128) -> NodeId {
        NodeId::from_uuid(Uuid::from_u128(n))
    }

    /// Emits `count` rows tagged with a `#row` index.
    struct EmitRows {
        count: usize,
    }

    #[async_trait]
    impl Workload for EmitRows {
        async fn process(&self, _ctx: BatchContext) -> PipelineResult<Vec<OutputRow>> {
            Ok((0..self.count)
                .map(|i| {
                    let mut metadata = RowMetadata::new();
                    metadata.insert("#row".to_string(), i.to_string());
                    OutputRow {
                        slot: "out".to_string(),
                        payload: json!(i),
                        metadata,
                    }
                })
                .collect())
        }

        fn batch_settings(&self) -> BatchSettings {
            BatchSettings {
                column_matching: crate::batch::ColumnMatching::MergeAll,
                ..BatchSettings::default()
            }
        }
    }

    /// Copies each input row of slot `in` to slot `out`.
    struct CopyRows;

    #[async_trait]
    impl Workload for CopyRows {
        async fn process(&self, ctx: BatchContext) -> PipelineResult<Vec<OutputRow>> {
            Ok(ctx
                .input_rows("in")
                .iter()
                .map(|row| OutputRow {
                    slot: "out".to_string(),
                    payload: row.payload.clone(),
                    metadata: row.metadata.clone(),
                })
                .collect())
        }
    }

    /// Fails every batch.
    struct AlwaysFail;

    #[async_trait]
    impl Workload for AlwaysFail {
        fn batch_settings(&self) -> BatchSettings {
            // One batch even without inputs.
            BatchSettings {
                column_matching: crate::batch::ColumnMatching::MergeAll,
                ..BatchSettings::default()
            }
        }

        async fn process(&self, ctx: BatchContext) -> PipelineResult<Vec<OutputRow>> {
            Err(PipelineError::NodeFailed {
                node_id: ctx.node_id,
                message: "boom".to_string(),
            })
        }
    }

    fn emitter_node() -> Node {
        Node::new("emit", "Emit").with_output(SlotInfo::new("out", "*"))
    }

    fn copier_node() -> Node {
        Node::new("copy", "Copy")
            .with_input(SlotInfo::new("in", "*"))
            .with_output(SlotInfo::new("out", "*"))
    }

    fn registry() -> WorkloadRegistry {
        let mut registry = WorkloadRegistry::new();
        registry.register("emit", Arc::new(EmitRows { count: 3 }));
        registry.register("copy", Arc::new(CopyRows));
        registry.register("fail", Arc::new(AlwaysFail));
        registry
    }

    fn chain() -> (PipelineGraph, NodeId, NodeId) {
        let mut graph = PipelineGraph::new();
        let a = graph.insert_node_with_id(test_node_id(1), emitter_node()).unwrap();
        let b = graph.insert_node_with_id(test_node_id(2), copier_node()).unwrap();
        graph
            .connect(&SlotId::output(a, "out"), &SlotId::input(b, "in"), true)
            .unwrap();
        (graph, a, b)
    }

    #[tokio::test]
    async fn test_chain_runs_to_completion() {
        let (mut graph, a, b) = chain();
        let mut store = DataStore::new();
        let scheduler = Scheduler::new(RunConfig::new(), registry());

        let report = scheduler
            .run(&mut graph, &mut store, &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(report.state(a), Some(NodeState::Completed));
        assert_eq!(report.state(b), Some(NodeState::Completed));
        assert_eq!(store.row_count(&SlotId::output(b, "out")), 3);
    }

    #[tokio::test]
    async fn test_disabled_node_is_skipped() {
        let (mut graph, a, b) = chain();
        graph.node_mut(a).unwrap().set_enabled(false);
        let mut store = DataStore::new();
        let scheduler = Scheduler::new(RunConfig::new(), registry());

        let report = scheduler
            .run(&mut graph, &mut store, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.state(a), Some(NodeState::Skipped));
        // b depends on a non-optional input from a deactivated node.
        assert_eq!(report.state(b), Some(NodeState::Skipped));
    }

    #[tokio::test]
    async fn test_pass_through_forwards_rows() {
        let (mut graph, _, b) = chain();
        let c = graph
            .insert_node_with_id(test_node_id(3), copier_node())
            .unwrap();
        graph
            .connect(&SlotId::output(b, "out"), &SlotId::input(c, "in"), true)
            .unwrap();
        graph.node_mut(b).unwrap().set_pass_through(true);
        let mut store = DataStore::new();
        let scheduler = Scheduler::new(RunConfig::new(), registry());

        let report = scheduler
            .run(&mut graph, &mut store, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.state(b), Some(NodeState::Skipped));
        assert_eq!(report.state(c), Some(NodeState::Completed));
        assert_eq!(store.row_count(&SlotId::output(c, "out")), 3);
    }

    #[tokio::test]
    async fn test_unconnected_optional_input_still_runs() {
        let (mut graph, _, b) = chain();
        graph
            .node_mut(b)
            .unwrap()
            .declare_input(SlotInfo::new("mask", "*").optional());
        let mut store = DataStore::new();
        let scheduler = Scheduler::new(RunConfig::new(), registry());

        let report = scheduler
            .run(&mut graph, &mut store, &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(report.state(b), Some(NodeState::Completed));
        assert_eq!(store.row_count(&SlotId::output(b, "out")), 3);
    }

    #[tokio::test]
    async fn test_failure_propagates_to_dependents() {
        let mut graph = PipelineGraph::new();
        let a = graph
            .insert_node_with_id(
                test_node_id(1),
                Node::new("fail", "Fail").with_output(SlotInfo::new("out", "*")),
            )
            .unwrap();
        let b = graph.insert_node_with_id(test_node_id(2), copier_node()).unwrap();
        graph
            .connect(&SlotId::output(a, "out"), &SlotId::input(b, "in"), true)
            .unwrap();
        let mut store = DataStore::new();
        let scheduler = Scheduler::new(RunConfig::new(), registry());

        let report = scheduler
            .run(&mut graph, &mut store, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.state(a), Some(NodeState::Failed));
        assert_eq!(report.state(b), Some(NodeState::Failed));
        assert!(!report.is_success());
        assert_eq!(report.failures().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_workload_fails_node() {
        let mut graph = PipelineGraph::new();
        let a = graph
            .insert_node_with_id(
                test_node_id(1),
                Node::new("unregistered", "Mystery").with_output(SlotInfo::new("out", "*")),
            )
            .unwrap();
        let mut store = DataStore::new();
        let scheduler = Scheduler::new(RunConfig::new(), registry());

        let report = scheduler
            .run(&mut graph, &mut store, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.state(a), Some(NodeState::Failed));
    }

    #[tokio::test]
    async fn test_cancellation_before_dispatch() {
        let (mut graph, ..) = chain();
        let mut store = DataStore::new();
        let scheduler = Scheduler::new(RunConfig::new(), registry());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = scheduler.run(&mut graph, &mut store, &cancel).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }

    #[tokio::test]
    async fn test_parallel_batches_complete() {
        let mut graph = PipelineGraph::new();
        let a = graph.insert_node_with_id(test_node_id(1), emitter_node()).unwrap();
        let b = graph.insert_node_with_id(test_node_id(2), copier_node()).unwrap();
        graph
            .connect(&SlotId::output(a, "out"), &SlotId::input(b, "in"), true)
            .unwrap();

        let mut registry = registry();
        // Split every input row into its own batch so b gets three batches.
        struct SplitCopy;
        #[async_trait]
        impl Workload for SplitCopy {
            fn batch_settings(&self) -> BatchSettings {
                BatchSettings {
                    column_matching: crate::batch::ColumnMatching::SplitAll,
                    ..BatchSettings::default()
                }
            }

            async fn process(&self, ctx: BatchContext) -> PipelineResult<Vec<OutputRow>> {
                Ok(ctx
                    .input_rows("in")
                    .iter()
                    .map(|row| OutputRow {
                        slot: "out".to_string(),
                        payload: row.payload.clone(),
                        metadata: row.metadata.clone(),
                    })
                    .collect())
            }
        }
        registry.register("copy", Arc::new(SplitCopy));

        let mut store = DataStore::new();
        let scheduler = Scheduler::new(RunConfig::new().with_workers(4), registry);
        let report = scheduler
            .run(&mut graph, &mut store, &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(store.row_count(&SlotId::output(b, "out")), 3);
    }
}
