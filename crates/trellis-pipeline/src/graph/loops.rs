//! Loop-region extraction.
//!
//! Loops are single-entry regions delimited by nodes of category
//! [`NodeCategory::LoopStart`] and [`NodeCategory::LoopEnd`]. Extraction is a
//! dedicated analysis pass over the topological order; the resulting groups
//! are not part of the persisted structure.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::error::{PipelineError, PipelineResult};

use super::graph::PipelineGraph;
use super::id::NodeId;
use super::node::NodeCategory;

const TRACING_TARGET: &str = "trellis_pipeline::graph";

/// A single-entry loop region of the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopGroup {
    /// The designated entry node.
    pub start: NodeId,
    /// Member nodes designated as loop ends.
    pub ends: HashSet<NodeId>,
    /// All member nodes, including start and ends.
    pub members: HashSet<NodeId>,
}

/// Propagated sweep state: the current loop-start tag (`None` is the no-loop
/// sentinel) and the nesting depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SweepState {
    tag: Option<NodeId>,
    depth: u32,
}

impl SweepState {
    const NO_LOOP: Self = Self { tag: None, depth: 0 };
}

impl PipelineGraph {
    /// Extracts the outermost loop regions of the graph.
    ///
    /// `extra_ends` designates additional loop-end nodes beyond those carrying
    /// the loop-end category; `deactivated` nodes are ignored entirely.
    /// Nested loops are absorbed into the outermost group per start. Fails
    /// with [`PipelineError::AmbiguousLoopRoot`] when a merge point inherits
    /// conflicting loop-start tags.
    pub fn extract_loop_groups(
        &mut self,
        extra_ends: &HashSet<NodeId>,
        deactivated: &HashSet<NodeId>,
    ) -> PipelineResult<Vec<LoopGroup>> {
        let order: Vec<NodeId> = self
            .traverse()?
            .into_iter()
            .filter(|id| !deactivated.contains(id))
            .collect();

        let mut direct_preds: HashMap<NodeId, BTreeSet<NodeId>> = HashMap::new();
        for (source, target, _) in self.data_edges() {
            if deactivated.contains(&source.node_id) || deactivated.contains(&target.node_id) {
                continue;
            }
            direct_preds
                .entry(target.node_id)
                .or_default()
                .insert(source.node_id);
        }

        // Transitive predecessor sets, accumulated along the traversal order;
        // used to disambiguate merge points during branch correction.
        let mut preds: HashMap<NodeId, HashSet<NodeId>> = HashMap::new();
        for &node_id in &order {
            let mut acc = HashSet::new();
            if let Some(direct) = direct_preds.get(&node_id) {
                for &pred in direct {
                    acc.insert(pred);
                    if let Some(upstream) = preds.get(&pred) {
                        acc.extend(upstream.iter().copied());
                    }
                }
            }
            preds.insert(node_id, acc);
        }

        let is_start =
            |graph: &Self, id: NodeId| matches!(graph.node(id).map(|n| n.category()), Ok(NodeCategory::LoopStart));
        let is_end = |graph: &Self, id: NodeId| {
            extra_ends.contains(&id)
                || matches!(graph.node(id).map(|n| n.category()), Ok(NodeCategory::LoopEnd))
        };

        // membership: the state the node itself belongs to;
        // post: the state its successors inherit.
        let mut membership: HashMap<NodeId, SweepState> = HashMap::new();
        let mut post: HashMap<NodeId, SweepState> = HashMap::new();

        for &node_id in &order {
            let mut candidates: BTreeSet<NodeId> = BTreeSet::new();
            let mut saw_no_loop = false;
            let mut depth = 0u32;
            if let Some(direct) = direct_preds.get(&node_id) {
                for pred in direct {
                    let state = post.get(pred).copied().unwrap_or(SweepState::NO_LOOP);
                    match state.tag {
                        None => saw_no_loop = true,
                        Some(tag) => {
                            candidates.insert(tag);
                            depth = depth.max(state.depth);
                        }
                    }
                }
            }

            if candidates.len() > 1 {
                return Err(PipelineError::AmbiguousLoopRoot {
                    node_id,
                    candidates: candidates.into_iter().collect(),
                });
            }
            let inherited_tag = candidates.into_iter().next();

            // Branch-merge correction: a branch that never entered the loop
            // re-joins one that did. Retag everything reachable only through
            // the no-loop branch to the real start.
            if let (Some(start), true) = (inherited_tag, saw_no_loop) {
                let upstream_of_start = preds.get(&start).cloned().unwrap_or_default();
                let correction = SweepState {
                    tag: Some(start),
                    depth: depth.max(1),
                };
                if let Some(reachable) = preds.get(&node_id) {
                    for &pred in reachable {
                        if pred == start || upstream_of_start.contains(&pred) {
                            continue;
                        }
                        let tagged = membership
                            .get(&pred)
                            .copied()
                            .unwrap_or(SweepState::NO_LOOP);
                        if tagged.tag.is_none() {
                            tracing::debug!(
                                target: TRACING_TARGET,
                                node_id = %pred,
                                start = %start,
                                "retagging no-loop branch node into loop region",
                            );
                            membership.insert(pred, correction);
                            post.insert(pred, correction);
                        }
                    }
                }
            }

            let inherited = SweepState {
                tag: inherited_tag,
                depth,
            };
            let (own, successors) = if is_start(self, node_id) {
                match inherited.tag {
                    // Entering a fresh outermost loop.
                    None => {
                        let state = SweepState {
                            tag: Some(node_id),
                            depth: 1,
                        };
                        (state, state)
                    }
                    // Nested start, absorbed into the outer region.
                    Some(_) => {
                        let state = SweepState {
                            tag: inherited.tag,
                            depth: inherited.depth + 1,
                        };
                        (state, state)
                    }
                }
            } else if is_end(self, node_id) && inherited.tag.is_some() {
                let remaining = inherited.depth.saturating_sub(1);
                let successors = SweepState {
                    tag: if remaining == 0 { None } else { inherited.tag },
                    depth: remaining,
                };
                (inherited, successors)
            } else {
                (inherited, inherited)
            };
            membership.insert(node_id, own);
            post.insert(node_id, successors);
        }

        let mut groups: Vec<LoopGroup> = Vec::new();
        let mut group_index: HashMap<NodeId, usize> = HashMap::new();
        for &node_id in &order {
            let Some(state) = membership.get(&node_id) else {
                continue;
            };
            let Some(start) = state.tag else {
                continue;
            };
            let index = *group_index.entry(start).or_insert_with(|| {
                groups.push(LoopGroup {
                    start,
                    ends: HashSet::new(),
                    members: HashSet::new(),
                });
                groups.len() - 1
            });
            groups[index].members.insert(node_id);
            if is_end(self, node_id) {
                groups[index].ends.insert(node_id);
            }
        }
        Ok(groups)
    }
}
