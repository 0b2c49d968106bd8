// src/dag/diff.rs

//! Result reuse between an old (previously run) graph and a new one.
//!
//! A new node may reuse an old node's result when both have the same task
//! identity and the same incoming bindings, with every parent itself reused
//! from the matching old parent. Nodes are visited in topological order of
//! the new graph, so ineligibility propagates to every descendant.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, warn};

use crate::dag::graph::{ArgBinding, TransportGraph};
use crate::dag::node::{Callable, NodeAttribute};
use crate::dag::NodeId;
use crate::errors::{DispatchError, Result};
use crate::types::Status;

/// Diff state for one redispatch: the finished old graph and the new graph
/// being prepared.
#[derive(Debug, Clone)]
pub struct GraphDiff {
    old: TransportGraph,
    new: TransportGraph,
    /// New-graph nodes whose callable was replaced; never reusable.
    invalidated: BTreeSet<NodeId>,
}

impl GraphDiff {
    pub fn new(old: TransportGraph, new: TransportGraph) -> Self {
        Self {
            old,
            new,
            invalidated: BTreeSet::new(),
        }
    }

    pub fn into_graph(self) -> TransportGraph {
        self.new
    }

    /// Replace the callable of every new-graph node named in `updates`.
    ///
    /// Updated nodes and everything downstream of them are reset to `New`,
    /// so this is safe to call after [`copy_nodes_from`](Self::copy_nodes_from)
    /// as well as before it. Returns the ids whose callable changed.
    pub fn apply_electron_updates(&mut self, updates: &HashMap<String, Callable>) -> Vec<NodeId> {
        let mut touched = Vec::new();
        for (name, callable) in updates {
            let ids: Vec<NodeId> = self
                .new
                .nodes
                .iter()
                .filter(|n| &n.name == name)
                .map(|n| n.node_id)
                .collect();
            if ids.is_empty() {
                warn!(electron = %name, "electron update names no node in the graph; ignoring");
                continue;
            }
            for id in ids {
                if let Some(node) = self.new.node_mut(id) {
                    node.set_attribute(NodeAttribute::Function(Some(callable.clone())));
                }
                self.invalidated.insert(id);
                touched.push(id);
            }
        }

        let stale: BTreeSet<NodeId> = touched
            .iter()
            .flat_map(|id| self.new.descendants(*id))
            .collect();
        for id in stale {
            if let Some(node) = self.new.node_mut(id) {
                node.reset_runtime_state();
            }
        }

        touched.sort_unstable();
        touched
    }

    /// New-graph node ids that can take their result from the old graph.
    pub fn get_reusable_nodes(&self) -> Result<BTreeSet<NodeId>> {
        Ok(self.reuse_mapping()?.into_keys().collect())
    }

    /// Mapping from reusable new-graph node to the old node it reuses.
    pub fn reuse_mapping(&self) -> Result<BTreeMap<NodeId, NodeId>> {
        let old_order = self
            .old
            .topological_order()
            .map_err(|e| DispatchError::GraphDiff(format!("old graph: {e}")))?;
        let new_order = self
            .new
            .topological_order()
            .map_err(|e| DispatchError::GraphDiff(format!("new graph: {e}")))?;

        // Completed old nodes, indexed by fingerprint over their own parents.
        let mut candidates: HashMap<String, Vec<NodeId>> = HashMap::new();
        for id in old_order {
            let Some(node) = self.old.node(id) else {
                continue;
            };
            if node.status != Status::Completed {
                continue;
            }
            if let Some(fp) = fingerprint(&self.old, id, |p| Some(p)) {
                candidates.entry(fp).or_default().push(id);
            }
        }

        let mut mapping: BTreeMap<NodeId, NodeId> = BTreeMap::new();
        let mut taken: BTreeSet<NodeId> = BTreeSet::new();
        for id in new_order {
            if self.invalidated.contains(&id) {
                continue;
            }
            let Some(fp) = fingerprint(&self.new, id, |p| mapping.get(&p).copied()) else {
                continue;
            };
            let Some(olds) = candidates.get(&fp) else {
                continue;
            };
            let pick = olds
                .iter()
                .find(|o| **o == id && !taken.contains(*o))
                .or_else(|| olds.iter().find(|o| !taken.contains(*o)))
                .copied();
            if let Some(old_id) = pick {
                taken.insert(old_id);
                mapping.insert(id, old_id);
            }
        }

        debug!(
            reusable = mapping.len(),
            total = self.new.len(),
            "computed reusable nodes"
        );
        Ok(mapping)
    }

    /// Copy results of the matched old nodes into the new graph for `ids`.
    ///
    /// Copies status, output, timestamps, captured stdout/stderr and the
    /// sub-dispatch link. Ids that are not reusable are skipped.
    pub fn copy_nodes_from(&mut self, ids: &BTreeSet<NodeId>) -> Result<usize> {
        let mapping = self.reuse_mapping()?;
        let mut copied = 0;
        for id in ids {
            let Some(old_id) = mapping.get(id) else {
                continue;
            };
            let Some(old) = self.old.node(*old_id).cloned() else {
                continue;
            };
            let Some(node) = self.new.node_mut(*id) else {
                continue;
            };
            node.set_attribute(NodeAttribute::Status(old.status));
            node.set_attribute(NodeAttribute::Output(old.output));
            node.set_attribute(NodeAttribute::StartTime(old.start_time));
            node.set_attribute(NodeAttribute::EndTime(old.end_time));
            node.set_attribute(NodeAttribute::Stdout(old.stdout));
            node.set_attribute(NodeAttribute::Stderr(old.stderr));
            node.set_attribute(NodeAttribute::Error(None));
            node.set_attribute(NodeAttribute::SubDispatchId(old.sub_dispatch_id));
            copied += 1;
        }
        Ok(copied)
    }
}

/// Structural signature of a node: its identity plus each incoming binding
/// with its parent mapped through `parent_of`. `None` when a parent has no
/// mapping.
fn fingerprint(
    graph: &TransportGraph,
    id: NodeId,
    parent_of: impl Fn(NodeId) -> Option<NodeId>,
) -> Option<String> {
    let node = graph.node(id)?;
    let mut incoming: Vec<(ArgBinding, NodeId)> = Vec::new();
    for edge in graph.incoming_edges(id) {
        incoming.push((edge.binding, parent_of(edge.source)?));
    }
    incoming.sort();

    let mut hasher = blake3::Hasher::new();
    hasher.update(node.identity().as_bytes());
    for (binding, parent) in &incoming {
        let tag = match binding {
            ArgBinding::Positional(i) => format!("p{i}"),
            ArgBinding::Keyword(k) => format!("k{k}"),
            ArgBinding::WaitFor => "w".to_string(),
        };
        hasher.update(tag.as_bytes());
        hasher.update(&[0]);
        hasher.update(&parent.to_le_bytes());
    }
    Some(hasher.finalize().to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::node::{Node, NodeResult};
    use serde_json::json;

    /// x=1 -> inc -> double, with `inc` and `double` both completed.
    fn finished_chain() -> TransportGraph {
        let mut g = TransportGraph::new();
        let x = g.add_node(Node::parameter("x", json!(1)));
        let inc = g.add_node(Node::task("inc", Callable::named("inc")));
        let dbl = g.add_node(Node::task("double", Callable::named("double")));
        g.add_edge(x, inc, ArgBinding::Positional(0));
        g.add_edge(inc, dbl, ArgBinding::Positional(0));

        for (id, out) in [(x, json!(1)), (inc, json!(2)), (dbl, json!(4))] {
            let node = g.node_mut(id).unwrap();
            node.apply_result(&NodeResult::running(id)).unwrap();
            node.apply_result(&NodeResult::completed(id, out)).unwrap();
        }
        g
    }

    fn fresh(g: &TransportGraph) -> TransportGraph {
        let mut g = g.clone();
        g.reset_runtime_state();
        g
    }

    #[test]
    fn identical_graph_is_fully_reusable() {
        let old = finished_chain();
        let mut diff = GraphDiff::new(old.clone(), fresh(&old));

        let reusable = diff.get_reusable_nodes().unwrap();
        assert_eq!(reusable, BTreeSet::from([0, 1, 2]));

        assert_eq!(diff.copy_nodes_from(&reusable).unwrap(), 3);
        let g = diff.into_graph();
        assert!(g.nodes.iter().all(|n| n.status == Status::Completed));
        assert_eq!(g.node(2).unwrap().output, Some(json!(4)));
    }

    #[test]
    fn electron_update_excludes_node_and_descendants() {
        let old = finished_chain();
        let mut diff = GraphDiff::new(old.clone(), fresh(&old));
        let updates = HashMap::from([("inc".to_string(), Callable::named("inc_v2"))]);

        assert_eq!(diff.apply_electron_updates(&updates), vec![1]);
        assert_eq!(diff.get_reusable_nodes().unwrap(), BTreeSet::from([0]));
    }

    #[test]
    fn update_after_copy_resets_downstream() {
        let old = finished_chain();
        let mut diff = GraphDiff::new(old.clone(), fresh(&old));
        let all = diff.get_reusable_nodes().unwrap();
        diff.copy_nodes_from(&all).unwrap();

        diff.apply_electron_updates(&HashMap::from([(
            "inc".to_string(),
            Callable::named("inc_v2"),
        )]));
        let g = diff.into_graph();
        assert_eq!(g.node(0).unwrap().status, Status::Completed);
        assert_eq!(g.node(1).unwrap().status, Status::New);
        assert_eq!(g.node(2).unwrap().status, Status::New);
        assert_eq!(g.node(2).unwrap().output, None);
    }

    #[test]
    fn changed_parameter_invalidates_downstream() {
        let old = finished_chain();
        let mut new = fresh(&old);
        new.node_mut(0).unwrap().kind = crate::dag::NodeKind::Parameter { value: json!(2) };

        let diff = GraphDiff::new(old, new);
        assert!(diff.get_reusable_nodes().unwrap().is_empty());
    }

    #[test]
    fn unfinished_old_nodes_are_not_reused() {
        let mut old = finished_chain();
        old.node_mut(2).unwrap().status = Status::Failed;

        let diff = GraphDiff::new(old.clone(), fresh(&old));
        assert_eq!(diff.get_reusable_nodes().unwrap(), BTreeSet::from([0, 1]));
    }

    #[test]
    fn cyclic_graph_yields_graph_diff_error() {
        let old = finished_chain();
        let mut new = fresh(&old);
        new.add_edge(2, 0, ArgBinding::WaitFor);

        let diff = GraphDiff::new(old, new);
        assert!(matches!(
            diff.get_reusable_nodes(),
            Err(DispatchError::GraphDiff(_))
        ));
    }
}
