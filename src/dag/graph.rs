// src/dag/graph.rs

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dag::NodeId;
use crate::dag::node::Node;
use crate::errors::{DispatchError, Result};

/// How a producer's output is bound into a consumer's inputs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgBinding {
    Positional(usize),
    Keyword(String),
    /// Ordering-only edge: the consumer waits but gets no argument.
    WaitFor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
    pub binding: ArgBinding,
}

/// Serializable task graph: nodes indexed by id plus argument-binding edges.
///
/// Node ids are positions in `nodes`; [`TransportGraph::add_node`] keeps that
/// invariant. Multiple edges between the same pair are allowed (a task may
/// consume one producer twice under different bindings).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportGraph {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl TransportGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node, assigning it the next id.
    ///
    /// A node whose `task_group_id` was left at 0 joins its own group.
    pub fn add_node(&mut self, mut node: Node) -> NodeId {
        let id = self.nodes.len();
        node.node_id = id;
        if node.task_group_id == 0 {
            node.task_group_id = id;
        }
        self.nodes.push(node);
        id
    }

    pub fn add_edge(&mut self, source: NodeId, target: NodeId, binding: ArgBinding) {
        self.edges.push(Edge {
            source,
            target,
            binding,
        });
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    pub fn incoming_edges(&self, id: NodeId) -> Vec<Edge> {
        self.edges
            .iter()
            .filter(|e| e.target == id)
            .cloned()
            .collect()
    }

    /// Distinct direct successors, in id order.
    pub fn successors(&self, id: NodeId) -> Vec<NodeId> {
        let set: BTreeSet<NodeId> = self
            .edges
            .iter()
            .filter(|e| e.source == id)
            .map(|e| e.target)
            .collect();
        set.into_iter().collect()
    }

    /// Distinct direct predecessors, in id order.
    pub fn predecessors(&self, id: NodeId) -> Vec<NodeId> {
        let set: BTreeSet<NodeId> = self
            .edges
            .iter()
            .filter(|e| e.target == id)
            .map(|e| e.source)
            .collect();
        set.into_iter().collect()
    }

    /// `id` plus every node reachable from it.
    pub fn descendants(&self, id: NodeId) -> BTreeSet<NodeId> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([id]);
        while let Some(cur) = queue.pop_front() {
            if seen.insert(cur) {
                queue.extend(self.successors(cur));
            }
        }
        seen
    }

    /// Check structural invariants: ids match positions, edges reference
    /// existing nodes, no self loops, no cycles.
    pub fn validate(&self) -> Result<()> {
        for (idx, node) in self.nodes.iter().enumerate() {
            if node.node_id != idx {
                return Err(DispatchError::InvalidGraph(format!(
                    "node at position {idx} carries id {}",
                    node.node_id
                )));
            }
        }
        for e in &self.edges {
            if e.source >= self.nodes.len() || e.target >= self.nodes.len() {
                return Err(DispatchError::InvalidGraph(format!(
                    "edge {} -> {} references a missing node",
                    e.source, e.target
                )));
            }
            if e.source == e.target {
                return Err(DispatchError::InvalidGraph(format!(
                    "node {} cannot depend on itself",
                    e.source
                )));
            }
        }
        self.topological_order().map(|_| ())
    }

    /// Node ids in a dependency-respecting order.
    pub fn topological_order(&self) -> Result<Vec<NodeId>> {
        // Edge direction: producer -> consumer
        let mut graph: DiGraphMap<NodeId, ()> = DiGraphMap::new();
        for id in 0..self.nodes.len() {
            graph.add_node(id);
        }
        for e in &self.edges {
            if e.source >= self.nodes.len() || e.target >= self.nodes.len() {
                return Err(DispatchError::InvalidGraph(format!(
                    "edge {} -> {} references a missing node",
                    e.source, e.target
                )));
            }
            graph.add_edge(e.source, e.target, ());
        }

        toposort(&graph, None).map_err(|cycle| {
            DispatchError::InvalidGraph(format!(
                "task graph contains a cycle involving node {}",
                cycle.node_id()
            ))
        })
    }

    /// Return every node to `New`, dropping all run results.
    pub fn reset_runtime_state(&mut self) {
        for node in &mut self.nodes {
            node.reset_runtime_state();
        }
    }
}

/// Which node outputs make up a dispatch's final result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputTemplate {
    Node(NodeId),
    List(Vec<OutputTemplate>),
    Map(BTreeMap<String, OutputTemplate>),
    Literal(Value),
}

impl Default for OutputTemplate {
    fn default() -> Self {
        OutputTemplate::Literal(Value::Null)
    }
}

impl OutputTemplate {
    /// Every node id referenced by this template.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_ids(&mut out);
        out
    }

    fn collect_ids(&self, out: &mut Vec<NodeId>) {
        match self {
            OutputTemplate::Node(id) => out.push(*id),
            OutputTemplate::List(items) => items.iter().for_each(|t| t.collect_ids(out)),
            OutputTemplate::Map(items) => items.values().for_each(|t| t.collect_ids(out)),
            OutputTemplate::Literal(_) => {}
        }
    }
}

/// A workflow definition: a named task graph plus its output template.
///
/// Sublattice tasks return one of these (as JSON) as their output; it is
/// the manifest a child dispatch is imported from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lattice {
    pub name: String,
    pub graph: TransportGraph,
    #[serde(default)]
    pub output: OutputTemplate,
}

impl Lattice {
    pub fn new(name: impl Into<String>, graph: TransportGraph, output: OutputTemplate) -> Self {
        Self {
            name: name.into(),
            graph,
            output,
        }
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Graph invariants plus output references.
    pub fn validate(&self) -> Result<()> {
        self.graph.validate()?;
        for id in self.output.node_ids() {
            if id >= self.graph.len() {
                return Err(DispatchError::InvalidGraph(format!(
                    "output references missing node {id}"
                )));
            }
        }
        Ok(())
    }
}
