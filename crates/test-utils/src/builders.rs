#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};

use latticed::dag::{
    ArgBinding, Callable, ExecutorSpec, Lattice, Node, NodeId, OutputTemplate, TransportGraph,
};
use serde_json::Value;

/// Executor name tasks built by [`LatticeBuilder`] run on unless told
/// otherwise.
pub const FAKE: &str = "fake";

/// Builder for `Lattice` to simplify test setup.
///
/// Nodes are addressed by name; ids follow insertion order.
pub struct LatticeBuilder {
    name: String,
    graph: TransportGraph,
    ids: HashMap<String, NodeId>,
    output: OutputTemplate,
    executor: String,
}

impl LatticeBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            graph: TransportGraph::new(),
            ids: HashMap::new(),
            output: OutputTemplate::default(),
            executor: FAKE.to_string(),
        }
    }

    /// Executor used by subsequently added tasks.
    pub fn on_executor(mut self, executor: &str) -> Self {
        self.executor = executor.to_string();
        self
    }

    pub fn param(self, name: &str, value: Value) -> Self {
        self.node(Node::parameter(name, value))
    }

    pub fn task(self, name: &str, function: &str) -> Self {
        let executor = ExecutorSpec::new(self.executor.clone());
        self.node(Node::task(name, Callable::named(function)).with_executor(executor))
    }

    pub fn task_with(self, name: &str, callable: Callable) -> Self {
        let executor = ExecutorSpec::new(self.executor.clone());
        self.node(Node::task(name, callable).with_executor(executor))
    }

    pub fn sublattice(self, name: &str, function: &str) -> Self {
        let executor = ExecutorSpec::new(self.executor.clone());
        self.node(Node::sublattice(name, Callable::named(function)).with_executor(executor))
    }

    pub fn list(self, name: &str) -> Self {
        self.node(Node::electron_list(name))
    }

    pub fn dict(self, name: &str) -> Self {
        self.node(Node::electron_dict(name))
    }

    pub fn node(mut self, node: Node) -> Self {
        let name = node.name.clone();
        let id = self.graph.add_node(node);
        self.ids.insert(name, id);
        self
    }

    /// Attach `call_before` / `call_after` hooks, run on the node's executor.
    pub fn hooks(mut self, name: &str, before: &[&str], after: &[&str]) -> Self {
        let id = self.id(name);
        let node = self.graph.node_mut(id).expect("builder ids are valid");
        node.call_before = before.iter().map(|h| Callable::named(*h)).collect();
        node.call_after = after.iter().map(|h| Callable::named(*h)).collect();
        self
    }

    /// `from`'s output becomes positional argument `index` of `to`.
    pub fn arg(mut self, from: &str, to: &str, index: usize) -> Self {
        let (s, t) = (self.id(from), self.id(to));
        self.graph.add_edge(s, t, ArgBinding::Positional(index));
        self
    }

    pub fn kwarg(mut self, from: &str, to: &str, key: &str) -> Self {
        let (s, t) = (self.id(from), self.id(to));
        self.graph.add_edge(s, t, ArgBinding::Keyword(key.to_string()));
        self
    }

    pub fn after(mut self, from: &str, to: &str) -> Self {
        let (s, t) = (self.id(from), self.id(to));
        self.graph.add_edge(s, t, ArgBinding::WaitFor);
        self
    }

    pub fn output(mut self, name: &str) -> Self {
        self.output = OutputTemplate::Node(self.id(name));
        self
    }

    pub fn output_map(mut self, names: &[&str]) -> Self {
        let map: BTreeMap<String, OutputTemplate> = names
            .iter()
            .map(|n| (n.to_string(), OutputTemplate::Node(self.id(n))))
            .collect();
        self.output = OutputTemplate::Map(map);
        self
    }

    pub fn id(&self, name: &str) -> NodeId {
        *self
            .ids
            .get(name)
            .unwrap_or_else(|| panic!("no node named '{name}' in builder"))
    }

    pub fn build(self) -> Lattice {
        let lattice = Lattice::new(self.name, self.graph, self.output);
        lattice.validate().expect("builder produced an invalid lattice");
        lattice
    }
}

/// `a -> b -> c`, each task passing its input through `function`.
pub fn chain(names: &[&str], function: &str) -> Lattice {
    let mut b = LatticeBuilder::new("chain");
    for name in names {
        b = b.task(name, function);
    }
    for pair in names.windows(2) {
        b = b.arg(pair[0], pair[1], 0);
    }
    if let Some(last) = names.last() {
        b = b.output(last);
    }
    b.build()
}
