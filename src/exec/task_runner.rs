// src/exec/task_runner.rs

//! Runs a single ready node and turns whatever happens into a
//! [`NodeResult`].

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::dag::{ArgBinding, Callable, GraphStore, Node, NodeId, NodeKind, NodeResult};
use crate::errors::{DispatchError, ExecutorError, Result};
use crate::exec::backend::{ExecutionOutput, Executor, ExecutorRegistry, TaskInputs, TaskMetadata};
use crate::types::Status;

/// Build the call arguments of `node_id` from its producers' outputs.
///
/// Positional arguments are ordered by their binding index, never by edge
/// or producer order. Every producer, including ordering-only ones, must
/// already be `Completed`.
pub fn resolve_inputs(graph: &GraphStore, node_id: NodeId) -> Result<TaskInputs> {
    let mut positional: Vec<(usize, Value)> = Vec::new();
    let mut inputs = TaskInputs::default();

    for edge in graph.get_incoming_edges(node_id)? {
        let parent = graph.get_node(edge.source)?;
        let output = match (&parent.status, parent.output) {
            (Status::Completed, Some(out)) => out,
            (Status::Completed, None) if edge.binding == ArgBinding::WaitFor => Value::Null,
            _ => {
                return Err(DispatchError::DependencyNotReady {
                    node_id,
                    parent: edge.source,
                });
            }
        };
        match edge.binding {
            ArgBinding::Positional(idx) => positional.push((idx, output)),
            ArgBinding::Keyword(name) => {
                inputs.kwargs.insert(name, output);
            }
            ArgBinding::WaitFor => {}
        }
    }

    positional.sort_by_key(|(idx, _)| *idx);
    inputs.args = positional.into_iter().map(|(_, v)| v).collect();
    Ok(inputs)
}

/// Executes nodes through the executors of a registry.
#[derive(Debug, Clone)]
pub struct TaskRunner {
    executors: Arc<ExecutorRegistry>,
}

impl TaskRunner {
    pub fn new(executors: Arc<ExecutorRegistry>) -> Self {
        Self { executors }
    }

    /// Run `node` to a terminal result.
    ///
    /// Never fails: executor acquisition errors and task errors become a
    /// `FAILED` result, executor-reported cancellation a `CANCELLED` one.
    pub async fn run_task(&self, node: &Node, inputs: TaskInputs, meta: TaskMetadata) -> NodeResult {
        let started = Utc::now();
        let mut result = match &node.kind {
            NodeKind::Parameter { value } => NodeResult::completed(node.node_id, value.clone()),
            NodeKind::ElectronList => NodeResult::completed(node.node_id, Value::Array(inputs.args)),
            NodeKind::ElectronDict => {
                let obj: Map<String, Value> = inputs.kwargs.into_iter().collect();
                NodeResult::completed(node.node_id, Value::Object(obj))
            }
            NodeKind::Task | NodeKind::Sublattice => self.run_callable(node, inputs, &meta).await,
        };
        result.start_time = Some(started);
        result
    }

    async fn run_callable(&self, node: &Node, inputs: TaskInputs, meta: &TaskMetadata) -> NodeResult {
        let node_id = node.node_id;

        match meta.jobs.cancel_requested() {
            Ok(true) => {
                info!(dispatch_id = %meta.dispatch_id, node_id, "cancellation requested before start; not running");
                return NodeResult::cancelled(node_id);
            }
            Ok(false) => {}
            Err(e) => warn!(dispatch_id = %meta.dispatch_id, node_id, error = %e, "could not read cancel flag"),
        }

        let Some(function) = node.function.as_ref() else {
            return NodeResult::failed(node_id, format!("node '{}' has no callable", node.name));
        };

        let executor = match self.executors.get(&node.executor.name) {
            Ok(ex) => ex,
            Err(e) => {
                warn!(dispatch_id = %meta.dispatch_id, node_id, executor = %node.executor.name, error = %e, "executor acquisition failed");
                return NodeResult::failed(node_id, e.to_string());
            }
        };

        let mut stdout = String::new();
        let mut stderr = String::new();
        let outcome = run_with_hooks(
            executor.as_ref(),
            node,
            function,
            inputs,
            meta,
            &mut stdout,
            &mut stderr,
        )
        .await;

        let mut result = match outcome {
            Ok(output) => {
                debug!(dispatch_id = %meta.dispatch_id, node_id, "task completed");
                NodeResult::completed(node_id, output)
            }
            Err(ExecutorError::Cancelled) => {
                info!(dispatch_id = %meta.dispatch_id, node_id, "task cancelled by executor");
                NodeResult::cancelled(node_id)
            }
            Err(e) => {
                warn!(dispatch_id = %meta.dispatch_id, node_id, error = %e, "task failed");
                NodeResult::failed(node_id, format!("{e:#}"))
            }
        };
        result.stdout = Some(stdout);
        result.stderr = Some(stderr);
        result
    }
}

/// `call_before` hooks, then the callable, then `call_after` hooks, all on
/// the same executor. Hooks get no arguments.
async fn run_with_hooks(
    executor: &dyn Executor,
    node: &Node,
    function: &Callable,
    inputs: TaskInputs,
    meta: &TaskMetadata,
    stdout: &mut String,
    stderr: &mut String,
) -> std::result::Result<Value, ExecutorError> {
    for hook in &node.call_before {
        let out = executor.execute(hook, TaskInputs::default(), meta).await?;
        collect(out, stdout, stderr);
    }

    let out = executor.execute(function, inputs, meta).await?;
    let value = out.output.clone();
    collect(out, stdout, stderr);

    for hook in &node.call_after {
        let out = executor.execute(hook, TaskInputs::default(), meta).await?;
        collect(out, stdout, stderr);
    }
    Ok(value)
}

fn collect(out: ExecutionOutput, stdout: &mut String, stderr: &mut String) {
    stdout.push_str(&out.stdout);
    stderr.push_str(&out.stderr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{Lattice, OutputTemplate, TransportGraph};
    use crate::data::{DataManager, MemoryStore};
    use crate::types::StoreMode;
    use serde_json::json;

    fn completed(mut node: Node, out: Value) -> Node {
        node.status = Status::Completed;
        node.output = Some(out);
        node
    }

    #[test]
    fn positional_args_follow_binding_index() {
        let mut g = TransportGraph::new();
        let a = g.add_node(completed(Node::parameter("a", json!(1)), json!(1)));
        let b = g.add_node(completed(Node::parameter("b", json!(2)), json!(2)));
        let f1 = g.add_node(Node::task("f", Callable::named("f")));
        let f2 = g.add_node(Node::task("f", Callable::named("f")));
        // f(a, b)
        g.add_edge(a, f1, ArgBinding::Positional(0));
        g.add_edge(b, f1, ArgBinding::Positional(1));
        // f(b, a), edges added in producer order
        g.add_edge(a, f2, ArgBinding::Positional(1));
        g.add_edge(b, f2, ArgBinding::Positional(0));
        g.add_edge(a, f2, ArgBinding::Keyword("k".into()));

        let dm = DataManager::new(Arc::new(MemoryStore::new()), StoreMode::Stateless);
        let id = dm
            .create_dispatch(Lattice::new("wf", g, OutputTemplate::default()), None)
            .unwrap();
        let graph = dm.graph(&id).unwrap();

        assert_eq!(resolve_inputs(&graph, f1).unwrap().args, vec![json!(1), json!(2)]);
        let second = resolve_inputs(&graph, f2).unwrap();
        assert_eq!(second.args, vec![json!(2), json!(1)]);
        assert_eq!(second.kwargs.get("k"), Some(&json!(1)));
    }

    #[test]
    fn unresolved_producer_is_a_precondition_error() {
        let mut g = TransportGraph::new();
        let a = g.add_node(Node::task("a", Callable::named("a")));
        let b = g.add_node(Node::task("b", Callable::named("b")));
        g.add_edge(a, b, ArgBinding::WaitFor);

        let dm = DataManager::new(Arc::new(MemoryStore::new()), StoreMode::Cached);
        let id = dm
            .create_dispatch(Lattice::new("wf", g, OutputTemplate::default()), None)
            .unwrap();
        let err = resolve_inputs(&dm.graph(&id).unwrap(), b).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::DependencyNotReady { node_id: 1, parent: 0 }
        ));
    }
}
