// src/dag/node.rs

//! Node model: what a task is, how it runs, and its per-dispatch state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dag::{DispatchId, NodeId};
use crate::errors::{DispatchError, Result};
use crate::types::Status;

/// Descriptor of a task callable.
///
/// `name` selects the function (e.g. in a [`FunctionRegistry`]) and `body`
/// carries whatever the executor needs to run it (a shell command, inline
/// parameters). Its [`identity`](Callable::identity) is the task identity
/// used when diffing graphs.
///
/// [`FunctionRegistry`]: crate::exec::local::FunctionRegistry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Callable {
    pub name: String,
    #[serde(default)]
    pub body: Value,
}

impl Callable {
    pub fn new(name: impl Into<String>, body: Value) -> Self {
        Self {
            name: name.into(),
            body,
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, Value::Null)
    }

    /// Stable content digest of this callable.
    ///
    /// `serde_json::Value` objects keep their keys sorted, so the JSON text
    /// is canonical.
    pub fn identity(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.name.as_bytes());
        hasher.update(&[0]);
        hasher.update(self.body.to_string().as_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

/// Which executor runs a node, plus its configuration blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorSpec {
    pub name: String,
    #[serde(default)]
    pub config: Value,
}

impl ExecutorSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: Value::Null,
        }
    }
}

impl Default for ExecutorSpec {
    fn default() -> Self {
        Self::new("local")
    }
}

/// Node variants the scheduler and runner dispatch on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Constant input; completes with `value` without touching an executor.
    Parameter { value: Value },
    /// Ordinary task run by its executor.
    Task,
    /// Task whose output is a lattice manifest, expanded into a child
    /// dispatch.
    Sublattice,
    /// Packs its positional inputs into a JSON array.
    ElectronList,
    /// Packs its keyword inputs into a JSON object.
    ElectronDict,
}

impl NodeKind {
    fn tag(&self) -> &'static str {
        match self {
            NodeKind::Parameter { .. } => "parameter",
            NodeKind::Task => "task",
            NodeKind::Sublattice => "sublattice",
            NodeKind::ElectronList => "electron_list",
            NodeKind::ElectronDict => "electron_dict",
        }
    }
}

/// Global reference to a node: which dispatch, which node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElectronRef {
    pub dispatch_id: DispatchId,
    pub node_id: NodeId,
}

/// A single task instance inside one dispatch's graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub function: Option<Callable>,
    #[serde(default)]
    pub call_before: Vec<Callable>,
    #[serde(default)]
    pub call_after: Vec<Callable>,
    pub task_group_id: NodeId,
    #[serde(default)]
    pub executor: ExecutorSpec,

    #[serde(default = "new_status")]
    pub status: Status,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    /// Child dispatch spawned by this node, if it is an expanded sublattice.
    #[serde(default)]
    pub sub_dispatch_id: Option<DispatchId>,
    /// Electron whose sublattice expansion produced the graph this node
    /// belongs to. Lookup only.
    #[serde(default)]
    pub parent_electron_id: Option<ElectronRef>,
}

fn new_status() -> Status {
    Status::New
}

impl Node {
    fn with_kind(name: impl Into<String>, kind: NodeKind, function: Option<Callable>) -> Self {
        Self {
            node_id: 0,
            name: name.into(),
            kind,
            function,
            call_before: Vec::new(),
            call_after: Vec::new(),
            task_group_id: 0,
            executor: ExecutorSpec::default(),
            status: Status::New,
            start_time: None,
            end_time: None,
            output: None,
            error: None,
            stdout: None,
            stderr: None,
            sub_dispatch_id: None,
            parent_electron_id: None,
        }
    }

    pub fn task(name: impl Into<String>, function: Callable) -> Self {
        Self::with_kind(name, NodeKind::Task, Some(function))
    }

    pub fn sublattice(name: impl Into<String>, function: Callable) -> Self {
        Self::with_kind(name, NodeKind::Sublattice, Some(function))
    }

    pub fn parameter(name: impl Into<String>, value: Value) -> Self {
        Self::with_kind(name, NodeKind::Parameter { value }, None)
    }

    pub fn electron_list(name: impl Into<String>) -> Self {
        Self::with_kind(name, NodeKind::ElectronList, None)
    }

    pub fn electron_dict(name: impl Into<String>) -> Self {
        Self::with_kind(name, NodeKind::ElectronDict, None)
    }

    pub fn with_executor(mut self, executor: ExecutorSpec) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_hooks(mut self, call_before: Vec<Callable>, call_after: Vec<Callable>) -> Self {
        self.call_before = call_before;
        self.call_after = call_after;
        self
    }

    /// Task identity used by the graph diff engine.
    ///
    /// Covers the node kind, its callable (or parameter value) and its
    /// lifecycle hooks; executor choice and runtime state are excluded.
    pub fn identity(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.kind.tag().as_bytes());
        hasher.update(&[0]);
        match &self.kind {
            NodeKind::Parameter { value } => {
                hasher.update(value.to_string().as_bytes());
            }
            NodeKind::ElectronList | NodeKind::ElectronDict => {
                hasher.update(self.name.as_bytes());
            }
            NodeKind::Task | NodeKind::Sublattice => {
                if let Some(f) = &self.function {
                    hasher.update(f.identity().as_bytes());
                }
            }
        }
        for hook in self.call_before.iter().chain(self.call_after.iter()) {
            hasher.update(&[1]);
            hasher.update(hook.identity().as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Clear everything a run writes, returning the node to `New`.
    pub fn reset_runtime_state(&mut self) {
        self.status = Status::New;
        self.start_time = None;
        self.end_time = None;
        self.output = None;
        self.error = None;
        self.stdout = None;
        self.stderr = None;
        self.sub_dispatch_id = None;
    }

    /// Set a single attribute without status-transition checks.
    pub fn set_attribute(&mut self, attr: NodeAttribute) {
        match attr {
            NodeAttribute::Status(s) => self.status = s,
            NodeAttribute::StartTime(t) => self.start_time = t,
            NodeAttribute::EndTime(t) => self.end_time = t,
            NodeAttribute::Output(v) => self.output = v,
            NodeAttribute::Error(e) => self.error = e,
            NodeAttribute::Stdout(s) => self.stdout = s,
            NodeAttribute::Stderr(s) => self.stderr = s,
            NodeAttribute::SubDispatchId(id) => self.sub_dispatch_id = id,
            NodeAttribute::Function(f) => self.function = f,
        }
    }

    /// Apply a runner/dispatcher result, enforcing the status state machine.
    ///
    /// Fields that are `None` in the result leave the node untouched. Once a
    /// node has completed its output is never overwritten, because
    /// `Completed` is terminal and rejects every further update.
    pub fn apply_result(&mut self, result: &NodeResult) -> Result<()> {
        if !self.status.can_transition_to(result.status) {
            return Err(DispatchError::InvalidStatusTransition {
                node_id: self.node_id,
                from: self.status,
                to: result.status,
            });
        }

        self.status = result.status;
        if result.start_time.is_some() {
            self.start_time = result.start_time;
        }
        if result.end_time.is_some() {
            self.end_time = result.end_time;
        }
        if result.output.is_some() {
            self.output = result.output.clone();
        }
        if result.error.is_some() {
            self.error = result.error.clone();
        }
        if result.stdout.is_some() {
            self.stdout = result.stdout.clone();
        }
        if result.stderr.is_some() {
            self.stderr = result.stderr.clone();
        }
        if result.sub_dispatch_id.is_some() {
            self.sub_dispatch_id = result.sub_dispatch_id.clone();
        }
        Ok(())
    }
}

/// A single settable node attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeAttribute {
    Status(Status),
    StartTime(Option<DateTime<Utc>>),
    EndTime(Option<DateTime<Utc>>),
    Output(Option<Value>),
    Error(Option<String>),
    Stdout(Option<String>),
    Stderr(Option<String>),
    SubDispatchId(Option<DispatchId>),
    Function(Option<Callable>),
}

/// Outcome reported for a node, by the task runner or synthesized by the
/// dispatcher (sublattice completion, cancellation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub node_id: NodeId,
    pub status: Status,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sub_dispatch_id: Option<DispatchId>,
}

impl NodeResult {
    pub fn new(node_id: NodeId, status: Status) -> Self {
        Self {
            node_id,
            status,
            output: None,
            error: None,
            stdout: None,
            stderr: None,
            start_time: None,
            end_time: None,
            sub_dispatch_id: None,
        }
    }

    pub fn running(node_id: NodeId) -> Self {
        let mut r = Self::new(node_id, Status::Running);
        r.start_time = Some(Utc::now());
        r
    }

    pub fn completed(node_id: NodeId, output: Value) -> Self {
        let mut r = Self::new(node_id, Status::Completed);
        r.output = Some(output);
        r.end_time = Some(Utc::now());
        r
    }

    pub fn failed(node_id: NodeId, error: impl Into<String>) -> Self {
        let mut r = Self::new(node_id, Status::Failed);
        r.error = Some(error.into());
        r.end_time = Some(Utc::now());
        r
    }

    pub fn cancelled(node_id: NodeId) -> Self {
        let mut r = Self::new(node_id, Status::Cancelled);
        r.end_time = Some(Utc::now());
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identity_tracks_callable_body_not_executor() {
        let a = Node::task("f", Callable::new("f", json!({"cmd": "echo 1"})));
        let b = Node::task("f", Callable::new("f", json!({"cmd": "echo 1"})))
            .with_executor(ExecutorSpec::new("shell"));
        let c = Node::task("f", Callable::new("f", json!({"cmd": "echo 2"})));

        assert_eq!(a.identity(), b.identity());
        assert_ne!(a.identity(), c.identity());
    }

    #[test]
    fn parameter_identity_depends_on_value() {
        let one = Node::parameter(":parameter:1", json!(1));
        let two = Node::parameter(":parameter:1", json!(2));
        assert_ne!(one.identity(), two.identity());
    }

    #[test]
    fn completed_output_is_immutable() {
        let mut node = Node::task("f", Callable::named("f"));
        node.apply_result(&NodeResult::running(0)).unwrap();
        node.apply_result(&NodeResult::completed(0, json!(5))).unwrap();

        let err = node
            .apply_result(&NodeResult::completed(0, json!(6)))
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidStatusTransition { .. }));
        assert_eq!(node.output, Some(json!(5)));
    }
}
