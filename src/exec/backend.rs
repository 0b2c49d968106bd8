// src/exec/backend.rs

//! Executor contract and registry.
//!
//! The task runner talks to an [`Executor`] trait object picked by name
//! from an [`ExecutorRegistry`]. Production code registers
//! [`LocalExecutor`](super::local::LocalExecutor) and
//! [`ShellExecutor`](super::shell::ShellExecutor); tests register fakes that
//! record calls and complete on demand.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::dag::{Callable, DispatchId, NodeId};
use crate::data::DataManager;
use crate::errors::{ExecutorError, Result};

/// Boxed future returned by executor methods.
pub type ExecFuture<'a, T> = Pin<Box<dyn Future<Output = std::result::Result<T, ExecutorError>> + Send + 'a>>;

/// Fully resolved call arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskInputs {
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
}

/// What an executor hands back for one successful invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionOutput {
    pub output: Value,
    pub stdout: String,
    pub stderr: String,
}

impl ExecutionOutput {
    pub fn value(output: Value) -> Self {
        Self {
            output,
            ..Self::default()
        }
    }
}

/// Channel from a running job back to the job record of its node.
///
/// Executors publish their job handle through it, may poll whether
/// cancellation was requested, and call [`mark_ready`](Self::mark_ready)
/// once a job they submitted asynchronously has actually started.
#[derive(Clone)]
pub struct JobSink {
    data: Arc<DataManager>,
    dispatch_id: DispatchId,
    node_id: NodeId,
    ready: Option<mpsc::UnboundedSender<NodeId>>,
}

impl fmt::Debug for JobSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSink")
            .field("dispatch_id", &self.dispatch_id)
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl JobSink {
    pub fn new(data: Arc<DataManager>, dispatch_id: impl Into<DispatchId>, node_id: NodeId) -> Self {
        Self {
            data,
            dispatch_id: dispatch_id.into(),
            node_id,
            ready: None,
        }
    }

    /// Route [`mark_ready`](Self::mark_ready) to the dispatch loop behind
    /// `ready`.
    pub fn with_ready(mut self, ready: mpsc::UnboundedSender<NodeId>) -> Self {
        self.ready = Some(ready);
        self
    }

    /// Tell the dispatch loop the job is now running on the executor's
    /// side. Returns whether a loop received the signal.
    pub fn mark_ready(&self) -> bool {
        let delivered = self
            .ready
            .as_ref()
            .is_some_and(|tx| tx.send(self.node_id).is_ok());
        if !delivered {
            debug!(dispatch_id = %self.dispatch_id, node_id = self.node_id, "ready signal not delivered");
        }
        delivered
    }

    pub fn set_job_handle(&self, handle: impl Into<String>) -> Result<()> {
        let handle = handle.into();
        self.data.update_job(&self.dispatch_id, self.node_id, &mut |job| {
            job.job_handle = Some(handle.clone());
        })?;
        Ok(())
    }

    pub fn cancel_requested(&self) -> Result<bool> {
        Ok(self.data.get_job(&self.dispatch_id, self.node_id)?.cancel_requested)
    }
}

/// Context an executor receives with every call.
#[derive(Debug, Clone)]
pub struct TaskMetadata {
    pub dispatch_id: DispatchId,
    pub node_id: NodeId,
    pub node_name: String,
    /// Per-node executor configuration blob.
    pub executor_config: Value,
    pub jobs: JobSink,
}

/// Pluggable backend that runs task callables.
pub trait Executor: Send + Sync {
    /// Run `callable` with `inputs`.
    ///
    /// Errors become a `FAILED` node (or `CANCELLED` for
    /// [`ExecutorError::Cancelled`]).
    fn execute<'a>(
        &'a self,
        callable: &'a Callable,
        inputs: TaskInputs,
        meta: &'a TaskMetadata,
    ) -> ExecFuture<'a, ExecutionOutput>;

    /// Best-effort cancellation of the job behind `job_handle`.
    ///
    /// `Ok(true)` means the job was stopped; `Ok(false)` or an error leaves
    /// the node running.
    fn cancel<'a>(&'a self, meta: &'a TaskMetadata, job_handle: &'a str) -> ExecFuture<'a, bool>;
}

/// Named executors available to a dispatcher.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.executors.keys().collect();
        names.sort();
        f.debug_struct("ExecutorRegistry")
            .field("executors", &names)
            .finish()
    }
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, executor: Arc<dyn Executor>) {
        self.executors.insert(name.into(), executor);
    }

    pub fn with(mut self, name: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        self.register(name, executor);
        self
    }

    pub fn get(&self, name: &str) -> std::result::Result<Arc<dyn Executor>, ExecutorError> {
        self.executors
            .get(name)
            .cloned()
            .ok_or_else(|| ExecutorError::NotFound(name.to_string()))
    }
}
