#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use latticed::dag::{Callable, DispatchId, NodeId};
use latticed::errors::ExecutorError;
use latticed::exec::{ExecFuture, ExecutionOutput, Executor, JobSink, TaskInputs, TaskMetadata};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

/// One recorded `execute` call.
#[derive(Debug, Clone, PartialEq)]
pub struct FakeCall {
    pub dispatch_id: DispatchId,
    pub node_id: NodeId,
    pub function: String,
    pub inputs: TaskInputs,
}

pub type FakeFn = Arc<dyn Fn(&TaskInputs) -> Result<Value, String> + Send + Sync>;

/// A fake executor that:
/// - records every call (callable name + resolved inputs)
/// - immediately completes it with the registered function's result
///
/// Unregistered functions return their own name as output.
#[derive(Clone, Default)]
pub struct FakeExecutor {
    functions: Arc<Mutex<HashMap<String, FakeFn>>>,
    calls: Arc<Mutex<Vec<FakeCall>>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fn<F>(self, name: &str, f: F) -> Self
    where
        F: Fn(&TaskInputs) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.functions
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::new(f));
        self
    }

    pub fn returning(self, name: &str, value: Value) -> Self {
        self.with_fn(name, move |_| Ok(value.clone()))
    }

    pub fn failing(self, name: &str, message: &str) -> Self {
        let message = message.to_string();
        self.with_fn(name, move |_| Err(message.clone()))
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Number of calls made to `function`.
    pub fn calls_to(&self, function: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.function == function)
            .count()
    }
}

impl Executor for FakeExecutor {
    fn execute<'a>(
        &'a self,
        callable: &'a Callable,
        inputs: TaskInputs,
        meta: &'a TaskMetadata,
    ) -> ExecFuture<'a, ExecutionOutput> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(FakeCall {
                dispatch_id: meta.dispatch_id.clone(),
                node_id: meta.node_id,
                function: callable.name.clone(),
                inputs: inputs.clone(),
            });
            let f = self.functions.lock().unwrap().get(&callable.name).cloned();
            match f {
                Some(f) => f(&inputs)
                    .map(ExecutionOutput::value)
                    .map_err(ExecutorError::TaskRuntime),
                None => Ok(ExecutionOutput::value(Value::String(callable.name.clone()))),
            }
        })
    }

    fn cancel<'a>(&'a self, _meta: &'a TaskMetadata, _job_handle: &'a str) -> ExecFuture<'a, bool> {
        Box::pin(async { Ok(false) })
    }
}

/// How [`ControllableExecutor::cancel`] answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelBehaviour {
    /// Stop the job and report `true`.
    Accept,
    /// Report `false`; the job keeps running.
    Decline,
    /// Fail the cancel call.
    Error,
}

enum Completion {
    Output(Value),
    Fail(String),
    Cancelled,
}

type Pending = Arc<Mutex<HashMap<(DispatchId, NodeId), oneshot::Sender<Completion>>>>;

/// Executor whose jobs only finish when the test says so.
///
/// Each job publishes a job handle, announces itself on the `started`
/// channel and then blocks until [`complete`](Self::complete),
/// [`fail`](Self::fail) or an accepted cancel.
pub struct ControllableExecutor {
    pending: Pending,
    sinks: Mutex<HashMap<(DispatchId, NodeId), JobSink>>,
    started_tx: mpsc::UnboundedSender<(DispatchId, NodeId)>,
    started_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(DispatchId, NodeId)>>,
    cancel_behaviour: Mutex<CancelBehaviour>,
    cancel_calls: AtomicUsize,
    executions: AtomicUsize,
}

impl Default for ControllableExecutor {
    fn default() -> Self {
        Self::new(CancelBehaviour::Accept)
    }
}

impl ControllableExecutor {
    pub fn new(cancel_behaviour: CancelBehaviour) -> Self {
        let (started_tx, started_rx) = mpsc::unbounded_channel();
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            sinks: Mutex::new(HashMap::new()),
            started_tx,
            started_rx: tokio::sync::Mutex::new(started_rx),
            cancel_behaviour: Mutex::new(cancel_behaviour),
            cancel_calls: AtomicUsize::new(0),
            executions: AtomicUsize::new(0),
        }
    }

    pub fn set_cancel_behaviour(&self, behaviour: CancelBehaviour) {
        *self.cancel_behaviour.lock().unwrap() = behaviour;
    }

    /// Wait for the next job to start.
    pub async fn next_started(&self) -> (DispatchId, NodeId) {
        self.started_rx
            .lock()
            .await
            .recv()
            .await
            .expect("controllable executor dropped")
    }

    /// Finish a running job with `output`. Returns whether it was running.
    pub fn complete(&self, dispatch_id: &str, node_id: NodeId, output: Value) -> bool {
        self.finish(dispatch_id, node_id, Completion::Output(output))
    }

    pub fn fail(&self, dispatch_id: &str, node_id: NodeId, message: &str) -> bool {
        self.finish(dispatch_id, node_id, Completion::Fail(message.to_string()))
    }

    /// Report a started job as running through its [`JobSink`], the way a
    /// remote executor does once its queue picks the job up.
    pub fn mark_ready(&self, dispatch_id: &str, node_id: NodeId) -> bool {
        self.sinks
            .lock()
            .unwrap()
            .get(&(dispatch_id.to_string(), node_id))
            .is_some_and(JobSink::mark_ready)
    }

    pub fn cancel_calls(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    fn finish(&self, dispatch_id: &str, node_id: NodeId, completion: Completion) -> bool {
        let tx = self
            .pending
            .lock()
            .unwrap()
            .remove(&(dispatch_id.to_string(), node_id));
        match tx {
            Some(tx) => tx.send(completion).is_ok(),
            None => false,
        }
    }
}

impl Executor for ControllableExecutor {
    fn execute<'a>(
        &'a self,
        _callable: &'a Callable,
        _inputs: TaskInputs,
        meta: &'a TaskMetadata,
    ) -> ExecFuture<'a, ExecutionOutput> {
        Box::pin(async move {
            self.executions.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = oneshot::channel();
            self.pending
                .lock()
                .unwrap()
                .insert((meta.dispatch_id.clone(), meta.node_id), tx);
            self.sinks
                .lock()
                .unwrap()
                .insert((meta.dispatch_id.clone(), meta.node_id), meta.jobs.clone());
            meta.jobs
                .set_job_handle(format!("fake:{}:{}", meta.dispatch_id, meta.node_id))
                .map_err(|e| ExecutorError::Other(e.into()))?;
            let _ = self.started_tx.send((meta.dispatch_id.clone(), meta.node_id));

            match rx.await {
                Ok(Completion::Output(v)) => Ok(ExecutionOutput::value(v)),
                Ok(Completion::Fail(msg)) => Err(ExecutorError::TaskRuntime(msg)),
                Ok(Completion::Cancelled) | Err(_) => Err(ExecutorError::Cancelled),
            }
        })
    }

    fn cancel<'a>(&'a self, meta: &'a TaskMetadata, _job_handle: &'a str) -> ExecFuture<'a, bool> {
        Box::pin(async move {
            self.cancel_calls.fetch_add(1, Ordering::SeqCst);
            let behaviour = *self.cancel_behaviour.lock().unwrap();
            match behaviour {
                CancelBehaviour::Accept => {
                    self.finish(&meta.dispatch_id, meta.node_id, Completion::Cancelled);
                    Ok(true)
                }
                CancelBehaviour::Decline => Ok(false),
                CancelBehaviour::Error => Err(ExecutorError::Acquisition {
                    name: "controllable".to_string(),
                    reason: "cancel refused".to_string(),
                }),
            }
        })
    }
}
