// src/exec/shell.rs

//! Executor that runs each callable as a shell command.
//!
//! The command comes from the callable body (`{"cmd": "..."}` or a bare
//! string). Positional and keyword inputs are passed as JSON in the
//! `LATTICED_ARGS` and `LATTICED_KWARGS` environment variables. The last
//! non-empty stdout line is the task output: parsed as JSON when possible,
//! otherwise kept as a string.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use anyhow::{Context, anyhow};
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dag::Callable;
use crate::errors::ExecutorError;
use crate::exec::backend::{ExecFuture, ExecutionOutput, Executor, TaskInputs, TaskMetadata};

/// Cancel senders of running commands, keyed by job handle.
type ActiveJobs = Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>;

#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
    active: ActiveJobs,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new("sh")
    }
}

impl ShellExecutor {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn register(&self, handle: &str, cancel: oneshot::Sender<()>) {
        if let Ok(mut active) = self.active.lock() {
            active.insert(handle.to_string(), cancel);
        }
    }

    fn take(&self, handle: &str) -> Option<oneshot::Sender<()>> {
        self.active.lock().ok().and_then(|mut a| a.remove(handle))
    }

    async fn run_command(
        &self,
        callable: &Callable,
        inputs: TaskInputs,
        meta: &TaskMetadata,
    ) -> Result<ExecutionOutput, ExecutorError> {
        let script = command_text(callable)?;
        let args = serde_json::to_string(&inputs.args).map_err(|e| ExecutorError::Other(e.into()))?;
        let kwargs =
            serde_json::to_string(&inputs.kwargs).map_err(|e| ExecutorError::Other(e.into()))?;

        info!(
            dispatch_id = %meta.dispatch_id,
            node_id = meta.node_id,
            cmd = %script,
            "starting shell task"
        );

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&script)
            .env("LATTICED_ARGS", args)
            .env("LATTICED_KWARGS", kwargs)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning shell for node '{}'", meta.node_name))
            .map_err(|e| ExecutorError::Acquisition {
                name: self.shell.clone(),
                reason: format!("{e:#}"),
            })?;

        let handle = child
            .id()
            .map(|pid| format!("pid:{pid}"))
            .unwrap_or_else(|| format!("job:{}", Uuid::new_v4()));
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        self.register(&handle, cancel_tx);
        if let Err(e) = meta.jobs.set_job_handle(handle.clone()) {
            warn!(node_id = meta.node_id, error = %e, "failed to record job handle");
        }

        // Drain both pipes concurrently so neither buffer fills.
        let stdout_task = child.stdout.take().map(|mut out| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = out.read_to_string(&mut buf).await;
                buf
            })
        });
        let stderr_task = child.stderr.take().map(|mut err| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = err.read_to_string(&mut buf).await;
                buf
            })
        });

        let outcome = tokio::select! {
            status = child.wait() => Some(status),
            cancel = &mut cancel_rx => {
                match cancel {
                    Ok(()) => {
                        info!(node_id = meta.node_id, job = %handle, "cancellation requested; killing shell task");
                        if let Err(e) = child.kill().await {
                            warn!(node_id = meta.node_id, error = %e, "failed to kill child process on cancellation");
                        }
                    }
                    Err(_) => debug!(node_id = meta.node_id, "cancel channel closed"),
                }
                None
            }
        };
        self.take(&handle);

        let Some(status) = outcome else {
            // Orphaned grandchildren may still hold the pipes open.
            for task in stdout_task.into_iter().chain(stderr_task) {
                task.abort();
            }
            return Err(ExecutorError::Cancelled);
        };
        let stdout = join_pipe(stdout_task).await;
        let stderr = join_pipe(stderr_task).await;
        let status = status
            .with_context(|| format!("waiting for shell task of node '{}'", meta.node_name))
            .map_err(ExecutorError::Other)?;

        let code = status.code().unwrap_or(-1);
        info!(node_id = meta.node_id, exit_code = code, success = status.success(), "shell task exited");
        if !status.success() {
            return Err(ExecutorError::TaskRuntime(format!(
                "command exited with code {code}\n{}",
                stderr.trim_end()
            )));
        }

        Ok(ExecutionOutput {
            output: parse_output(&stdout),
            stdout,
            stderr,
        })
    }
}

impl Executor for ShellExecutor {
    fn execute<'a>(
        &'a self,
        callable: &'a Callable,
        inputs: TaskInputs,
        meta: &'a TaskMetadata,
    ) -> ExecFuture<'a, ExecutionOutput> {
        Box::pin(self.run_command(callable, inputs, meta))
    }

    fn cancel<'a>(&'a self, meta: &'a TaskMetadata, job_handle: &'a str) -> ExecFuture<'a, bool> {
        Box::pin(async move {
            match self.take(job_handle) {
                Some(tx) => {
                    let delivered = tx.send(()).is_ok();
                    debug!(node_id = meta.node_id, job = %job_handle, delivered, "sent cancel to shell task");
                    Ok(delivered)
                }
                None => {
                    debug!(node_id = meta.node_id, job = %job_handle, "no running shell task for job handle");
                    Ok(false)
                }
            }
        })
    }
}

fn command_text(callable: &Callable) -> Result<String, ExecutorError> {
    match &callable.body {
        Value::String(s) => Ok(s.clone()),
        Value::Object(map) => map
            .get("cmd")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                ExecutorError::Other(anyhow!("callable '{}' has no `cmd`", callable.name))
            }),
        _ => Err(ExecutorError::Other(anyhow!(
            "callable '{}' has no command body",
            callable.name
        ))),
    }
}

async fn join_pipe(task: Option<tokio::task::JoinHandle<String>>) -> String {
    match task {
        Some(t) => t.await.unwrap_or_default(),
        None => String::new(),
    }
}

fn parse_output(stdout: &str) -> Value {
    match stdout.lines().rev().find(|l| !l.trim().is_empty()) {
        Some(line) => serde_json::from_str(line.trim())
            .unwrap_or_else(|_| Value::String(line.trim().to_string())),
        None => Value::Null,
    }
}
