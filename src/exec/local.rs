// src/exec/local.rs

//! In-process executor backed by a registry of Rust closures.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use anyhow::anyhow;
use serde_json::Value;
use tracing::debug;

use crate::dag::Callable;
use crate::errors::ExecutorError;
use crate::exec::backend::{ExecFuture, ExecutionOutput, Executor, TaskInputs, TaskMetadata};

/// Captured output of a local task.
#[derive(Debug, Default)]
pub struct TaskIo {
    pub stdout: String,
    pub stderr: String,
}

impl TaskIo {
    pub fn println(&mut self, line: impl AsRef<str>) {
        self.stdout.push_str(line.as_ref());
        self.stdout.push('\n');
    }
}

pub type TaskFn = Arc<dyn Fn(&TaskInputs, &mut TaskIo) -> anyhow::Result<Value> + Send + Sync>;

/// Task functions addressable by [`Callable::name`].
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, TaskFn>,
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("FunctionRegistry").field("functions", &names).finish()
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&TaskInputs, &mut TaskIo) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(f));
        self
    }

    pub fn get(&self, name: &str) -> Option<TaskFn> {
        self.functions.get(name).cloned()
    }
}

/// Runs registered functions on the blocking thread pool.
///
/// A panicking task fails its node instead of the worker. Running jobs
/// cannot be interrupted, so `cancel` always reports `false`.
#[derive(Debug, Clone, Default)]
pub struct LocalExecutor {
    functions: Arc<FunctionRegistry>,
}

impl LocalExecutor {
    pub fn new(functions: FunctionRegistry) -> Self {
        Self {
            functions: Arc::new(functions),
        }
    }
}

impl Executor for LocalExecutor {
    fn execute<'a>(
        &'a self,
        callable: &'a Callable,
        inputs: TaskInputs,
        meta: &'a TaskMetadata,
    ) -> ExecFuture<'a, ExecutionOutput> {
        Box::pin(async move {
            let f = self.functions.get(&callable.name).ok_or_else(|| {
                ExecutorError::TaskRuntime(format!("no local function named '{}'", callable.name))
            })?;
            debug!(dispatch_id = %meta.dispatch_id, node_id = meta.node_id, function = %callable.name, "running local function");

            let joined = tokio::task::spawn_blocking(move || {
                let mut io = TaskIo::default();
                let res = catch_unwind(AssertUnwindSafe(|| f(&inputs, &mut io)));
                (res, io)
            })
            .await
            .map_err(|e| ExecutorError::Other(anyhow!("local worker failed: {e}")))?;

            match joined {
                (Ok(Ok(output)), io) => Ok(ExecutionOutput {
                    output,
                    stdout: io.stdout,
                    stderr: io.stderr,
                }),
                (Ok(Err(err)), _) => Err(ExecutorError::TaskRuntime(format!("{err:?}"))),
                (Err(panic), _) => Err(ExecutorError::TaskRuntime(format!(
                    "task panicked: {}",
                    panic_message(&panic)
                ))),
            }
        })
    }

    fn cancel<'a>(&'a self, meta: &'a TaskMetadata, _job_handle: &'a str) -> ExecFuture<'a, bool> {
        Box::pin(async move {
            debug!(dispatch_id = %meta.dispatch_id, node_id = meta.node_id, "local jobs cannot be cancelled once started");
            Ok(false)
        })
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Functions available to `function = "..."` electrons out of the box.
///
/// - `identity`: first positional input (or `null`).
/// - `sum`: numeric sum of all positional inputs.
/// - `len`: length of the first input (array, object or string).
/// - `echo`: prints its inputs as JSON and returns them.
pub fn builtin_functions() -> FunctionRegistry {
    FunctionRegistry::new()
        .register("identity", |inputs, _| {
            Ok(inputs.args.first().cloned().unwrap_or(Value::Null))
        })
        .register("sum", |inputs, _| sum_numbers(&inputs.args))
        .register("len", |inputs, _| {
            let len = match inputs.args.first() {
                Some(Value::Array(a)) => a.len(),
                Some(Value::Object(o)) => o.len(),
                Some(Value::String(s)) => s.chars().count(),
                other => return Err(anyhow!("len: unsupported input {other:?}")),
            };
            Ok(Value::from(len))
        })
        .register("echo", |inputs, io| {
            let value = serde_json::to_value(inputs)?;
            io.println(value.to_string());
            Ok(value)
        })
}

/// Integers add up exactly in `i64`; any float argument switches the
/// whole sum to `f64`.
fn sum_numbers(args: &[Value]) -> anyhow::Result<Value> {
    if args.iter().all(|a| a.is_i64()) {
        let mut total: i64 = 0;
        for arg in args {
            let n = arg.as_i64().unwrap_or_default();
            total = total
                .checked_add(n)
                .ok_or_else(|| anyhow!("sum: integer overflow"))?;
        }
        return Ok(Value::from(total));
    }

    let mut total = 0.0;
    for (i, arg) in args.iter().enumerate() {
        let n = arg
            .as_f64()
            .ok_or_else(|| anyhow!("sum: argument {i} is not a number: {arg}"))?;
        total += n;
    }
    Ok(Value::from(total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DataManager, MemoryStore};
    use crate::exec::backend::JobSink;
    use crate::types::StoreMode;
    use serde_json::json;

    fn meta() -> TaskMetadata {
        let data = Arc::new(DataManager::new(Arc::new(MemoryStore::new()), StoreMode::Stateless));
        TaskMetadata {
            dispatch_id: "d".into(),
            node_id: 0,
            node_name: "n".into(),
            executor_config: Value::Null,
            jobs: JobSink::new(data, "d", 0),
        }
    }

    fn inputs(args: Vec<Value>) -> TaskInputs {
        TaskInputs {
            args,
            ..TaskInputs::default()
        }
    }

    #[tokio::test]
    async fn builtins_compute_values() {
        let exec = LocalExecutor::new(builtin_functions());
        let meta = meta();

        let out = exec
            .execute(&Callable::named("sum"), inputs(vec![json!(1), json!(2)]), &meta)
            .await
            .unwrap();
        assert_eq!(out.output, json!(3));

        let out = exec
            .execute(&Callable::named("len"), inputs(vec![json!([1, 2, 3])]), &meta)
            .await
            .unwrap();
        assert_eq!(out.output, json!(3));

        let out = exec
            .execute(&Callable::named("echo"), inputs(vec![json!("hi")]), &meta)
            .await
            .unwrap();
        assert!(out.stdout.contains("\"hi\""));
    }

    #[test]
    fn sum_keeps_large_integers_exact() {
        let big = (1_i64 << 53) + 1;
        assert_eq!(sum_numbers(&[json!(big), json!(2)]).unwrap(), json!(big + 2));
        assert_eq!(sum_numbers(&[json!(1), json!(0.5)]).unwrap(), json!(1.5));
        assert!(sum_numbers(&[json!(i64::MAX), json!(1)]).is_err());
        assert!(sum_numbers(&[json!(1), json!("x")]).is_err());
    }

    #[tokio::test]
    async fn panics_and_errors_become_task_errors() {
        let registry = FunctionRegistry::new()
            .register("boom", |_, _| panic!("exploded"))
            .register("bad", |_, _| Err(anyhow!("bad input")));
        let exec = LocalExecutor::new(registry);
        let meta = meta();

        let err = exec
            .execute(&Callable::named("boom"), TaskInputs::default(), &meta)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exploded"), "{err}");

        let err = exec
            .execute(&Callable::named("bad"), TaskInputs::default(), &meta)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::TaskRuntime(_)));

        let err = exec
            .execute(&Callable::named("missing"), TaskInputs::default(), &meta)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no local function"));
    }
}
