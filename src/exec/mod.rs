// src/exec/mod.rs

//! Task execution layer.
//!
//! - [`backend`] defines the `Executor` contract, the per-call
//!   `TaskMetadata`/`JobSink` context and the `ExecutorRegistry`.
//! - [`task_runner`] resolves a node's inputs and runs it (hooks included),
//!   always producing a terminal `NodeResult`.
//! - [`local`] runs registered Rust closures on the blocking pool.
//! - [`shell`] runs commands through `sh -c` and can kill them.
//! - [`cancel`] is the best-effort per-node cancellation manager.

pub mod backend;
pub mod cancel;
pub mod local;
pub mod shell;
pub mod task_runner;

pub use backend::{ExecFuture, ExecutionOutput, Executor, ExecutorRegistry, JobSink, TaskInputs, TaskMetadata};
pub use cancel::{CancelOutcome, CancellationManager};
pub use local::{FunctionRegistry, LocalExecutor, TaskIo, builtin_functions};
pub use shell::ShellExecutor;
pub use task_runner::{TaskRunner, resolve_inputs};
