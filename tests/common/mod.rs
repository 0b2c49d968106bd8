#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{Value, json};

use latticed::engine::Dispatcher;
use latticed::exec::{Executor, ExecutorRegistry, TaskInputs};
use latticed::types::StoreMode;
use latticed_test_utils::builders::FAKE;
use latticed_test_utils::fake_executor::FakeExecutor;
use latticed_test_utils::memory_dispatcher;

pub use latticed_test_utils::{init_tracing, with_timeout};

/// Fake executor with a few arithmetic functions:
/// `one` → 1, `inc(x)` → x + 1, `add(a, b)` → a + b, `pair(a, b)` → [a, b].
pub fn arithmetic_executor() -> FakeExecutor {
    FakeExecutor::new()
        .returning("one", json!(1))
        .with_fn("inc", |inputs| Ok(json!(arg(inputs, 0)? + 1)))
        .with_fn("add", |inputs| Ok(json!(arg(inputs, 0)? + arg(inputs, 1)?)))
        .with_fn("pair", |inputs| Ok(Value::Array(inputs.args.clone())))
}

fn arg(inputs: &TaskInputs, idx: usize) -> Result<i64, String> {
    inputs
        .args
        .get(idx)
        .and_then(Value::as_i64)
        .ok_or_else(|| format!("argument {idx} missing or not an integer: {:?}", inputs.args))
}

pub fn registry_with(executor: Arc<dyn Executor>) -> ExecutorRegistry {
    ExecutorRegistry::new().with(FAKE, executor)
}

pub fn dispatcher_with(executor: Arc<dyn Executor>, mode: StoreMode) -> Dispatcher {
    memory_dispatcher(registry_with(executor), mode)
}
