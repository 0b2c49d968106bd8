mod common;
use crate::common::{arithmetic_executor, dispatcher_with, init_tracing, with_timeout};

use std::error::Error;
use std::sync::Arc;

use serde_json::json;

use latticed::dag::NodeResult;
use latticed::errors::DispatchError;
use latticed::types::{Status, StoreMode};
use latticed_test_utils::builders::LatticeBuilder;
use latticed_test_utils::fake_executor::ControllableExecutor;

type TestResult = Result<(), Box<dyn Error>>;

#[tokio::test]
async fn chain_runs_to_completion_with_result() -> TestResult {
    init_tracing();
    let fake = Arc::new(arithmetic_executor());
    let dispatcher = dispatcher_with(fake.clone(), StoreMode::Stateless);

    let lattice = LatticeBuilder::new("chain")
        .task("a", "one")
        .task("b", "inc")
        .task("c", "inc")
        .arg("a", "b", 0)
        .arg("b", "c", 0)
        .output("c")
        .build();
    let id = dispatcher.submit(lattice)?;
    assert_eq!(dispatcher.get_status(&id)?, Status::New);

    let status = with_timeout(dispatcher.run(&id)).await?;
    assert_eq!(status, Status::Completed);

    let meta = dispatcher.get_dispatch(&id)?;
    assert_eq!(meta.result, Some(json!(3)));
    assert!(meta.start_time.is_some() && meta.end_time.is_some());
    assert!(dispatcher.get_incomplete_tasks(&id)?.is_empty());

    let order: Vec<usize> = fake.calls().iter().map(|c| c.node_id).collect();
    assert_eq!(order, vec![0, 1, 2]);
    Ok(())
}

#[tokio::test]
async fn positional_arguments_follow_binding_index_not_edge_order() -> TestResult {
    init_tracing();
    let fake = Arc::new(arithmetic_executor());
    let dispatcher = dispatcher_with(fake.clone(), StoreMode::Stateless);

    let lattice = LatticeBuilder::new("order")
        .param("x", json!(1))
        .param("y", json!(2))
        .task("p", "pair")
        // Second argument's edge is added first.
        .arg("y", "p", 1)
        .arg("x", "p", 0)
        .output("p")
        .build();
    let id = dispatcher.submit(lattice)?;
    with_timeout(dispatcher.run(&id)).await?;

    assert_eq!(dispatcher.get_dispatch(&id)?.result, Some(json!([1, 2])));
    assert_eq!(fake.calls()[0].inputs.args, vec![json!(1), json!(2)]);
    Ok(())
}

#[tokio::test]
async fn collectors_and_keywords_build_structured_inputs() -> TestResult {
    init_tracing();
    let fake = Arc::new(arithmetic_executor());
    let dispatcher = dispatcher_with(fake, StoreMode::Stateless);

    let lattice = LatticeBuilder::new("collect")
        .param("x", json!(5))
        .task("a", "one")
        .list("items")
        .dict("named")
        .arg("x", "items", 0)
        .arg("a", "items", 1)
        .kwarg("x", "named", "x")
        .kwarg("a", "named", "a")
        .output_map(&["items", "named"])
        .build();
    let id = dispatcher.submit(lattice)?;
    assert_eq!(with_timeout(dispatcher.run(&id)).await?, Status::Completed);

    assert_eq!(
        dispatcher.get_dispatch(&id)?.result,
        Some(json!({"items": [5, 1], "named": {"a": 1, "x": 5}}))
    );
    Ok(())
}

#[tokio::test]
async fn failed_node_fails_dispatch_and_blocks_descendants() -> TestResult {
    init_tracing();
    let fake = Arc::new(arithmetic_executor().failing("boom", "division by zero"));
    let dispatcher = dispatcher_with(fake.clone(), StoreMode::Stateless);

    let lattice = LatticeBuilder::new("fails")
        .task("a", "one")
        .task("b", "boom")
        .task("c", "inc")
        .arg("a", "b", 0)
        .arg("b", "c", 0)
        .output("c")
        .build();
    let id = dispatcher.submit(lattice)?;
    assert_eq!(with_timeout(dispatcher.run(&id)).await?, Status::Failed);

    let meta = dispatcher.get_dispatch(&id)?;
    let error = meta.error.unwrap_or_default();
    assert!(error.contains("Node b (1) failed"), "{error}");
    assert!(error.contains("division by zero"), "{error}");

    let nodes = dispatcher.data().get_nodes(&id)?;
    assert_eq!(nodes[2].status, Status::New, "descendant must never start");
    assert_eq!(dispatcher.get_incomplete_tasks(&id)?, vec![1, 2]);
    assert_eq!(fake.calls_to("inc"), 0);
    Ok(())
}

#[tokio::test]
async fn running_a_finished_dispatch_is_a_no_op() -> TestResult {
    init_tracing();
    let fake = Arc::new(arithmetic_executor());
    let dispatcher = dispatcher_with(fake.clone(), StoreMode::Stateless);

    let lattice = LatticeBuilder::new("once").task("a", "one").output("a").build();
    let id = dispatcher.submit(lattice)?;

    assert_eq!(with_timeout(dispatcher.run(&id)).await?, Status::Completed);
    assert_eq!(with_timeout(dispatcher.run(&id)).await?, Status::Completed);
    assert_eq!(dispatcher.start(&id)?, id);
    assert_eq!(fake.call_count(), 1);
    Ok(())
}

#[tokio::test]
async fn subscribers_see_node_status_changes() -> TestResult {
    init_tracing();
    let fake = Arc::new(arithmetic_executor());
    let dispatcher = dispatcher_with(fake, StoreMode::Stateless);
    let mut updates = dispatcher.subscribe();

    let lattice = LatticeBuilder::new("watched").task("a", "one").output("a").build();
    let id = dispatcher.submit(lattice)?;
    with_timeout(dispatcher.run(&id)).await?;

    let mut seen = Vec::new();
    while let Ok(update) = updates.try_recv() {
        assert_eq!(update.dispatch_id, id);
        seen.push((update.node_id, update.status));
    }
    assert_eq!(seen, vec![(0, Status::Running), (0, Status::Completed)]);
    Ok(())
}

#[tokio::test]
async fn unknown_dispatch_is_reported() {
    init_tracing();
    let dispatcher = dispatcher_with(Arc::new(arithmetic_executor()), StoreMode::Stateless);
    let err = dispatcher.get_status("missing").unwrap_err();
    assert!(matches!(err, DispatchError::DispatchNotFound(_)), "{err}");
    assert!(dispatcher.start("missing").is_err());
}

#[tokio::test]
async fn resumed_dispatch_reruns_only_unfinished_nodes() -> TestResult {
    init_tracing();
    let fake = Arc::new(arithmetic_executor());
    let dispatcher = dispatcher_with(fake.clone(), StoreMode::Cached);

    let lattice = LatticeBuilder::new("resume")
        .task("a", "one")
        .task("b", "inc")
        .task("c", "inc")
        .arg("a", "b", 0)
        .arg("b", "c", 0)
        .output("c")
        .build();
    let id = dispatcher.submit(lattice)?;

    // State left behind by a process that died while `b` was running.
    let data = dispatcher.data();
    data.set_dispatch_status(&id, Status::Running)?;
    data.update_node(&id, &NodeResult::running(0))?;
    data.update_node(&id, &NodeResult::completed(0, json!(1)))?;
    data.decrement_unresolved(&id)?;
    data.update_node(&id, &NodeResult::running(1))?;

    assert_eq!(with_timeout(dispatcher.run(&id)).await?, Status::Completed);
    assert_eq!(dispatcher.get_dispatch(&id)?.result, Some(json!(3)));
    assert_eq!(fake.calls_to("one"), 0);
    assert_eq!(fake.calls_to("inc"), 2);
    assert!(dispatcher.get_incomplete_tasks(&id)?.is_empty());
    Ok(())
}

#[tokio::test]
async fn dispatch_interrupted_while_postprocessing_can_be_resumed() -> TestResult {
    init_tracing();
    let fake = Arc::new(arithmetic_executor());
    let dispatcher = dispatcher_with(fake.clone(), StoreMode::Stateless);

    let lattice = LatticeBuilder::new("post").task("a", "one").output("a").build();
    let id = dispatcher.submit(lattice)?;

    let data = dispatcher.data();
    data.set_dispatch_status(&id, Status::Running)?;
    data.update_node(&id, &NodeResult::running(0))?;
    data.update_node(&id, &NodeResult::completed(0, json!(7)))?;
    data.decrement_unresolved(&id)?;
    data.set_dispatch_status(&id, Status::Postprocessing)?;

    assert_eq!(with_timeout(dispatcher.run(&id)).await?, Status::Completed);
    assert_eq!(dispatcher.get_dispatch(&id)?.result, Some(json!(7)));
    assert_eq!(fake.call_count(), 0);
    Ok(())
}

#[tokio::test]
async fn hooks_run_around_the_task_in_order() -> TestResult {
    init_tracing();
    let fake = Arc::new(arithmetic_executor());
    let dispatcher = dispatcher_with(fake.clone(), StoreMode::Stateless);

    let lattice = LatticeBuilder::new("hooked")
        .task("a", "one")
        .hooks("a", &["setup"], &["teardown", "report"])
        .output("a")
        .build();
    let id = dispatcher.submit(lattice)?;
    assert_eq!(with_timeout(dispatcher.run(&id)).await?, Status::Completed);

    let order: Vec<String> = fake.calls().into_iter().map(|c| c.function).collect();
    assert_eq!(order, vec!["setup", "one", "teardown", "report"]);
    assert_eq!(dispatcher.get_dispatch(&id)?.result, Some(json!(1)), "hooks do not replace the output");
    Ok(())
}

#[tokio::test]
async fn failing_before_hook_fails_the_node_without_running_it() -> TestResult {
    init_tracing();
    let fake = Arc::new(arithmetic_executor().failing("setup", "no scratch space"));
    let dispatcher = dispatcher_with(fake.clone(), StoreMode::Stateless);

    let lattice = LatticeBuilder::new("hooked")
        .task("a", "one")
        .hooks("a", &["setup"], &["teardown"])
        .output("a")
        .build();
    let id = dispatcher.submit(lattice)?;
    assert_eq!(with_timeout(dispatcher.run(&id)).await?, Status::Failed);

    let node = dispatcher.data().get_node(&id, 0)?;
    assert_eq!(node.status, Status::Failed);
    assert!(node.error.unwrap_or_default().contains("no scratch space"));
    assert_eq!(fake.calls_to("one"), 0);
    assert_eq!(fake.calls_to("teardown"), 0);
    Ok(())
}

#[tokio::test]
async fn executor_ready_signal_marks_the_job_running() -> TestResult {
    init_tracing();
    let ctl = Arc::new(ControllableExecutor::default());
    let dispatcher = dispatcher_with(ctl.clone(), StoreMode::Stateless);
    let mut updates = dispatcher.subscribe();

    let lattice = LatticeBuilder::new("queued").task("a", "slow").output("a").build();
    let id = dispatcher.submit(lattice)?;
    dispatcher.start(&id)?;
    assert_eq!(with_timeout(ctl.next_started()).await, (id.clone(), 0));

    let first = with_timeout(updates.recv()).await?;
    assert_eq!((first.node_id, first.status), (0, Status::Running));

    assert!(ctl.mark_ready(&id, 0));
    let second = with_timeout(updates.recv()).await?;
    assert_eq!((second.node_id, second.status), (0, Status::Running));
    assert_eq!(dispatcher.data().get_job(&id, 0)?.status, Some(Status::Running));

    assert!(ctl.complete(&id, 0, json!("done")));
    assert_eq!(with_timeout(dispatcher.wait(&id)).await?, Status::Completed);
    let last = with_timeout(updates.recv()).await?;
    assert_eq!((last.node_id, last.status), (0, Status::Completed));
    Ok(())
}
