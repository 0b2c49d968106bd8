mod common;
use crate::common::{dispatcher_with, init_tracing, with_timeout};

use std::error::Error;
use std::sync::Arc;

use serde_json::json;

use latticed::dag::Lattice;
use latticed::types::{Status, StoreMode};
use latticed_test_utils::builders::LatticeBuilder;
use latticed_test_utils::fake_executor::{CancelBehaviour, ControllableExecutor};

type TestResult = Result<(), Box<dyn Error>>;

/// `a -> b`, both on the controllable executor.
fn two_step() -> Lattice {
    LatticeBuilder::new("two-step")
        .task("a", "slow")
        .task("b", "slow")
        .arg("a", "b", 0)
        .output("b")
        .build()
}

#[tokio::test]
async fn cancelling_a_dispatch_stops_running_and_pending_nodes() -> TestResult {
    init_tracing();
    let exec = Arc::new(ControllableExecutor::new(CancelBehaviour::Accept));
    let dispatcher = dispatcher_with(exec.clone(), StoreMode::Stateless);

    let id = dispatcher.submit(two_step())?;
    dispatcher.start(&id)?;
    assert_eq!(with_timeout(exec.next_started()).await, (id.clone(), 0));

    dispatcher.cancel(&id, None).await?;
    assert_eq!(with_timeout(dispatcher.wait(&id)).await?, Status::Cancelled);

    let nodes = dispatcher.data().get_nodes(&id)?;
    assert_eq!(nodes[0].status, Status::Cancelled);
    assert_eq!(nodes[1].status, Status::Cancelled);
    assert!(nodes[1].start_time.is_none(), "b never ran");
    assert_eq!(exec.executions(), 1);
    assert_eq!(exec.cancel_calls(), 1);
    assert!(dispatcher.data().get_job(&id, 1)?.cancel_requested);
    Ok(())
}

#[tokio::test]
async fn declined_cancel_leaves_node_running_until_it_finishes() -> TestResult {
    init_tracing();
    let exec = Arc::new(ControllableExecutor::new(CancelBehaviour::Decline));
    let dispatcher = dispatcher_with(exec.clone(), StoreMode::Stateless);

    let id = dispatcher.submit(two_step())?;
    dispatcher.start(&id)?;
    with_timeout(exec.next_started()).await;

    dispatcher.cancel(&id, None).await?;
    assert_eq!(dispatcher.data().get_node(&id, 0)?.status, Status::Running);
    assert_eq!(dispatcher.data().get_node(&id, 1)?.status, Status::Cancelled);
    assert_eq!(dispatcher.get_status(&id)?, Status::Running);

    assert!(exec.complete(&id, 0, json!(1)));
    assert_eq!(with_timeout(dispatcher.wait(&id)).await?, Status::Cancelled);
    assert_eq!(dispatcher.data().get_node(&id, 0)?.status, Status::Completed);
    assert_eq!(exec.executions(), 1);
    Ok(())
}

#[tokio::test]
async fn failing_cancel_hook_is_treated_as_declined() -> TestResult {
    init_tracing();
    let exec = Arc::new(ControllableExecutor::new(CancelBehaviour::Error));
    let dispatcher = dispatcher_with(exec.clone(), StoreMode::Cached);

    let id = dispatcher.submit(two_step())?;
    dispatcher.start(&id)?;
    with_timeout(exec.next_started()).await;

    dispatcher.cancel(&id, Some(vec![0])).await?;
    assert_eq!(dispatcher.data().get_node(&id, 0)?.status, Status::Running);

    assert!(exec.fail(&id, 0, "gave up"));
    assert_eq!(with_timeout(dispatcher.wait(&id)).await?, Status::Failed);
    Ok(())
}

#[tokio::test]
async fn cancelling_one_pending_node_halts_the_dispatch() -> TestResult {
    init_tracing();
    let exec = Arc::new(ControllableExecutor::default());
    let dispatcher = dispatcher_with(exec.clone(), StoreMode::Stateless);

    let id = dispatcher.submit(two_step())?;
    dispatcher.start(&id)?;
    with_timeout(exec.next_started()).await;

    dispatcher.cancel(&id, Some(vec![1])).await?;
    assert_eq!(dispatcher.data().get_node(&id, 1)?.status, Status::Cancelled);
    assert_eq!(dispatcher.data().get_node(&id, 0)?.status, Status::Running);

    assert!(exec.complete(&id, 0, json!(1)));
    assert_eq!(with_timeout(dispatcher.wait(&id)).await?, Status::Cancelled);
    assert_eq!(exec.executions(), 1);
    assert_eq!(exec.cancel_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn cancelled_before_start_never_runs() -> TestResult {
    init_tracing();
    let exec = Arc::new(ControllableExecutor::default());
    let dispatcher = dispatcher_with(exec.clone(), StoreMode::Stateless);

    let id = dispatcher.submit(two_step())?;
    dispatcher.cancel(&id, None).await?;
    assert_eq!(dispatcher.get_status(&id)?, Status::Cancelled);

    assert_eq!(with_timeout(dispatcher.run(&id)).await?, Status::Cancelled);
    assert_eq!(exec.executions(), 0);
    assert_eq!(dispatcher.get_incomplete_tasks(&id)?, vec![0, 1]);
    Ok(())
}

#[tokio::test]
async fn cancelling_a_finished_dispatch_changes_nothing() -> TestResult {
    init_tracing();
    let exec = Arc::new(ControllableExecutor::default());
    let dispatcher = dispatcher_with(exec.clone(), StoreMode::Stateless);

    let lattice = LatticeBuilder::new("single").task("a", "slow").output("a").build();
    let id = dispatcher.submit(lattice)?;
    dispatcher.start(&id)?;
    with_timeout(exec.next_started()).await;
    exec.complete(&id, 0, json!("done"));
    assert_eq!(with_timeout(dispatcher.wait(&id)).await?, Status::Completed);

    dispatcher.cancel(&id, None).await?;
    assert_eq!(dispatcher.get_status(&id)?, Status::Completed);
    assert_eq!(dispatcher.get_dispatch(&id)?.result, Some(json!("done")));
    Ok(())
}
