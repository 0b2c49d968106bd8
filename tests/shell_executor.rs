#![cfg(unix)]

mod common;
use crate::common::{init_tracing, with_timeout};

use std::error::Error;
use std::io::Write;
use std::time::Duration;

use serde_json::json;

use latticed::config::{DispatcherConfig, load_lattice};
use latticed::default_executors;
use latticed::engine::Dispatcher;
use latticed::types::Status;

type TestResult = Result<(), Box<dyn Error>>;

fn lattice_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp lattice file");
    file.write_all(contents.as_bytes()).expect("write lattice");
    file
}

fn dispatcher(cfg: &DispatcherConfig) -> Dispatcher {
    Dispatcher::from_config(cfg, default_executors(cfg))
}

#[tokio::test]
async fn shell_and_local_electrons_exchange_json() -> TestResult {
    init_tracing();
    let cfg = DispatcherConfig::default();
    let file = lattice_file(
        r#"
        name = "mixed"

        [parameter.x]
        value = 20

        [electron.echo_args]
        cmd = 'echo "progress"; echo "$LATTICED_ARGS"'
        args = ["x"]

        [electron.count]
        function = "len"
        args = ["echo_args"]

        [output]
        nodes = ["echo_args", "count"]
        "#,
    );
    let lattice = load_lattice(file.path(), &cfg.executor)?;

    let dispatcher = dispatcher(&cfg);
    let id = dispatcher.submit(lattice)?;
    assert_eq!(with_timeout(dispatcher.run(&id)).await?, Status::Completed);
    assert_eq!(
        dispatcher.get_dispatch(&id)?.result,
        Some(json!({"echo_args": [20], "count": 1}))
    );

    // Parameters come first, then electrons by name: count = 1, echo_args = 2.
    let node = dispatcher.data().get_node(&id, 2)?;
    assert!(node.stdout.unwrap_or_default().starts_with("progress"));
    Ok(())
}

#[tokio::test]
async fn non_zero_exit_fails_the_node() -> TestResult {
    init_tracing();
    let cfg = DispatcherConfig::default();
    let file = lattice_file(
        r#"
        [electron.bad]
        cmd = "echo oops >&2; exit 3"
        "#,
    );
    let dispatcher = dispatcher(&cfg);
    let id = dispatcher.submit(load_lattice(file.path(), &cfg.executor)?)?;
    assert_eq!(with_timeout(dispatcher.run(&id)).await?, Status::Failed);

    let error = dispatcher.data().get_node(&id, 0)?.error.unwrap_or_default();
    assert!(error.contains("code 3"), "{error}");
    assert!(error.contains("oops"), "{error}");
    Ok(())
}

#[tokio::test]
async fn cancelling_kills_a_running_command() -> TestResult {
    init_tracing();
    let cfg = DispatcherConfig::default();
    let file = lattice_file(
        r#"
        [electron.sleepy]
        cmd = "sleep 30"
        "#,
    );
    let dispatcher = dispatcher(&cfg);
    let id = dispatcher.submit(load_lattice(file.path(), &cfg.executor)?)?;
    dispatcher.start(&id)?;

    with_timeout(async {
        loop {
            if let Ok(job) = dispatcher.data().get_job(&id, 0) {
                if job.job_handle.is_some() {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;

    dispatcher.cancel(&id, None).await?;
    assert_eq!(with_timeout(dispatcher.wait(&id)).await?, Status::Cancelled);
    assert_eq!(dispatcher.data().get_node(&id, 0)?.status, Status::Cancelled);
    Ok(())
}

#[tokio::test]
async fn command_hooks_run_around_the_command() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let log = dir.path().join("order.log");
    let log = log.display();
    let cfg = DispatcherConfig::default();
    let file = lattice_file(&format!(
        r#"
        [electron.step]
        cmd = "echo main >> {log}; echo 1"
        call_before = ["echo before >> {log}"]
        call_after = ["echo after >> {log}"]

        [output]
        nodes = ["step"]
        "#
    ));
    let lattice = load_lattice(file.path(), &cfg.executor)?;

    let dispatcher = dispatcher(&cfg);
    let id = dispatcher.submit(lattice)?;
    assert_eq!(with_timeout(dispatcher.run(&id)).await?, Status::Completed);
    assert_eq!(dispatcher.get_dispatch(&id)?.result, Some(json!(1)));

    let order = std::fs::read_to_string(dir.path().join("order.log"))?;
    assert_eq!(order.lines().collect::<Vec<_>>(), vec!["before", "main", "after"]);
    Ok(())
}

#[tokio::test]
async fn failing_command_hook_fails_the_node() -> TestResult {
    init_tracing();
    let cfg = DispatcherConfig::default();
    let file = lattice_file(
        r#"
        [electron.step]
        cmd = "echo 1"
        call_before = ["true"]
        call_after = ["exit 4"]

        [output]
        nodes = ["step"]
        "#,
    );
    let lattice = load_lattice(file.path(), &cfg.executor)?;

    let dispatcher = dispatcher(&cfg);
    let id = dispatcher.submit(lattice)?;
    assert_eq!(with_timeout(dispatcher.run(&id)).await?, Status::Failed);

    let node = dispatcher.data().get_node(&id, 0)?;
    assert_eq!(node.status, Status::Failed);
    assert!(node.error.unwrap_or_default().contains("code 4"));
    Ok(())
}
