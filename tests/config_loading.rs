use std::error::Error;
use std::fs;

use latticed::config::{
    ExecutorSection, StoreKind, load_and_validate, load_lattice, load_or_default,
};
use latticed::dag::{NodeKind, OutputTemplate};
use latticed::errors::DispatchError;
use latticed::types::StoreMode;

type TestResult = Result<(), Box<dyn Error>>;

#[test]
fn missing_config_file_falls_back_to_defaults() -> TestResult {
    let dir = tempfile::tempdir()?;
    let cfg = load_or_default(dir.path().join("Latticed.toml"))?;
    assert_eq!(cfg.dispatcher.event_buffer, 64);
    assert_eq!(cfg.dispatcher.store_mode(), StoreMode::Stateless);
    assert_eq!(cfg.store.kind, StoreKind::Memory);
    assert_eq!(cfg.executor.default, "local");
    Ok(())
}

#[test]
fn config_sections_are_read() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("Latticed.toml");
    fs::write(
        &path,
        r#"
        [dispatcher]
        stateless = false
        event_buffer = 8

        [store]
        kind = "file"
        path = "out"

        [executor]
        shell = "bash"
        "#,
    )?;
    let cfg = load_and_validate(&path)?;
    assert_eq!(cfg.dispatcher.store_mode(), StoreMode::Cached);
    assert_eq!(cfg.dispatcher.event_buffer, 8);
    assert_eq!(cfg.store.kind, StoreKind::File);
    assert_eq!(cfg.store.path, std::path::PathBuf::from("out"));
    assert_eq!(cfg.executor.shell, "bash");
    Ok(())
}

#[test]
fn invalid_config_values_are_rejected() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("Latticed.toml");

    fs::write(&path, "[dispatcher]\nevent_buffer = 0\n")?;
    assert!(matches!(load_and_validate(&path), Err(DispatchError::Config(_))));

    fs::write(&path, "[store]\nkind = \"postgres\"\n")?;
    assert!(matches!(load_and_validate(&path), Err(DispatchError::Toml(_))));

    fs::write(&path, "[dispatcher\n")?;
    assert!(matches!(load_and_validate(&path), Err(DispatchError::Toml(_))));
    Ok(())
}

#[test]
fn lattice_file_builds_graph_named_after_file() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("nightly.toml");
    fs::write(
        &path,
        r#"
        [parameter.items]
        value = [1, 2, 3]

        [electron.count]
        function = "len"
        args = ["items"]
        call_before = ["setup"]

        [electron.report]
        cmd = "echo done"
        after = ["count"]
        sublattice = true

        [electron.bundle]
        collect = "dict"
        kwargs = { n = "count" }

        [output]
        nodes = ["count", "bundle"]
        "#,
    )?;
    let lattice = load_lattice(&path, &ExecutorSection::default())?;

    assert_eq!(lattice.name, "nightly");
    let names: Vec<&str> = lattice.graph.nodes.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names, vec!["items", "bundle", "count", "report"]);
    assert_eq!(lattice.graph.nodes[1].kind, NodeKind::ElectronDict);
    assert_eq!(lattice.graph.nodes[2].call_before.len(), 1);
    assert_eq!(lattice.graph.nodes[3].kind, NodeKind::Sublattice);
    assert_eq!(lattice.graph.nodes[3].executor.name, "shell");
    assert!(matches!(lattice.output, OutputTemplate::Map(ref m) if m.len() == 2));
    Ok(())
}

#[test]
fn lattice_with_cycle_or_unknown_reference_is_rejected() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("bad.toml");

    fs::write(
        &path,
        r#"
        [electron.a]
        function = "identity"
        args = ["b"]

        [electron.b]
        function = "identity"
        args = ["a"]
        "#,
    )?;
    assert!(matches!(
        load_lattice(&path, &ExecutorSection::default()),
        Err(DispatchError::InvalidGraph(_))
    ));

    fs::write(
        &path,
        r#"
        [electron.a]
        function = "identity"

        [output]
        nodes = ["nope"]
        "#,
    )?;
    let err = load_lattice(&path, &ExecutorSection::default()).unwrap_err();
    assert!(err.to_string().contains("unknown node 'nope'"), "{err}");
    Ok(())
}
