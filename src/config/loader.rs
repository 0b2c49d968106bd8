// src/config/loader.rs

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::json;
use tracing::debug;

use crate::config::model::{CollectKind, DispatcherConfig, ExecutorSection, LatticeFile};
use crate::config::validate::{validate_config, validate_lattice_file};
use crate::dag::{
    ArgBinding, Callable, ExecutorSpec, Lattice, Node, NodeId, OutputTemplate, TransportGraph,
};
use crate::errors::{DispatchError, Result};

/// Load a dispatcher config file and return it without semantic checks.
///
/// Use [`load_and_validate`] for the checked variant.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<DispatcherConfig> {
    let contents = fs::read_to_string(path.as_ref())?;
    let config: DispatcherConfig = toml::from_str(&contents)?;
    Ok(config)
}

/// Load a dispatcher config file and run basic validation.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<DispatcherConfig> {
    let config = load_from_path(&path)?;
    validate_config(&config)?;
    Ok(config)
}

/// Like [`load_and_validate`], but a missing file yields the defaults.
pub fn load_or_default(path: impl AsRef<Path>) -> Result<DispatcherConfig> {
    let path = path.as_ref();
    if !path.exists() {
        debug!(path = %path.display(), "no dispatcher config; using defaults");
        return Ok(DispatcherConfig::default());
    }
    load_and_validate(path)
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("Latticed.toml")
}

/// Read, validate and build a lattice definition file.
pub fn load_lattice(path: impl AsRef<Path>, executors: &ExecutorSection) -> Result<Lattice> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;
    let file: LatticeFile = toml::from_str(&contents)?;
    validate_lattice_file(&file)?;

    let mut lattice = build_lattice(&file, executors)?;
    if file.name.is_none() {
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            lattice.name = stem.to_string();
        }
    }
    Ok(lattice)
}

/// Turn a validated lattice file into a [`Lattice`].
///
/// Parameters get the first node ids, then electrons, each group in name
/// order. `cmd` electrons default to the `shell` executor, `function`
/// electrons to `[executor].default`. Hooks follow the electron's flavour.
pub fn build_lattice(file: &LatticeFile, executors: &ExecutorSection) -> Result<Lattice> {
    let mut graph = TransportGraph::new();
    let mut ids: HashMap<&str, NodeId> = HashMap::new();

    for (name, param) in &file.parameter {
        let id = graph.add_node(Node::parameter(name.clone(), param.value.clone()));
        ids.insert(name.as_str(), id);
    }

    for (name, electron) in &file.electron {
        let node = match (electron.collect, &electron.cmd, &electron.function) {
            (Some(CollectKind::List), _, _) => Node::electron_list(name.clone()),
            (Some(CollectKind::Dict), _, _) => Node::electron_dict(name.clone()),
            (None, Some(cmd), _) => {
                let callable = Callable::new(name.clone(), json!({ "cmd": cmd }));
                let executor = electron.executor.clone().unwrap_or_else(|| "shell".to_string());
                task_or_sublattice(name, callable, electron.sublattice).with_executor(ExecutorSpec::new(executor))
            }
            (None, None, Some(function)) => {
                let executor = electron
                    .executor
                    .clone()
                    .unwrap_or_else(|| executors.default.clone());
                task_or_sublattice(name, Callable::named(function.clone()), electron.sublattice)
                    .with_executor(ExecutorSpec::new(executor))
            }
            (None, None, None) => {
                return Err(DispatchError::Config(format!(
                    "electron '{name}' has nothing to run"
                )));
            }
        };
        let is_cmd = electron.cmd.is_some();
        let node = node.with_hooks(
            electron.call_before.iter().map(|h| hook_callable(h, is_cmd)).collect(),
            electron.call_after.iter().map(|h| hook_callable(h, is_cmd)).collect(),
        );
        let id = graph.add_node(node);
        ids.insert(name.as_str(), id);
    }

    let lookup = |n: &str| {
        ids.get(n)
            .copied()
            .ok_or_else(|| DispatchError::Config(format!("unknown node '{n}'")))
    };

    for (name, electron) in &file.electron {
        let target = lookup(name)?;
        for (index, arg) in electron.args.iter().enumerate() {
            graph.add_edge(lookup(arg)?, target, ArgBinding::Positional(index));
        }
        for (key, source) in &electron.kwargs {
            graph.add_edge(lookup(source)?, target, ArgBinding::Keyword(key.clone()));
        }
        for dep in &electron.after {
            graph.add_edge(lookup(dep)?, target, ArgBinding::WaitFor);
        }
    }

    let output = match file.output.nodes.as_slice() {
        [] => OutputTemplate::default(),
        [single] => OutputTemplate::Node(lookup(single)?),
        many => {
            let mut map = BTreeMap::new();
            for name in many {
                map.insert(name.clone(), OutputTemplate::Node(lookup(name)?));
            }
            OutputTemplate::Map(map)
        }
    };

    let lattice = Lattice::new(
        file.name.clone().unwrap_or_else(|| "lattice".to_string()),
        graph,
        output,
    );
    lattice.validate()?;
    Ok(lattice)
}

/// Hooks of a `cmd` electron are shell commands; otherwise they name
/// functions on the electron's executor.
fn hook_callable(hook: &str, is_cmd: bool) -> Callable {
    if is_cmd {
        Callable::new(hook, json!({ "cmd": hook }))
    } else {
        Callable::named(hook)
    }
}

fn task_or_sublattice(name: &str, callable: Callable, sublattice: bool) -> Node {
    if sublattice {
        Node::sublattice(name, callable)
    } else {
        Node::task(name, callable)
    }
}
