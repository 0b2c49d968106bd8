// src/config/validate.rs

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::model::{DispatcherConfig, LatticeFile};
use crate::errors::{DispatchError, Result};

pub fn validate_config(cfg: &DispatcherConfig) -> Result<()> {
    if cfg.dispatcher.event_buffer == 0 {
        return Err(DispatchError::Config(
            "[dispatcher].event_buffer must be >= 1 (got 0)".to_string(),
        ));
    }
    if cfg.executor.default.trim().is_empty() {
        return Err(DispatchError::Config(
            "[executor].default must name an executor".to_string(),
        ));
    }
    if cfg.executor.shell.trim().is_empty() {
        return Err(DispatchError::Config(
            "[executor].shell must not be empty".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_lattice_file(file: &LatticeFile) -> Result<()> {
    ensure_has_electrons(file)?;
    validate_names(file)?;
    validate_electrons(file)?;
    validate_references(file)?;
    validate_dag(file)?;
    Ok(())
}

fn ensure_has_electrons(file: &LatticeFile) -> Result<()> {
    if file.electron.is_empty() && file.parameter.is_empty() {
        return Err(DispatchError::Config(
            "lattice must contain at least one [electron.<name>] or [parameter.<name>] section"
                .to_string(),
        ));
    }
    Ok(())
}

fn validate_names(file: &LatticeFile) -> Result<()> {
    for name in file.electron.keys() {
        if file.parameter.contains_key(name) {
            return Err(DispatchError::Config(format!(
                "'{name}' is defined both as a parameter and as an electron"
            )));
        }
    }
    Ok(())
}

fn validate_electrons(file: &LatticeFile) -> Result<()> {
    for (name, electron) in &file.electron {
        let sources = [
            electron.cmd.is_some(),
            electron.function.is_some(),
            electron.collect.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count();
        if sources != 1 {
            return Err(DispatchError::Config(format!(
                "electron '{name}' must set exactly one of `cmd`, `function` or `collect`"
            )));
        }
        if electron.collect.is_some() && electron.sublattice {
            return Err(DispatchError::Config(format!(
                "electron '{name}' cannot be both a collector and a sublattice"
            )));
        }
    }
    Ok(())
}

fn validate_references(file: &LatticeFile) -> Result<()> {
    let known = |n: &str| file.electron.contains_key(n) || file.parameter.contains_key(n);

    for (name, electron) in &file.electron {
        for dep in electron.references() {
            if dep == name {
                return Err(DispatchError::Config(format!(
                    "electron '{name}' cannot depend on itself"
                )));
            }
            if !known(dep) {
                return Err(DispatchError::Config(format!(
                    "electron '{name}' refers to unknown node '{dep}'"
                )));
            }
        }
    }
    for out in &file.output.nodes {
        if !known(out) {
            return Err(DispatchError::Config(format!(
                "[output] refers to unknown node '{out}'"
            )));
        }
    }
    Ok(())
}

fn validate_dag(file: &LatticeFile) -> Result<()> {
    // Edge direction: dependency -> dependent.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for name in file.parameter.keys().chain(file.electron.keys()) {
        graph.add_node(name.as_str());
    }
    for (name, electron) in &file.electron {
        for dep in electron.references() {
            graph.add_edge(dep.as_str(), name.as_str(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(_) => Ok(()),
        Err(cycle) => Err(DispatchError::InvalidGraph(format!(
            "cycle detected in lattice involving '{}'",
            cycle.node_id()
        ))),
    }
}
