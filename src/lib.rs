// src/lib.rs

pub mod cli;
pub mod config;
pub mod dag;
pub mod data;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod fs;
pub mod logging;
pub mod types;

use std::sync::Arc;

use anyhow::{Result, bail};
use tracing::{debug, info, warn};

use crate::cli::{CliArgs, Command};
use crate::config::loader::{load_lattice, load_or_default};
use crate::config::model::DispatcherConfig;
use crate::dag::{Lattice, NodeKind};
use crate::engine::Dispatcher;
use crate::exec::{ExecutorRegistry, LocalExecutor, ShellExecutor, builtin_functions};
use crate::types::Status;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - dispatcher config loading
/// - the executor registry (`local` builtins, `shell`)
/// - lattice loading, submission and the run itself
/// - Ctrl-C handling (cancels the running dispatch)
pub async fn run(args: CliArgs) -> Result<()> {
    let cfg = load_or_default(&args.config)?;

    match &args.command {
        Command::Check { lattice } => {
            let lattice = load_lattice(lattice, &cfg.executor)?;
            print_check(&lattice);
            Ok(())
        }
        Command::Run { lattice } => {
            let lattice = load_lattice(lattice, &cfg.executor)?;
            run_lattice(&cfg, lattice).await
        }
    }
}

/// Executors every dispatcher built from a config gets.
pub fn default_executors(cfg: &DispatcherConfig) -> ExecutorRegistry {
    ExecutorRegistry::new()
        .with("local", Arc::new(LocalExecutor::new(builtin_functions())))
        .with("shell", Arc::new(ShellExecutor::new(cfg.executor.shell.clone())))
}

async fn run_lattice(cfg: &DispatcherConfig, lattice: Lattice) -> Result<()> {
    let dispatcher = Dispatcher::from_config(cfg, default_executors(cfg));
    let dispatch_id = dispatcher.submit(lattice)?;
    info!(dispatch_id = %dispatch_id, "submitted dispatch");

    dispatcher.start(&dispatch_id)?;

    // Ctrl-C → cancel the dispatch and wait for it to settle.
    let status = tokio::select! {
        status = dispatcher.wait(&dispatch_id) => status?,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "failed to listen for Ctrl+C");
            }
            info!(dispatch_id = %dispatch_id, "interrupted; cancelling dispatch");
            dispatcher.cancel(&dispatch_id, None).await?;
            dispatcher.wait(&dispatch_id).await?
        }
    };

    let meta = dispatcher.get_dispatch(&dispatch_id)?;
    println!("dispatch {dispatch_id}: {status}");
    if let Some(result) = &meta.result {
        println!("{}", serde_json::to_string_pretty(result)?);
    }
    if let Some(error) = &meta.error {
        eprintln!("{error}");
    }
    debug!(dispatch_id = %dispatch_id, "run complete");

    if status != Status::Completed {
        bail!("dispatch {dispatch_id} finished with status {status}");
    }
    Ok(())
}

/// Print nodes, their inputs and the output template without running.
fn print_check(lattice: &Lattice) {
    println!("latticed check: {}", lattice.name);
    println!();
    println!("nodes ({}):", lattice.graph.len());
    for node in &lattice.graph.nodes {
        let kind = match &node.kind {
            NodeKind::Parameter { value } => format!("parameter = {value}"),
            NodeKind::Task => format!("task on '{}'", node.executor.name),
            NodeKind::Sublattice => format!("sublattice on '{}'", node.executor.name),
            NodeKind::ElectronList => "list collector".to_string(),
            NodeKind::ElectronDict => "dict collector".to_string(),
        };
        println!("  [{}] {} ({kind})", node.node_id, node.name);
        if let Some(function) = &node.function {
            println!("      callable: {} {}", function.name, function.body);
        }
        for edge in lattice.graph.incoming_edges(node.node_id) {
            println!("      <- [{}] as {:?}", edge.source, edge.binding);
        }
    }
    println!();
    println!("output: {:?}", lattice.output);
    debug!("check complete (no execution)");
}
