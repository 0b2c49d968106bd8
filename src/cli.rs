// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, Subcommand, ValueEnum};

/// Command-line arguments for `latticed`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "latticed",
    version,
    about = "Dispatch DAG workflows (lattices) of tasks and track their results.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the dispatcher config file (TOML).
    ///
    /// If the file does not exist, built-in defaults are used.
    #[arg(long, value_name = "PATH", default_value = "Latticed.toml")]
    pub config: String,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `LATTICED_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Submit a lattice file, run it to completion and print the result.
    Run {
        /// Path to the lattice definition (TOML).
        #[arg(value_name = "LATTICE")]
        lattice: String,
    },
    /// Parse + validate a lattice file and print its graph without running it.
    Check {
        #[arg(value_name = "LATTICE")]
        lattice: String,
    },
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
