// src/logging.rs

//! Tracing setup for the `latticed` binary.
//!
//! The filter is built from, in order of precedence:
//! 1. `--log-level`, applied to the `latticed` target only;
//! 2. `LATTICED_LOG`, either a bare level or full `EnvFilter` directives
//!    such as `latticed::engine=debug,latticed::exec=trace`;
//! 3. `latticed=info`.
//!
//! Dependencies are held at `warn`. Output goes to stderr so the dispatch
//! result on stdout stays machine readable.

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

use crate::cli::LogLevel;

const ENV_VAR: &str = "LATTICED_LOG";
const DEFAULT_DIRECTIVES: &str = "warn,latticed=info";

pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    let directives = directives(cli_level, std::env::var(ENV_VAR).ok().as_deref());
    let filter = EnvFilter::try_new(&directives)
        .with_context(|| format!("invalid log filter {directives:?}"))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("installing tracing subscriber: {e}"))?;
    Ok(())
}

fn directives(cli_level: Option<LogLevel>, env: Option<&str>) -> String {
    if let Some(level) = cli_level {
        return format!("warn,latticed={}", level_name(level));
    }
    match env.map(str::trim).filter(|s| !s.is_empty()) {
        // A bare level scopes to this crate; anything else is taken verbatim.
        Some(raw) if is_level(raw) => format!("warn,latticed={}", raw.to_lowercase()),
        Some(raw) => raw.to_string(),
        None => DEFAULT_DIRECTIVES.to_string(),
    }
}

fn level_name(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    }
}

fn is_level(s: &str) -> bool {
    matches!(
        s.to_lowercase().as_str(),
        "error" | "warn" | "info" | "debug" | "trace"
    )
}
