// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;

use crate::types::StoreMode;

/// Dispatcher configuration as read from a TOML file.
///
/// ```toml
/// [dispatcher]
/// stateless = true
/// event_buffer = 64
///
/// [store]
/// kind = "file"
/// path = ".latticed/results"
///
/// [executor]
/// default = "local"
/// shell = "sh"
/// ```
///
/// All sections are optional and have reasonable defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default)]
    pub dispatcher: DispatcherSection,

    #[serde(default)]
    pub store: StoreSection,

    #[serde(default)]
    pub executor: ExecutorSection,
}

/// `[dispatcher]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherSection {
    /// Read-through/write-through graph access (`true`) or an in-memory
    /// graph cache per live dispatch (`false`).
    #[serde(default = "default_stateless")]
    pub stateless: bool,

    /// Capacity of each dispatch loop's event channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_stateless() -> bool {
    true
}

fn default_event_buffer() -> usize {
    64
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            stateless: default_stateless(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl DispatcherSection {
    pub fn store_mode(&self) -> StoreMode {
        if self.stateless {
            StoreMode::Stateless
        } else {
            StoreMode::Cached
        }
    }
}

/// Where dispatch records live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    /// One JSON document per dispatch under `path`.
    File,
}

/// `[store]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    #[serde(default)]
    pub kind: StoreKind,

    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".latticed/results")
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            path: default_store_path(),
        }
    }
}

/// `[executor]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSection {
    /// Executor for `function` electrons that do not name one.
    #[serde(default = "default_executor")]
    pub default: String,

    /// Shell binary used by the `shell` executor.
    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_executor() -> String {
    "local".to_string()
}

fn default_shell() -> String {
    "sh".to_string()
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            default: default_executor(),
            shell: default_shell(),
        }
    }
}

/// A lattice definition file.
///
/// ```toml
/// name = "pipeline"
///
/// [parameter.x]
/// value = 3
///
/// [electron.double]
/// cmd = "echo $((2 * $(echo $LATTICED_ARGS | tr -d '[]')))"
/// args = ["x"]
///
/// [electron.total]
/// function = "sum"
/// args = ["x", "double"]
///
/// [output]
/// nodes = ["total"]
/// ```
///
/// Parameters and electrons share one namespace; `args`, `kwargs` and
/// `after` refer to either by name.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LatticeFile {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub parameter: BTreeMap<String, ParameterConfig>,

    #[serde(default)]
    pub electron: BTreeMap<String, ElectronConfig>,

    #[serde(default)]
    pub output: OutputConfig,
}

/// `[parameter.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ParameterConfig {
    pub value: Value,
}

/// Built-in collector electrons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectKind {
    /// Positional inputs packed into an array.
    List,
    /// Keyword inputs packed into an object.
    Dict,
}

/// `[electron.<name>]` section.
///
/// Exactly one of `cmd`, `function` or `collect` must be set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ElectronConfig {
    /// Shell command; runs on the `shell` executor unless `executor` says
    /// otherwise.
    #[serde(default)]
    pub cmd: Option<String>,

    /// Name of a registered function.
    #[serde(default)]
    pub function: Option<String>,

    #[serde(default)]
    pub collect: Option<CollectKind>,

    #[serde(default)]
    pub executor: Option<String>,

    /// Positional inputs, by node name.
    #[serde(default)]
    pub args: Vec<String>,

    /// Keyword inputs: keyword -> node name.
    #[serde(default)]
    pub kwargs: BTreeMap<String, String>,

    /// Ordering-only dependencies.
    #[serde(default)]
    pub after: Vec<String>,

    /// The task's output is a lattice manifest to run as a sub-dispatch.
    #[serde(default)]
    pub sublattice: bool,

    /// Functions run before/after the main callable on the same executor.
    #[serde(default)]
    pub call_before: Vec<String>,

    #[serde(default)]
    pub call_after: Vec<String>,
}

impl ElectronConfig {
    /// Every node name this electron depends on.
    pub fn references(&self) -> impl Iterator<Item = &String> {
        self.args
            .iter()
            .chain(self.kwargs.values())
            .chain(self.after.iter())
    }
}

/// `[output]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputConfig {
    /// A single name yields that node's output; several yield an object
    /// keyed by name.
    #[serde(default)]
    pub nodes: Vec<String>,
}
