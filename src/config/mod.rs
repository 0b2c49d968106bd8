// src/config/mod.rs

//! Configuration loading and validation for latticed.
//!
//! Two kinds of TOML file are handled here: the dispatcher config
//! (`[dispatcher]`, `[store]`, `[executor]`) and lattice definition files
//! (`[parameter.<name>]`, `[electron.<name>]`, `[output]`), which are built
//! into a [`Lattice`](crate::dag::Lattice).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{build_lattice, load_and_validate, load_from_path, load_lattice, load_or_default};
pub use model::{
    DispatcherConfig, DispatcherSection, ElectronConfig, ExecutorSection, LatticeFile, StoreKind,
    StoreSection,
};
pub use validate::{validate_config, validate_lattice_file};
