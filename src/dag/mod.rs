// src/dag/mod.rs

//! Task graph representation, the per-dispatch graph store and the
//! graph diff engine.
//!
//! - [`node`] holds the node model (kinds, callables, executor specs,
//!   per-node runtime attributes) and node results.
//! - [`graph`] holds the transport graph (nodes + argument-binding edges)
//!   and the lattice that wraps it.
//! - [`store`] is the concurrent, write-through per-dispatch graph store.
//! - [`diff`] decides which nodes of a new graph can reuse results from an
//!   old one.

pub mod diff;
pub mod graph;
pub mod node;
pub mod store;

/// Canonical node id type: the node's index in graph-construction order.
pub type NodeId = usize;

/// Canonical dispatch id type (UUID v4 text).
pub type DispatchId = String;

pub use diff::GraphDiff;
pub use graph::{ArgBinding, Edge, Lattice, OutputTemplate, TransportGraph};
pub use node::{Callable, ElectronRef, ExecutorSpec, Node, NodeAttribute, NodeKind, NodeResult};
pub use store::GraphStore;
