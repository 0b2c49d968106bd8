// src/errors.rs

//! Crate-wide error types.

use thiserror::Error;

use crate::dag::NodeId;
use crate::types::Status;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Dependency not ready: node {node_id} needs output of node {parent}")]
    DependencyNotReady { node_id: NodeId, parent: NodeId },

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Invalid status transition for node {node_id}: {from} -> {to}")]
    InvalidStatusTransition {
        node_id: NodeId,
        from: Status,
        to: Status,
    },

    #[error("Invalid status transition for dispatch {dispatch_id}: {from} -> {to}")]
    InvalidDispatchTransition {
        dispatch_id: String,
        from: Status,
        to: Status,
    },

    #[error("Post-processing failed: {0}")]
    PostProcessing(String),

    #[error("Graph diff error: {0}")]
    GraphDiff(String),

    #[error("Dispatch not found: {0}")]
    DispatchNotFound(String),

    #[error("Node {node_id} not found in dispatch {dispatch_id}")]
    NodeNotFound {
        dispatch_id: String,
        node_id: NodeId,
    },

    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failures while acquiring or driving an executor.
///
/// The task runner converts every one of these into a `FAILED` (or, for
/// `Cancelled`, a `CANCELLED`) node result; they never reach the scheduler
/// loop as faults.
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("no executor registered under '{0}'")]
    NotFound(String),

    #[error("failed to acquire executor '{name}': {reason}")]
    Acquisition { name: String, reason: String },

    #[error("task raised an error:\n{0}")]
    TaskRuntime(String),

    #[error("task was cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, DispatchError>;
