// src/engine/mod.rs

//! Dispatch scheduling engine.
//!
//! One scheduler loop runs per live dispatch. The pure, synchronous state
//! machine lives in [`core`] (with its per-event logic in
//! [`event_handlers`]); the async shell that talks to the data layer and
//! spawns task runners is [`runtime`]. [`dispatcher`] is the facade the
//! service layer (and the CLI) drives, and [`postprocess`] assembles the
//! final dispatch result.

use crate::dag::{DispatchId, NodeId};
use crate::types::Status;

/// Status update of one node, as delivered to its dispatch's loop.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeEvent {
    pub node_id: NodeId,
    pub status: Status,
    /// Child dispatch, when `status` is `Dispatching`.
    pub sub_dispatch_id: Option<DispatchId>,
}

/// Messages consumed by a dispatch loop.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    NodeUpdated(NodeEvent),
    /// The whole dispatch is being cancelled.
    CancelRequested,
    /// A result could not be recorded; the loop cannot make progress.
    Fault(String),
}

/// Node status change broadcast to subscribers of a [`Dispatcher`].
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub dispatch_id: DispatchId,
    pub node_id: NodeId,
    pub status: Status,
}

pub mod core;
pub mod dispatcher;
pub mod event_handlers;
pub mod postprocess;
pub mod runtime;

pub use core::{CoreEvent, DispatchCore};
pub use dispatcher::{Dispatcher, DispatcherSettings};
pub use event_handlers::{CoreCommand, CoreStep, FinalOutcome};
pub use runtime::DispatchRuntime;
