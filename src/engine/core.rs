// src/engine/core.rs

//! Pure per-dispatch scheduling state machine.
//!
//! [`DispatchCore`] consumes [`CoreEvent`]s and returns [`CoreStep`]s
//! describing what the IO shell (`engine::runtime`) should do next. It has
//! no channels, no Tokio types and performs no IO, so it is unit tested
//! directly.

use std::collections::BTreeSet;

use crate::dag::{DispatchId, NodeId, TransportGraph};
use crate::engine::event_handlers::{
    CoreStep, FinalOutcome, handle_cancel_requested, handle_node_dispatching,
    handle_node_finished, handle_start,
};
use crate::types::Status;

/// Input to the core, already enriched by the shell with the unresolved
/// count after the atomic decrement.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    NodeFinished {
        node_id: NodeId,
        status: Status,
        remaining: usize,
    },
    NodeDispatching {
        node_id: NodeId,
        sub_dispatch_id: DispatchId,
    },
    CancelRequested,
}

/// Mutable scheduling state of one dispatch.
#[derive(Debug, Clone)]
pub struct DispatchState {
    pub(crate) successors: Vec<Vec<NodeId>>,
    /// Distinct parents not yet `Completed`, per node.
    pub(crate) pending_parents: Vec<usize>,
    pub(crate) status: Vec<Status>,
    /// Nodes handed to a runner or waiting on a child dispatch.
    pub(crate) in_flight: BTreeSet<NodeId>,
    pub(crate) outcome: FinalOutcome,
    pub(crate) finished: bool,
}

#[derive(Debug)]
pub struct DispatchCore {
    state: DispatchState,
    /// Already-expanded sublattice nodes to resume on start.
    children: Vec<(NodeId, DispatchId)>,
}

impl DispatchCore {
    /// Build the core from a dispatch's graph with its persisted node states.
    ///
    /// Completed nodes (including reused ones) count as satisfied parents;
    /// failed or cancelled nodes halt the dispatch from the start.
    pub fn from_graph(graph: &TransportGraph) -> Self {
        let n = graph.len();
        let status: Vec<Status> = graph.nodes.iter().map(|node| node.status).collect();

        let mut successors = Vec::with_capacity(n);
        let mut pending_parents = Vec::with_capacity(n);
        for id in 0..n {
            successors.push(graph.successors(id));
            let pending = graph
                .predecessors(id)
                .into_iter()
                .filter(|p| status[*p] != Status::Completed)
                .count();
            pending_parents.push(pending);
        }

        let mut outcome = FinalOutcome::default();
        let mut children = Vec::new();
        for node in &graph.nodes {
            match node.status {
                Status::Failed | Status::PostprocessingFailed => outcome.any_failed = true,
                Status::Cancelled => outcome.any_cancelled = true,
                Status::Dispatching => {
                    if let Some(sub) = &node.sub_dispatch_id {
                        children.push((node.node_id, sub.clone()));
                    }
                }
                _ => {}
            }
        }

        Self {
            state: DispatchState {
                successors,
                pending_parents,
                status,
                in_flight: BTreeSet::new(),
                outcome,
                finished: false,
            },
            children,
        }
    }

    /// Initial step: ready nodes and resumed children. `unresolved` is the
    /// persisted unresolved count.
    pub fn start(&mut self, unresolved: usize) -> CoreStep {
        let children = std::mem::take(&mut self.children);
        handle_start(&mut self.state, unresolved, children)
    }

    /// Handle a single event, updating state and returning the resulting
    /// commands for the IO shell.
    pub fn step(&mut self, event: CoreEvent) -> CoreStep {
        match event {
            CoreEvent::NodeFinished {
                node_id,
                status,
                remaining,
            } => handle_node_finished(&mut self.state, node_id, status, remaining),
            CoreEvent::NodeDispatching {
                node_id,
                sub_dispatch_id,
            } => handle_node_dispatching(&mut self.state, node_id, sub_dispatch_id),
            CoreEvent::CancelRequested => handle_cancel_requested(&mut self.state),
        }
    }

    pub fn in_flight(&self) -> Vec<NodeId> {
        self.state.in_flight.iter().copied().collect()
    }

    pub fn status_of(&self, node_id: NodeId) -> Option<Status> {
        self.state.status.get(node_id).copied()
    }

    pub fn is_finished(&self) -> bool {
        self.state.finished
    }
}
