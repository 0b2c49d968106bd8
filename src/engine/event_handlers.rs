// src/engine/event_handlers.rs

//! Event handling logic for the dispatch core.

use tracing::{debug, warn};

use crate::dag::{DispatchId, NodeId};
use crate::engine::core::DispatchState;
use crate::types::Status;

/// Command produced by the pure core, to be executed by the IO shell.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreCommand {
    /// Mark these nodes running and hand them to the task runner.
    RunNodes(Vec<NodeId>),
    /// Start the child dispatch of an expanded sublattice node.
    StartSubDispatch {
        node_id: NodeId,
        sub_dispatch_id: DispatchId,
    },
    /// Nothing more will run; settle the dispatch status.
    Finalize(FinalOutcome),
}

/// Decision returned by the core after handling one event.
#[derive(Debug, Clone, PartialEq)]
pub struct CoreStep {
    pub commands: Vec<CoreCommand>,
    /// Whether the loop should keep consuming events.
    pub keep_running: bool,
}

impl CoreStep {
    fn idle() -> Self {
        Self {
            commands: Vec::new(),
            keep_running: true,
        }
    }
}

/// What the loop saw by the time it stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FinalOutcome {
    /// The whole dispatch was cancelled.
    pub cancel_requested: bool,
    pub any_failed: bool,
    pub any_cancelled: bool,
}

impl FinalOutcome {
    /// No new nodes are scheduled once this is true.
    pub fn halted(&self) -> bool {
        self.cancel_requested || self.any_failed || self.any_cancelled
    }

    /// Status the dispatch settles in, or `None` when post-processing
    /// decides it.
    pub fn forced_status(&self) -> Option<Status> {
        if self.cancel_requested {
            Some(Status::Cancelled)
        } else if self.any_failed {
            Some(Status::Failed)
        } else if self.any_cancelled {
            Some(Status::Cancelled)
        } else {
            None
        }
    }
}

/// Seed the loop: run every startable node, resume running children.
pub fn handle_start(
    state: &mut DispatchState,
    unresolved: usize,
    children: Vec<(NodeId, DispatchId)>,
) -> CoreStep {
    let mut commands = Vec::new();

    for (node_id, sub_dispatch_id) in children {
        state.in_flight.insert(node_id);
        commands.push(CoreCommand::StartSubDispatch {
            node_id,
            sub_dispatch_id,
        });
    }

    if !state.outcome.halted() {
        let ready: Vec<NodeId> = (0..state.status.len())
            .filter(|&id| {
                state.pending_parents[id] == 0
                    && matches!(state.status[id], Status::New | Status::Running)
            })
            .collect();
        if !ready.is_empty() {
            debug!(?ready, "initial ready set");
            state.in_flight.extend(ready.iter().copied());
            commands.push(CoreCommand::RunNodes(ready));
        }
    }

    let keep_running = !maybe_finalize(state, Some(unresolved), &mut commands);
    CoreStep {
        commands,
        keep_running,
    }
}

/// A node reached a terminal status; `remaining` is the unresolved count
/// after its decrement.
pub fn handle_node_finished(
    state: &mut DispatchState,
    node_id: NodeId,
    status: Status,
    remaining: usize,
) -> CoreStep {
    if state.finished {
        return CoreStep {
            commands: Vec::new(),
            keep_running: false,
        };
    }
    if node_id >= state.status.len() {
        warn!(node_id, "event for unknown node ignored");
        return CoreStep::idle();
    }

    state.status[node_id] = status;
    state.in_flight.remove(&node_id);

    let mut commands = Vec::new();
    match status {
        Status::Completed => {
            let mut ready = Vec::new();
            for &succ in &state.successors[node_id] {
                state.pending_parents[succ] = state.pending_parents[succ].saturating_sub(1);
                if state.pending_parents[succ] == 0
                    && state.status[succ] == Status::New
                    && !state.outcome.halted()
                {
                    ready.push(succ);
                }
            }
            if !ready.is_empty() {
                debug!(node_id, ?ready, "successors unblocked");
                state.in_flight.extend(ready.iter().copied());
                commands.push(CoreCommand::RunNodes(ready));
            }
        }
        Status::Failed | Status::PostprocessingFailed => state.outcome.any_failed = true,
        Status::Cancelled => state.outcome.any_cancelled = true,
        other => warn!(node_id, status = %other, "non-terminal status reported as finished"),
    }

    let keep_running = !maybe_finalize(state, Some(remaining), &mut commands);
    CoreStep {
        commands,
        keep_running,
    }
}

/// A sublattice node expanded into a child dispatch. The node stays
/// unresolved until the child reports back.
pub fn handle_node_dispatching(
    state: &mut DispatchState,
    node_id: NodeId,
    sub_dispatch_id: DispatchId,
) -> CoreStep {
    if state.finished || node_id >= state.status.len() {
        return CoreStep {
            commands: Vec::new(),
            keep_running: !state.finished,
        };
    }
    if state.status[node_id] == Status::Dispatching {
        debug!(node_id, "duplicate dispatching event ignored");
        return CoreStep::idle();
    }

    state.status[node_id] = Status::Dispatching;
    state.in_flight.insert(node_id);
    CoreStep {
        commands: vec![CoreCommand::StartSubDispatch {
            node_id,
            sub_dispatch_id,
        }],
        keep_running: true,
    }
}

pub fn handle_cancel_requested(state: &mut DispatchState) -> CoreStep {
    if state.finished {
        return CoreStep {
            commands: Vec::new(),
            keep_running: false,
        };
    }
    state.outcome.cancel_requested = true;

    let mut commands = Vec::new();
    let keep_running = !maybe_finalize(state, None, &mut commands);
    CoreStep {
        commands,
        keep_running,
    }
}

/// Push `Finalize` when every node is resolved, or when the dispatch is
/// halted and nothing is in flight. Returns whether it did.
fn maybe_finalize(
    state: &mut DispatchState,
    remaining: Option<usize>,
    commands: &mut Vec<CoreCommand>,
) -> bool {
    let all_resolved = remaining == Some(0);
    let drained = state.outcome.halted() && state.in_flight.is_empty();
    if !(all_resolved || drained) {
        return false;
    }
    state.finished = true;
    commands.push(CoreCommand::Finalize(state.outcome));
    true
}
