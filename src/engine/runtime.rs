// src/engine/runtime.rs

use std::fmt;
use std::sync::Arc;

use anyhow::anyhow;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::dag::{DispatchId, GraphStore, NodeId, NodeResult, OutputTemplate};
use crate::data::DispatchMeta;
use crate::engine::core::{CoreEvent, DispatchCore};
use crate::engine::dispatcher::Dispatcher;
use crate::engine::event_handlers::{CoreCommand, CoreStep, FinalOutcome};
use crate::engine::postprocess::{self, Settlement};
use crate::engine::DispatchEvent;
use crate::errors::{DispatchError, Result};
use crate::exec::{JobSink, TaskMetadata, resolve_inputs};
use crate::types::Status;

/// Drives one dispatch: feeds node events into a [`DispatchCore`] and
/// carries out the commands it returns.
///
/// This is the IO shell around the core. It owns the dispatch's event
/// receiver, spawns a task per running node, starts child dispatches, and
/// persists the final status before reporting to a parent electron.
/// Executors reach it through their [`JobSink`] to report that a job has
/// started.
pub struct DispatchRuntime {
    dispatcher: Dispatcher,
    dispatch_id: DispatchId,
    event_rx: mpsc::Receiver<DispatchEvent>,
    status_tx: watch::Sender<Status>,
    ready_tx: mpsc::UnboundedSender<NodeId>,
    ready_rx: mpsc::UnboundedReceiver<NodeId>,
}

/// What woke the loop up.
enum Wake {
    Event(Option<DispatchEvent>),
    Ready(NodeId),
}

impl fmt::Debug for DispatchRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchRuntime")
            .field("dispatch_id", &self.dispatch_id)
            .finish_non_exhaustive()
    }
}

impl DispatchRuntime {
    pub(crate) fn new(
        dispatcher: Dispatcher,
        dispatch_id: DispatchId,
        event_rx: mpsc::Receiver<DispatchEvent>,
        status_tx: watch::Sender<Status>,
    ) -> Self {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        Self {
            dispatcher,
            dispatch_id,
            event_rx,
            status_tx,
            ready_tx,
            ready_rx,
        }
    }

    /// Run the dispatch to its final status.
    ///
    /// Bookkeeping failures abort the loop; the dispatch is then recorded as
    /// `FAILED` on a best-effort basis.
    pub async fn run(mut self) -> Status {
        info!(dispatch_id = %self.dispatch_id, "dispatch loop started");

        let settled = match self.drive().await {
            Ok(s) => s,
            Err(e) => {
                error!(dispatch_id = %self.dispatch_id, error = %e, "dispatch loop aborted");
                let s = Settlement {
                    status: Status::Failed,
                    result: None,
                    error: Some(format!("dispatch loop aborted: {e}")),
                };
                if let Err(write_err) = self.dispatcher.data().persist_dispatch_result(
                    &self.dispatch_id,
                    s.status,
                    None,
                    s.error.clone(),
                ) {
                    error!(dispatch_id = %self.dispatch_id, error = %write_err, "could not record dispatch failure");
                }
                s
            }
        };

        self.finish(&settled).await;
        info!(dispatch_id = %self.dispatch_id, status = %settled.status, "dispatch loop finished");
        settled.status
    }

    async fn drive(&mut self) -> Result<Settlement> {
        let data = self.dispatcher.data().clone();
        let graph = data.graph(&self.dispatch_id)?;
        let lattice = data.export_manifest(&self.dispatch_id)?;
        let mut core = DispatchCore::from_graph(&lattice.graph);

        let step = core.start(graph.unresolved_count()?);
        if let Some(outcome) = self.execute(step, &graph)? {
            return self.settle(outcome, &lattice.output, &graph);
        }

        loop {
            let wake = tokio::select! {
                event = self.event_rx.recv() => Wake::Event(event),
                Some(node_id) = self.ready_rx.recv() => Wake::Ready(node_id),
            };
            let event = match wake {
                Wake::Event(Some(event)) => event,
                Wake::Event(None) => break,
                Wake::Ready(node_id) => {
                    self.node_ready(node_id);
                    continue;
                }
            };
            debug!(dispatch_id = %self.dispatch_id, ?event, "dispatch loop received event");

            let core_event = match event {
                DispatchEvent::NodeUpdated(ev) if ev.status.is_terminal() => {
                    let remaining = graph.decrement_unresolved()?;
                    CoreEvent::NodeFinished {
                        node_id: ev.node_id,
                        status: ev.status,
                        remaining,
                    }
                }
                DispatchEvent::NodeUpdated(ev) if ev.status == Status::Dispatching => {
                    match ev.sub_dispatch_id {
                        Some(sub_dispatch_id) => CoreEvent::NodeDispatching {
                            node_id: ev.node_id,
                            sub_dispatch_id,
                        },
                        None => {
                            warn!(dispatch_id = %self.dispatch_id, node_id = ev.node_id, "dispatching event without child dispatch");
                            continue;
                        }
                    }
                }
                DispatchEvent::NodeUpdated(_) => continue,
                DispatchEvent::CancelRequested => CoreEvent::CancelRequested,
                DispatchEvent::Fault(reason) => {
                    return Err(DispatchError::Other(anyhow!(reason)));
                }
            };

            let step = core.step(core_event);
            if let Some(outcome) = self.execute(step, &graph)? {
                return self.settle(outcome, &lattice.output, &graph);
            }
        }

        Err(DispatchError::Other(anyhow!(
            "event channel closed before the dispatch finished"
        )))
    }

    /// Carry out the commands of one core step. Returns the outcome when the
    /// core asked to finalize.
    fn execute(&self, step: CoreStep, graph: &Arc<GraphStore>) -> Result<Option<FinalOutcome>> {
        for command in step.commands {
            match command {
                CoreCommand::RunNodes(ids) => {
                    for node_id in ids {
                        self.launch(node_id, graph)?;
                    }
                }
                CoreCommand::StartSubDispatch {
                    node_id,
                    sub_dispatch_id,
                } => self.start_child(node_id, &sub_dispatch_id),
                CoreCommand::Finalize(outcome) => return Ok(Some(outcome)),
            }
        }
        if !step.keep_running {
            warn!(dispatch_id = %self.dispatch_id, "core stopped without finalizing");
            return Ok(Some(FinalOutcome {
                any_failed: true,
                ..FinalOutcome::default()
            }));
        }
        Ok(None)
    }

    /// An executor reported that the job of `node_id` started. Re-stamps
    /// the node as running; a node that already finished is left alone.
    fn node_ready(&self, node_id: NodeId) {
        let data = self.dispatcher.data();
        if let Err(e) = data.update_job(&self.dispatch_id, node_id, &mut |job| {
            job.status = Some(Status::Running);
        }) {
            warn!(dispatch_id = %self.dispatch_id, node_id, error = %e, "could not record job start");
        }
        match self.dispatcher.mark_running(&self.dispatch_id, node_id) {
            Ok(_) => debug!(dispatch_id = %self.dispatch_id, node_id, "executor reported job running"),
            Err(DispatchError::InvalidStatusTransition { from, .. }) => {
                debug!(dispatch_id = %self.dispatch_id, node_id, status = %from, "late ready signal ignored");
            }
            Err(e) => warn!(dispatch_id = %self.dispatch_id, node_id, error = %e, "could not mark node running"),
        }
    }

    /// Mark a node running and hand it to a task runner on its own task.
    fn launch(&self, node_id: NodeId, graph: &Arc<GraphStore>) -> Result<()> {
        let node = match self.dispatcher.mark_running(&self.dispatch_id, node_id) {
            Ok(node) => node,
            Err(DispatchError::InvalidStatusTransition { from, .. }) => {
                debug!(dispatch_id = %self.dispatch_id, node_id, status = %from, "node no longer startable; skipping");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let dispatcher = self.dispatcher.clone();
        let dispatch_id = self.dispatch_id.clone();
        let graph = graph.clone();
        let ready = self.ready_tx.clone();
        tokio::spawn(async move {
            let result = match resolve_inputs(&graph, node_id) {
                Ok(inputs) => {
                    let meta = TaskMetadata {
                        dispatch_id: dispatch_id.clone(),
                        node_id,
                        node_name: node.name.clone(),
                        executor_config: node.executor.config.clone(),
                        jobs: JobSink::new(dispatcher.data().clone(), dispatch_id.clone(), node_id)
                            .with_ready(ready),
                    };
                    dispatcher.runner().run_task(&node, inputs, meta).await
                }
                Err(e) => {
                    warn!(dispatch_id = %dispatch_id, node_id, error = %e, "could not resolve inputs");
                    NodeResult::failed(node_id, e.to_string())
                }
            };

            if let Err(e) = dispatcher.update_node_result(&dispatch_id, result).await {
                error!(dispatch_id = %dispatch_id, node_id, error = %e, "failed to record node result");
                dispatcher
                    .notify(
                        &dispatch_id,
                        DispatchEvent::Fault(format!("recording result of node {node_id}: {e}")),
                    )
                    .await;
            }
        });
        Ok(())
    }

    /// Start the child dispatch of `node_id`. A child that already finished
    /// (its report to this node was lost) is reported straight away.
    fn start_child(&self, node_id: NodeId, sub_dispatch_id: &str) {
        let child = match self.dispatcher.get_dispatch(sub_dispatch_id) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(dispatch_id = %self.dispatch_id, node_id, error = %e, "sub-dispatch not found");
                self.record(NodeResult::failed(node_id, format!("sub-dispatch {sub_dispatch_id} not found: {e}")));
                return;
            }
        };
        if child.status.is_terminal() {
            info!(dispatch_id = %self.dispatch_id, node_id, sub_dispatch_id = %sub_dispatch_id, status = %child.status, "sub-dispatch already finished");
            self.record(child_report(node_id, &child));
            return;
        }

        match self.dispatcher.start(sub_dispatch_id) {
            Ok(_) => {
                info!(dispatch_id = %self.dispatch_id, node_id, sub_dispatch_id = %sub_dispatch_id, "started sub-dispatch");
            }
            Err(e) => {
                warn!(dispatch_id = %self.dispatch_id, node_id, error = %e, "could not start sub-dispatch");
                self.record(NodeResult::failed(node_id, format!("starting sub-dispatch failed: {e}")));
            }
        }
    }

    /// Record a synthesized node result from a separate task, so the event
    /// it produces reaches this loop through the channel.
    fn record(&self, result: NodeResult) {
        let dispatcher = self.dispatcher.clone();
        let dispatch_id = self.dispatch_id.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.update_node_result(&dispatch_id, result).await {
                dispatcher
                    .notify(&dispatch_id, DispatchEvent::Fault(e.to_string()))
                    .await;
            }
        });
    }

    fn settle(
        &self,
        outcome: FinalOutcome,
        template: &OutputTemplate,
        graph: &GraphStore,
    ) -> Result<Settlement> {
        let data = self.dispatcher.data();
        if outcome.forced_status().is_none() {
            data.set_dispatch_status(&self.dispatch_id, Status::Postprocessing)?;
        }
        let nodes = graph.nodes()?;
        let settled = postprocess::settle(&outcome, template, &nodes);
        data.persist_dispatch_result(
            &self.dispatch_id,
            settled.status,
            settled.result.clone(),
            settled.error.clone(),
        )?;
        Ok(settled)
    }

    /// Publish the final status, release the dispatch and report to the
    /// parent electron, if any.
    async fn finish(&self, settled: &Settlement) {
        self.dispatcher.unregister(&self.dispatch_id);
        let data = self.dispatcher.data();
        data.release(&self.dispatch_id);
        self.status_tx.send_replace(settled.status);

        let parent = match data.get_meta(&self.dispatch_id) {
            Ok(meta) => meta.parent_electron_id,
            Err(e) => {
                warn!(dispatch_id = %self.dispatch_id, error = %e, "could not look up parent electron");
                None
            }
        };
        let Some(parent) = parent else {
            return;
        };

        let status = parent_status(settled.status);
        let result = child_result(
            parent.node_id,
            &self.dispatch_id,
            settled.status,
            settled.result.clone(),
            settled.error.as_deref(),
        );

        debug!(
            dispatch_id = %self.dispatch_id,
            parent_dispatch_id = %parent.dispatch_id,
            parent_node_id = parent.node_id,
            status = %status,
            "reporting to parent electron"
        );
        if let Err(e) = self
            .dispatcher
            .update_node_result(&parent.dispatch_id, result)
            .await
        {
            error!(dispatch_id = %self.dispatch_id, error = %e, "failed to report to parent dispatch");
            self.dispatcher
                .notify(&parent.dispatch_id, DispatchEvent::Fault(e.to_string()))
                .await;
        }
    }
}

/// Status a parent electron takes from its finished child dispatch.
fn parent_status(child: Status) -> Status {
    match child {
        Status::Completed => Status::Completed,
        Status::Cancelled => Status::Cancelled,
        _ => Status::Failed,
    }
}

fn child_result(
    node_id: NodeId,
    child_id: &str,
    status: Status,
    output: Option<serde_json::Value>,
    error: Option<&str>,
) -> NodeResult {
    let mut result = NodeResult::new(node_id, parent_status(status));
    result.output = output;
    result.error = error.map(|e| format!("sub-dispatch {child_id} finished with status {status}: {e}"));
    result.end_time = Some(Utc::now());
    result
}

fn child_report(node_id: NodeId, child: &DispatchMeta) -> NodeResult {
    child_result(
        node_id,
        &child.dispatch_id,
        child.status,
        child.result.clone(),
        child.error.as_deref(),
    )
}
