// src/engine/dispatcher.rs

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::model::{DispatcherConfig, StoreKind};
use crate::dag::{Callable, DispatchId, ElectronRef, Lattice, Node, NodeId, NodeKind, NodeResult};
use crate::data::{DataManager, DataStore, DispatchMeta, FileStore, MemoryStore};
use crate::engine::runtime::DispatchRuntime;
use crate::engine::{DispatchEvent, NodeEvent, StatusUpdate};
use crate::errors::{DispatchError, Result};
use crate::exec::{CancellationManager, ExecutorRegistry, TaskRunner};
use crate::fs::RealFileSystem;
use crate::types::Status;

/// Tunables of a [`Dispatcher`].
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Capacity of each dispatch loop's event channel.
    pub event_buffer: usize,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self { event_buffer: 64 }
    }
}

/// Entry point for submitting, running, cancelling and inspecting
/// dispatches.
///
/// Cheap to clone; all clones share the same data manager, executors and
/// set of live dispatch loops. Live loops are only addressed by id here,
/// never from global state.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    data: Arc<DataManager>,
    runner: TaskRunner,
    cancellation: CancellationManager,
    settings: DispatcherSettings,
    live: DashMap<DispatchId, LiveDispatch>,
    updates: broadcast::Sender<StatusUpdate>,
}

struct LiveDispatch {
    events: mpsc::Sender<DispatchEvent>,
    status: watch::Receiver<Status>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("mode", &self.inner.data.mode())
            .field("live", &self.inner.live.len())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(data: Arc<DataManager>, executors: ExecutorRegistry, settings: DispatcherSettings) -> Self {
        let executors = Arc::new(executors);
        let (updates, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Inner {
                runner: TaskRunner::new(executors.clone()),
                cancellation: CancellationManager::new(data.clone(), executors),
                data,
                settings,
                live: DashMap::new(),
                updates,
            }),
        }
    }

    /// Build a dispatcher with the store and mode described by `cfg`.
    pub fn from_config(cfg: &DispatcherConfig, executors: ExecutorRegistry) -> Self {
        let store: Arc<dyn DataStore> = match cfg.store.kind {
            StoreKind::Memory => Arc::new(MemoryStore::new()),
            StoreKind::File => Arc::new(FileStore::new(&cfg.store.path, RealFileSystem)),
        };
        let data = Arc::new(DataManager::new(store, cfg.dispatcher.store_mode()));
        let settings = DispatcherSettings {
            event_buffer: cfg.dispatcher.event_buffer,
        };
        Self::new(data, executors, settings)
    }

    pub fn data(&self) -> &Arc<DataManager> {
        &self.inner.data
    }

    pub(crate) fn runner(&self) -> &TaskRunner {
        &self.inner.runner
    }

    /// Node status changes of every dispatch handled by this dispatcher.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.inner.updates.subscribe()
    }

    /// Persist a new dispatch for `lattice`. It does not run until
    /// [`start`](Self::start).
    pub fn submit(&self, lattice: Lattice) -> Result<DispatchId> {
        self.inner.data.create_dispatch(lattice, None)
    }

    /// Spawn the scheduler loop of a dispatch.
    ///
    /// A dispatch that already finished is left alone and keeps its stored
    /// status; starting a dispatch whose loop is live is a no-op. A dispatch
    /// persisted as `RUNNING` or `POSTPROCESSING` without a live loop is
    /// resumed from its stored node states.
    pub fn start(&self, dispatch_id: &str) -> Result<DispatchId> {
        let meta = self.inner.data.get_meta(dispatch_id)?;
        if meta.status.is_terminal() {
            info!(dispatch_id = %dispatch_id, status = %meta.status, "dispatch already finished; not re-running");
            return Ok(meta.dispatch_id);
        }

        let (events, event_rx) = mpsc::channel(self.inner.settings.event_buffer.max(1));
        let (status_tx, status) = watch::channel(Status::Running);
        match self.inner.live.entry(dispatch_id.to_string()) {
            Entry::Occupied(_) => {
                debug!(dispatch_id = %dispatch_id, "dispatch loop already live");
                return Ok(meta.dispatch_id);
            }
            Entry::Vacant(slot) => {
                slot.insert(LiveDispatch { events, status });
            }
        }

        if let Err(e) = self.inner.data.retain(dispatch_id) {
            self.inner.live.remove(dispatch_id);
            return Err(e);
        }

        let transition = if meta.status == Status::Postprocessing {
            Ok(meta.clone())
        } else {
            self.inner.data.set_dispatch_status(dispatch_id, Status::Running)
        };
        match transition {
            Ok(_) => {}
            Err(DispatchError::InvalidDispatchTransition { from, .. }) if from.is_terminal() => {
                self.inner.live.remove(dispatch_id);
                self.inner.data.release(dispatch_id);
                return Ok(meta.dispatch_id);
            }
            Err(e) => {
                self.inner.live.remove(dispatch_id);
                self.inner.data.release(dispatch_id);
                return Err(e);
            }
        }

        let runtime = DispatchRuntime::new(self.clone(), meta.dispatch_id.clone(), event_rx, status_tx);
        tokio::spawn(runtime.run());
        Ok(meta.dispatch_id)
    }

    /// Wait until the dispatch reaches a terminal status and return it.
    ///
    /// Only live loops are waited on. For a dispatch without one, such as a
    /// submitted dispatch that was never started, this returns the stored
    /// status straight away, `NEW_OBJECT` included.
    pub async fn wait(&self, dispatch_id: &str) -> Result<Status> {
        let status_rx = self.inner.live.get(dispatch_id).map(|l| l.status.clone());
        if let Some(mut rx) = status_rx {
            if let Ok(status) = rx.wait_for(|s| s.is_terminal()).await {
                return Ok(*status);
            }
        }
        self.get_status(dispatch_id)
    }

    /// Start and wait. On a finished dispatch this returns the stored
    /// status without running anything.
    pub async fn run(&self, dispatch_id: &str) -> Result<Status> {
        self.start(dispatch_id)?;
        self.wait(dispatch_id).await
    }

    /// Derive a new dispatch from a previous one.
    ///
    /// The new graph is `new_lattice` or, if `None`, the old lattice. Named
    /// electrons get their callables replaced. With `reuse`, results of
    /// nodes that match the old graph are copied over; if the graphs cannot
    /// be compared the new dispatch simply re-executes everything. The new
    /// dispatch is created but not started.
    pub fn redispatch(
        &self,
        dispatch_id: &str,
        new_lattice: Option<Lattice>,
        electron_updates: &HashMap<String, Callable>,
        reuse: bool,
    ) -> Result<DispatchId> {
        let lattice = self.inner.data.get_reusable_graph_diff(
            dispatch_id,
            new_lattice,
            electron_updates,
            reuse,
        )?;
        let new_id = self.inner.data.create_dispatch(lattice, None)?;
        info!(dispatch_id = %dispatch_id, new_dispatch_id = %new_id, "created redispatch");
        Ok(new_id)
    }

    /// Cancel a whole dispatch (`node_ids = None`) or selected nodes.
    ///
    /// Whole-dispatch cancellation stops the scheduler from starting new
    /// nodes, cancels every incomplete node and recursively cancels running
    /// sub-dispatches. Running nodes whose executor declines stay running.
    pub async fn cancel(&self, dispatch_id: &str, node_ids: Option<Vec<NodeId>>) -> Result<()> {
        let mut work: VecDeque<(DispatchId, Option<Vec<NodeId>>)> =
            VecDeque::from([(dispatch_id.to_string(), node_ids)]);

        while let Some((id, ids)) = work.pop_front() {
            let meta = self.inner.data.get_meta(&id)?;
            if meta.status.is_terminal() {
                debug!(dispatch_id = %id, status = %meta.status, "dispatch already finished; nothing to cancel");
                continue;
            }

            let whole = ids.is_none();
            let targets = match ids {
                Some(ids) => ids,
                None => {
                    info!(dispatch_id = %id, "cancelling dispatch");
                    self.notify(&id, DispatchEvent::CancelRequested).await;
                    self.get_incomplete_tasks(&id)?
                }
            };

            for outcome in self.inner.cancellation.cancel_tasks(&id, &targets).await? {
                let Some(node) = outcome.node else {
                    continue;
                };
                if outcome.cancelled {
                    self.publish(&id, node.node_id, node.status);
                    self.notify(
                        &id,
                        DispatchEvent::NodeUpdated(NodeEvent {
                            node_id: node.node_id,
                            status: node.status,
                            sub_dispatch_id: None,
                        }),
                    )
                    .await;
                } else if node.status == Status::Dispatching {
                    if let Some(sub) = node.sub_dispatch_id {
                        work.push_back((sub, None));
                    }
                }
            }

            if whole && meta.status == Status::New && !self.inner.live.contains_key(&id) {
                self.inner
                    .data
                    .persist_dispatch_result(&id, Status::Cancelled, None, None)?;
            }
        }
        Ok(())
    }

    pub fn get_status(&self, dispatch_id: &str) -> Result<Status> {
        self.inner.data.get_status(dispatch_id)
    }

    /// Dispatch-level record: status, timestamps, result and error.
    pub fn get_dispatch(&self, dispatch_id: &str) -> Result<DispatchMeta> {
        self.inner.data.get_meta(dispatch_id)
    }

    /// Ids of every node that has not completed, in id order.
    pub fn get_incomplete_tasks(&self, dispatch_id: &str) -> Result<Vec<NodeId>> {
        Ok(self
            .inner
            .data
            .get_nodes(dispatch_id)?
            .into_iter()
            .filter(|n| n.status != Status::Completed)
            .map(|n| n.node_id)
            .collect())
    }

    /// Record a node result and forward it to the dispatch's loop.
    ///
    /// A completed, not yet expanded sublattice node is turned into
    /// `Dispatching` with a freshly imported child dispatch (or `Failed` if
    /// its manifest cannot be imported). Illegal transitions are logged and
    /// rejected; `Ok(false)` reports the rejection.
    pub async fn update_node_result(&self, dispatch_id: &str, mut result: NodeResult) -> Result<bool> {
        let node = self.inner.data.get_node(dispatch_id, result.node_id)?;

        if result.status == Status::Completed
            && node.kind == NodeKind::Sublattice
            && node.sub_dispatch_id.is_none()
            && result.sub_dispatch_id.is_none()
        {
            match self.expand_sublattice(dispatch_id, &node, result.output.as_ref()) {
                Ok(child) => {
                    info!(dispatch_id = %dispatch_id, node_id = node.node_id, sub_dispatch_id = %child, "sublattice expanded");
                    result.status = Status::Dispatching;
                    result.sub_dispatch_id = Some(child);
                    result.output = None;
                    result.end_time = None;
                }
                Err(e) => {
                    warn!(dispatch_id = %dispatch_id, node_id = node.node_id, error = %e, "sublattice expansion failed");
                    result.status = Status::Failed;
                    result.error = Some(format!("sublattice expansion failed: {e}"));
                    result.output = None;
                }
            }
        }

        let updated = match self.inner.data.update_node(dispatch_id, &result) {
            Ok(updated) => updated,
            Err(DispatchError::InvalidStatusTransition { node_id, from, to }) => {
                if from == to {
                    debug!(dispatch_id = %dispatch_id, node_id, status = %to, "duplicate status update ignored");
                } else {
                    warn!(dispatch_id = %dispatch_id, node_id, from = %from, to = %to, "rejected invalid status transition");
                }
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        self.publish(dispatch_id, updated.node_id, updated.status);
        self.notify(
            dispatch_id,
            DispatchEvent::NodeUpdated(NodeEvent {
                node_id: updated.node_id,
                status: updated.status,
                sub_dispatch_id: updated.sub_dispatch_id.clone(),
            }),
        )
        .await;
        Ok(true)
    }

    fn expand_sublattice(&self, dispatch_id: &str, node: &Node, manifest: Option<&Value>) -> Result<DispatchId> {
        let manifest = manifest.ok_or_else(|| {
            DispatchError::InvalidGraph(format!("sublattice '{}' produced no manifest", node.name))
        })?;
        self.inner.data.import_manifest(
            manifest,
            Some(ElectronRef {
                dispatch_id: dispatch_id.to_string(),
                node_id: node.node_id,
            }),
        )
    }

    pub(crate) fn mark_running(&self, dispatch_id: &str, node_id: NodeId) -> Result<Node> {
        let node = self
            .inner
            .data
            .update_node(dispatch_id, &NodeResult::running(node_id))?;
        self.publish(dispatch_id, node_id, node.status);
        Ok(node)
    }

    pub(crate) async fn notify(&self, dispatch_id: &str, event: DispatchEvent) {
        let events = self.inner.live.get(dispatch_id).map(|l| l.events.clone());
        match events {
            Some(tx) => {
                if tx.send(event).await.is_err() {
                    debug!(dispatch_id = %dispatch_id, "dispatch loop already gone; event dropped");
                }
            }
            None => debug!(dispatch_id = %dispatch_id, "no live loop; event not forwarded"),
        }
    }

    pub(crate) fn unregister(&self, dispatch_id: &str) {
        self.inner.live.remove(dispatch_id);
    }

    fn publish(&self, dispatch_id: &str, node_id: NodeId, status: Status) {
        let _ = self.inner.updates.send(StatusUpdate {
            dispatch_id: dispatch_id.to_string(),
            node_id,
            status,
        });
    }
}
