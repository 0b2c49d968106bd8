// src/dag/store.rs

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::anyhow;
use tracing::trace;

use crate::dag::graph::Edge;
use crate::dag::node::{Node, NodeAttribute, NodeResult};
use crate::dag::{DispatchId, NodeId};
use crate::data::DataStore;
use crate::data::store::node_not_found;
use crate::errors::{DispatchError, Result};
use crate::types::{Status, StoreMode};

/// Per-dispatch view over node state, safe to share between the scheduler
/// loop and concurrently running tasks.
///
/// Every write goes through to the [`DataStore`] before it returns, so a
/// write is visible to any later read, from this store or a fresh one.
/// In cached mode node state and the unresolved counter are additionally
/// held in memory; in stateless mode every read hits the backend.
#[derive(Debug)]
pub struct GraphStore {
    dispatch_id: DispatchId,
    store: Arc<dyn DataStore>,
    backing: Backing,
}

#[derive(Debug)]
enum Backing {
    Cached(CachedGraph),
    Stateless,
}

#[derive(Debug)]
struct CachedGraph {
    nodes: RwLock<Vec<Node>>,
    edges: Vec<Edge>,
    unresolved: AtomicUsize,
}

impl GraphStore {
    /// Open the graph of an existing dispatch.
    pub fn open(
        dispatch_id: impl Into<DispatchId>,
        store: Arc<dyn DataStore>,
        mode: StoreMode,
    ) -> Result<Self> {
        let dispatch_id = dispatch_id.into();
        let backing = match mode {
            StoreMode::Stateless => {
                if !store.contains_dispatch(&dispatch_id)? {
                    return Err(DispatchError::DispatchNotFound(dispatch_id));
                }
                Backing::Stateless
            }
            StoreMode::Cached => {
                let record = store.load_dispatch(&dispatch_id)?;
                Backing::Cached(CachedGraph {
                    nodes: RwLock::new(record.lattice.graph.nodes),
                    edges: record.lattice.graph.edges,
                    unresolved: AtomicUsize::new(record.meta.unresolved),
                })
            }
        };

        Ok(Self {
            dispatch_id,
            store,
            backing,
        })
    }

    pub fn dispatch_id(&self) -> &str {
        &self.dispatch_id
    }

    pub fn get_node(&self, node_id: NodeId) -> Result<Node> {
        match &self.backing {
            Backing::Cached(c) => read(&c.nodes)?
                .get(node_id)
                .cloned()
                .ok_or_else(|| node_not_found(&self.dispatch_id, node_id)),
            Backing::Stateless => self.store.load_node(&self.dispatch_id, node_id),
        }
    }

    /// Snapshot of every node, in id order.
    pub fn nodes(&self) -> Result<Vec<Node>> {
        match &self.backing {
            Backing::Cached(c) => Ok(read(&c.nodes)?.clone()),
            Backing::Stateless => Ok(self.store.load_dispatch(&self.dispatch_id)?.lattice.graph.nodes),
        }
    }

    /// Set one attribute, bypassing status-transition checks.
    pub fn set_node_attribute(&self, node_id: NodeId, attr: NodeAttribute) -> Result<Node> {
        self.write_node(node_id, &mut |n| {
            n.set_attribute(attr.clone());
            Ok(())
        })
    }

    /// Apply a node result atomically, validating the status transition.
    pub fn update_node(&self, result: &NodeResult) -> Result<Node> {
        let node = self.write_node(result.node_id, &mut |n| n.apply_result(result))?;
        trace!(
            dispatch_id = %self.dispatch_id,
            node_id = result.node_id,
            status = %node.status,
            "node updated"
        );
        Ok(node)
    }

    /// Apply `result` only while the node is still in `expected`.
    ///
    /// Check and write happen under the same lock, so a concurrent update
    /// that moved the node on makes this fail with
    /// [`DispatchError::InvalidStatusTransition`].
    pub fn update_node_if(&self, expected: Status, result: &NodeResult) -> Result<Node> {
        self.write_node(result.node_id, &mut |n| {
            if n.status != expected {
                return Err(DispatchError::InvalidStatusTransition {
                    node_id: n.node_id,
                    from: n.status,
                    to: result.status,
                });
            }
            n.apply_result(result)
        })
    }

    pub fn get_incoming_edges(&self, node_id: NodeId) -> Result<Vec<Edge>> {
        let edges = match &self.backing {
            Backing::Cached(c) => c.edges.iter().filter(|e| e.target == node_id).cloned().collect(),
            Backing::Stateless => self
                .store
                .load_dispatch(&self.dispatch_id)?
                .lattice
                .graph
                .incoming_edges(node_id),
        };
        Ok(edges)
    }

    /// Distinct direct successors, in id order.
    pub fn get_successors(&self, node_id: NodeId) -> Result<Vec<NodeId>> {
        let mut succ: Vec<NodeId> = match &self.backing {
            Backing::Cached(c) => c
                .edges
                .iter()
                .filter(|e| e.source == node_id)
                .map(|e| e.target)
                .collect(),
            Backing::Stateless => {
                return Ok(self
                    .store
                    .load_dispatch(&self.dispatch_id)?
                    .lattice
                    .graph
                    .successors(node_id));
            }
        };
        succ.sort_unstable();
        succ.dedup();
        Ok(succ)
    }

    pub fn unresolved_count(&self) -> Result<usize> {
        match &self.backing {
            Backing::Cached(c) => Ok(c.unresolved.load(Ordering::SeqCst)),
            Backing::Stateless => Ok(self.store.load_meta(&self.dispatch_id)?.unresolved),
        }
    }

    /// Atomically decrement the unresolved counter, returning the new value.
    /// Saturates at zero.
    pub fn decrement_unresolved(&self) -> Result<usize> {
        match &self.backing {
            Backing::Cached(c) => {
                let prev = c
                    .unresolved
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                        Some(v.saturating_sub(1))
                    })
                    .unwrap_or(0);
                let now = prev.saturating_sub(1);
                // The counter only moves down, so `min` keeps the persisted
                // value right when concurrent decrements persist out of order.
                self.store.update_meta(&self.dispatch_id, &mut |m| {
                    m.unresolved = m.unresolved.min(now);
                    Ok(())
                })?;
                Ok(now)
            }
            Backing::Stateless => {
                let meta = self.store.update_meta(&self.dispatch_id, &mut |m| {
                    m.unresolved = m.unresolved.saturating_sub(1);
                    Ok(())
                })?;
                Ok(meta.unresolved)
            }
        }
    }

    fn write_node(
        &self,
        node_id: NodeId,
        apply: &mut dyn FnMut(&mut Node) -> Result<()>,
    ) -> Result<Node> {
        match &self.backing {
            Backing::Cached(c) => {
                let mut nodes = write(&c.nodes)?;
                let slot = nodes
                    .get_mut(node_id)
                    .ok_or_else(|| node_not_found(&self.dispatch_id, node_id))?;
                let mut draft = slot.clone();
                apply(&mut draft)?;
                self.store.update_node(&self.dispatch_id, node_id, &mut |n| {
                    *n = draft.clone();
                    Ok(())
                })?;
                *slot = draft.clone();
                Ok(draft)
            }
            Backing::Stateless => self.store.update_node(&self.dispatch_id, node_id, apply),
        }
    }
}

fn read(lock: &RwLock<Vec<Node>>) -> Result<RwLockReadGuard<'_, Vec<Node>>> {
    lock.read()
        .map_err(|_| DispatchError::Other(anyhow!("graph store lock poisoned")))
}

fn write(lock: &RwLock<Vec<Node>>) -> Result<RwLockWriteGuard<'_, Vec<Node>>> {
    lock.write()
        .map_err(|_| DispatchError::Other(anyhow!("graph store lock poisoned")))
}
