// src/data/manager.rs

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dag::{
    Callable, DispatchId, ElectronRef, GraphDiff, GraphStore, Lattice, Node, NodeAttribute, NodeId,
    NodeResult,
};
use crate::data::jobs::JobRecord;
use crate::data::store::{DataStore, DispatchMeta, DispatchRecord};
use crate::errors::{DispatchError, Result};
use crate::types::{Status, StoreMode};

/// Data access facade used by the scheduler, task runner and cancellation
/// manager.
///
/// In [`StoreMode::Cached`] the graph store of each live dispatch is kept in
/// a registry from [`retain`](Self::retain) until
/// [`release`](Self::release); other dispatches get a one-off store per
/// call. In [`StoreMode::Stateless`] a fresh graph store is opened for
/// every call.
#[derive(Debug)]
pub struct DataManager {
    store: Arc<dyn DataStore>,
    mode: StoreMode,
    graphs: DashMap<DispatchId, Arc<GraphStore>>,
}

impl DataManager {
    pub fn new(store: Arc<dyn DataStore>, mode: StoreMode) -> Self {
        Self {
            store,
            mode,
            graphs: DashMap::new(),
        }
    }

    pub fn mode(&self) -> StoreMode {
        self.mode
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    /// Persist a new dispatch for `lattice` and return its id.
    ///
    /// Nodes that are already `Completed` (reused results) do not count
    /// towards the unresolved counter. With a `parent`, the dispatch is
    /// linked to that electron and inherits its root dispatch.
    pub fn create_dispatch(&self, mut lattice: Lattice, parent: Option<ElectronRef>) -> Result<DispatchId> {
        lattice.validate()?;

        let dispatch_id = Uuid::new_v4().to_string();
        let root_dispatch_id = match &parent {
            Some(p) => self.store.load_meta(&p.dispatch_id)?.root_dispatch_id,
            None => dispatch_id.clone(),
        };
        for node in &mut lattice.graph.nodes {
            node.parent_electron_id = parent.clone();
        }
        let unresolved = lattice
            .graph
            .nodes
            .iter()
            .filter(|n| n.status != Status::Completed)
            .count();

        let meta = DispatchMeta {
            dispatch_id: dispatch_id.clone(),
            root_dispatch_id,
            parent_electron_id: parent,
            name: lattice.name.clone(),
            status: Status::New,
            start_time: None,
            end_time: None,
            error: None,
            result: None,
            unresolved,
        };
        self.store.insert_dispatch(DispatchRecord {
            meta,
            lattice,
            jobs: BTreeMap::new(),
        })?;

        info!(dispatch_id = %dispatch_id, unresolved, "created dispatch");
        Ok(dispatch_id)
    }

    /// Graph store for a dispatch, per the configured store mode.
    pub fn graph(&self, dispatch_id: &str) -> Result<Arc<GraphStore>> {
        if let Some(gs) = self.graphs.get(dispatch_id) {
            return Ok(gs.clone());
        }
        Ok(Arc::new(GraphStore::open(
            dispatch_id,
            self.store.clone(),
            self.mode,
        )?))
    }

    /// Keep the graph store of a dispatch that is about to run in memory.
    /// A no-op in stateless mode.
    pub fn retain(&self, dispatch_id: &str) -> Result<()> {
        if self.mode == StoreMode::Stateless {
            return Ok(());
        }
        self.graphs
            .entry(dispatch_id.to_string())
            .or_try_insert_with(|| {
                GraphStore::open(dispatch_id, self.store.clone(), StoreMode::Cached).map(Arc::new)
            })?;
        debug!(dispatch_id = %dispatch_id, "retained cached graph store");
        Ok(())
    }

    /// Drop the cached graph store of a finished dispatch.
    pub fn release(&self, dispatch_id: &str) {
        if self.graphs.remove(dispatch_id).is_some() {
            debug!(dispatch_id = %dispatch_id, "released cached graph store");
        }
    }

    /// Number of graph stores currently held in memory.
    pub fn cached_graphs(&self) -> usize {
        self.graphs.len()
    }

    pub fn contains(&self, dispatch_id: &str) -> Result<bool> {
        self.store.contains_dispatch(dispatch_id)
    }

    pub fn dispatch_ids(&self) -> Result<Vec<DispatchId>> {
        self.store.dispatch_ids()
    }

    pub fn get_node(&self, dispatch_id: &str, node_id: NodeId) -> Result<Node> {
        self.graph(dispatch_id)?.get_node(node_id)
    }

    pub fn get_nodes(&self, dispatch_id: &str) -> Result<Vec<Node>> {
        self.graph(dispatch_id)?.nodes()
    }

    pub fn update_node(&self, dispatch_id: &str, result: &NodeResult) -> Result<Node> {
        self.graph(dispatch_id)?.update_node(result)
    }

    /// Compare-and-set variant of [`update_node`](Self::update_node).
    pub fn update_node_if(&self, dispatch_id: &str, expected: Status, result: &NodeResult) -> Result<Node> {
        self.graph(dispatch_id)?.update_node_if(expected, result)
    }

    pub fn set_node_attribute(&self, dispatch_id: &str, node_id: NodeId, attr: NodeAttribute) -> Result<Node> {
        self.graph(dispatch_id)?.set_node_attribute(node_id, attr)
    }

    pub fn get_unresolved_count(&self, dispatch_id: &str) -> Result<usize> {
        self.graph(dispatch_id)?.unresolved_count()
    }

    pub fn decrement_unresolved(&self, dispatch_id: &str) -> Result<usize> {
        self.graph(dispatch_id)?.decrement_unresolved()
    }

    pub fn get_meta(&self, dispatch_id: &str) -> Result<DispatchMeta> {
        self.store.load_meta(dispatch_id)
    }

    pub fn get_status(&self, dispatch_id: &str) -> Result<Status> {
        Ok(self.store.load_meta(dispatch_id)?.status)
    }

    /// Move the dispatch to `status`, validating the transition and stamping
    /// start/end times.
    pub fn set_dispatch_status(&self, dispatch_id: &str, status: Status) -> Result<DispatchMeta> {
        self.store.update_meta(dispatch_id, &mut |m| {
            if !m.status.can_transition_to(status) {
                return Err(DispatchError::InvalidDispatchTransition {
                    dispatch_id: dispatch_id.to_string(),
                    from: m.status,
                    to: status,
                });
            }
            m.status = status;
            if status == Status::Running && m.start_time.is_none() {
                m.start_time = Some(Utc::now());
            }
            if status.is_terminal() {
                m.end_time = Some(Utc::now());
            }
            Ok(())
        })
    }

    /// Record the final outcome of a dispatch.
    pub fn persist_dispatch_result(
        &self,
        dispatch_id: &str,
        status: Status,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<DispatchMeta> {
        let meta = self.store.update_meta(dispatch_id, &mut |m| {
            m.status = status;
            m.result = result.clone();
            m.error = error.clone();
            m.end_time = Some(Utc::now());
            if m.start_time.is_none() {
                m.start_time = m.end_time;
            }
            Ok(())
        })?;
        info!(dispatch_id = %dispatch_id, status = %status, "persisted dispatch result");
        Ok(meta)
    }

    /// The dispatch's lattice with its current node states.
    pub fn export_manifest(&self, dispatch_id: &str) -> Result<Lattice> {
        Ok(self.store.load_dispatch(dispatch_id)?.lattice)
    }

    /// Create a dispatch from a lattice manifest (JSON), optionally as the
    /// child of a sublattice electron.
    pub fn import_manifest(&self, manifest: &Value, parent: Option<ElectronRef>) -> Result<DispatchId> {
        let mut lattice = Lattice::from_value(manifest)?;
        lattice.graph.reset_runtime_state();
        self.create_dispatch(lattice, parent)
    }

    /// Lattice for a redispatch of `dispatch_id`, with runtime state reset.
    ///
    /// The graph is `new_lattice` or, if `None`, the old lattice; named
    /// electrons get their callables replaced. With `reuse`, results of
    /// nodes that match the old graph are copied over. Graphs that cannot be
    /// compared fall back to full re-execution.
    pub fn get_reusable_graph_diff(
        &self,
        dispatch_id: &str,
        new_lattice: Option<Lattice>,
        electron_updates: &HashMap<String, Callable>,
        reuse: bool,
    ) -> Result<Lattice> {
        let old = self.export_manifest(dispatch_id)?;
        let mut lattice = new_lattice.unwrap_or_else(|| old.clone());
        lattice.graph.reset_runtime_state();

        let mut diff = GraphDiff::new(old.graph, std::mem::take(&mut lattice.graph));
        let updated = diff.apply_electron_updates(electron_updates);
        if !updated.is_empty() {
            debug!(dispatch_id = %dispatch_id, ?updated, "applied electron updates");
        }

        if reuse {
            let copied = diff
                .get_reusable_nodes()
                .and_then(|ids| diff.copy_nodes_from(&ids));
            match copied {
                Ok(n) => info!(dispatch_id = %dispatch_id, reused = n, "reusing previous results"),
                Err(e) => {
                    warn!(dispatch_id = %dispatch_id, error = %e, "graphs not comparable; re-executing everything");
                    let mut graph = diff.into_graph();
                    graph.reset_runtime_state();
                    lattice.graph = graph;
                    return Ok(lattice);
                }
            }
        }

        lattice.graph = diff.into_graph();
        Ok(lattice)
    }

    pub fn get_job(&self, dispatch_id: &str, node_id: NodeId) -> Result<JobRecord> {
        self.store.load_job(dispatch_id, node_id)
    }

    pub fn update_job(
        &self,
        dispatch_id: &str,
        node_id: NodeId,
        apply: &mut dyn FnMut(&mut JobRecord),
    ) -> Result<JobRecord> {
        self.store.update_job(dispatch_id, node_id, apply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{ArgBinding, Callable, OutputTemplate, TransportGraph};
    use crate::data::MemoryStore;
    use serde_json::json;

    fn lattice() -> Lattice {
        let mut g = TransportGraph::new();
        let a = g.add_node(Node::parameter("a", json!(2)));
        let b = g.add_node(Node::task("sq", Callable::named("square")));
        g.add_edge(a, b, ArgBinding::Positional(0));
        Lattice::new("wf", g, OutputTemplate::Node(b))
    }

    #[test]
    fn child_dispatch_inherits_root_and_parent_link() {
        let dm = DataManager::new(Arc::new(MemoryStore::new()), StoreMode::Stateless);
        let root = dm.create_dispatch(lattice(), None).unwrap();
        let parent = ElectronRef {
            dispatch_id: root.clone(),
            node_id: 1,
        };

        let manifest = lattice().to_value().unwrap();
        let child = dm.import_manifest(&manifest, Some(parent.clone())).unwrap();

        let meta = dm.get_meta(&child).unwrap();
        assert_eq!(meta.root_dispatch_id, root);
        assert_eq!(meta.parent_electron_id, Some(parent.clone()));
        assert_eq!(meta.unresolved, 2);
        assert_eq!(dm.get_node(&child, 0).unwrap().parent_electron_id, Some(parent));
    }

    #[test]
    fn cached_registry_holds_only_retained_dispatches() {
        let dm = DataManager::new(Arc::new(MemoryStore::new()), StoreMode::Cached);
        let id = dm.create_dispatch(lattice(), None).unwrap();

        let a = dm.graph(&id).unwrap();
        let b = dm.graph(&id).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(dm.cached_graphs(), 0);

        dm.retain(&id).unwrap();
        let c = dm.graph(&id).unwrap();
        let d = dm.graph(&id).unwrap();
        assert!(Arc::ptr_eq(&c, &d));
        assert_eq!(dm.cached_graphs(), 1);

        dm.release(&id);
        assert_eq!(dm.cached_graphs(), 0);
        assert!(!Arc::ptr_eq(&c, &dm.graph(&id).unwrap()));
    }

    #[test]
    fn stateless_mode_never_caches() {
        let dm = DataManager::new(Arc::new(MemoryStore::new()), StoreMode::Stateless);
        let id = dm.create_dispatch(lattice(), None).unwrap();
        dm.retain(&id).unwrap();
        assert_eq!(dm.cached_graphs(), 0);
    }

    #[test]
    fn reusable_diff_copies_completed_results_only() {
        let dm = DataManager::new(Arc::new(MemoryStore::new()), StoreMode::Stateless);
        let id = dm.create_dispatch(lattice(), None).unwrap();
        dm.update_node(&id, &NodeResult::running(0)).unwrap();
        dm.update_node(&id, &NodeResult::completed(0, json!(2))).unwrap();
        dm.update_node(&id, &NodeResult::running(1)).unwrap();
        dm.update_node(&id, &NodeResult::failed(1, "boom")).unwrap();

        let reused = dm.get_reusable_graph_diff(&id, None, &HashMap::new(), true).unwrap();
        assert_eq!(reused.graph.nodes[0].status, Status::Completed);
        assert_eq!(reused.graph.nodes[0].output, Some(json!(2)));
        assert_eq!(reused.graph.nodes[1].status, Status::New);
        assert!(reused.graph.nodes[1].error.is_none());

        let fresh = dm.get_reusable_graph_diff(&id, None, &HashMap::new(), false).unwrap();
        assert!(fresh.graph.nodes.iter().all(|n| n.status == Status::New));
    }

    #[test]
    fn invalid_lattice_is_rejected() {
        let dm = DataManager::new(Arc::new(MemoryStore::new()), StoreMode::Stateless);
        let mut bad = lattice();
        bad.output = OutputTemplate::Node(9);
        assert!(matches!(
            dm.create_dispatch(bad, None),
            Err(DispatchError::InvalidGraph(_))
        ));
    }
}
