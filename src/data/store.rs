// src/data/store.rs

//! Persistent dispatch records and the storage backend contract.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dag::{DispatchId, ElectronRef, Lattice, Node, NodeId};
use crate::data::jobs::JobRecord;
use crate::errors::{DispatchError, Result};
use crate::types::Status;

/// Dispatch-level bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchMeta {
    pub dispatch_id: DispatchId,
    pub root_dispatch_id: DispatchId,
    #[serde(default)]
    pub parent_electron_id: Option<ElectronRef>,
    pub name: String,
    pub status: Status,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    /// Nodes not yet in a terminal state.
    pub unresolved: usize,
}

/// Everything persisted about one dispatch: metadata, the lattice with its
/// live node states, and job records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub meta: DispatchMeta,
    pub lattice: Lattice,
    #[serde(default)]
    pub jobs: BTreeMap<NodeId, JobRecord>,
}

/// Storage backend for dispatch records.
///
/// `update_dispatch` must be atomic with respect to other calls for the
/// same dispatch: the closure sees the latest committed record and its
/// changes are committed only if it returns `Ok`. Closures must not call
/// back into the store.
///
/// The node, meta and job helpers are provided on top of it; backends may
/// override them when they can do better.
pub trait DataStore: Send + Sync + fmt::Debug {
    fn insert_dispatch(&self, record: DispatchRecord) -> Result<()>;

    fn load_dispatch(&self, dispatch_id: &str) -> Result<DispatchRecord>;

    fn contains_dispatch(&self, dispatch_id: &str) -> Result<bool>;

    fn dispatch_ids(&self) -> Result<Vec<DispatchId>>;

    fn update_dispatch(
        &self,
        dispatch_id: &str,
        apply: &mut dyn FnMut(&mut DispatchRecord) -> Result<()>,
    ) -> Result<()>;

    fn load_meta(&self, dispatch_id: &str) -> Result<DispatchMeta> {
        Ok(self.load_dispatch(dispatch_id)?.meta)
    }

    fn update_meta(
        &self,
        dispatch_id: &str,
        apply: &mut dyn FnMut(&mut DispatchMeta) -> Result<()>,
    ) -> Result<DispatchMeta> {
        let mut out = None;
        self.update_dispatch(dispatch_id, &mut |rec| {
            let mut draft = rec.meta.clone();
            apply(&mut draft)?;
            rec.meta = draft.clone();
            out = Some(draft);
            Ok(())
        })?;
        out.ok_or_else(|| DispatchError::DispatchNotFound(dispatch_id.to_string()))
    }

    fn load_node(&self, dispatch_id: &str, node_id: NodeId) -> Result<Node> {
        let rec = self.load_dispatch(dispatch_id)?;
        rec.lattice
            .graph
            .node(node_id)
            .cloned()
            .ok_or_else(|| node_not_found(dispatch_id, node_id))
    }

    fn update_node(
        &self,
        dispatch_id: &str,
        node_id: NodeId,
        apply: &mut dyn FnMut(&mut Node) -> Result<()>,
    ) -> Result<Node> {
        let mut out = None;
        self.update_dispatch(dispatch_id, &mut |rec| {
            let node = rec
                .lattice
                .graph
                .node_mut(node_id)
                .ok_or_else(|| node_not_found(dispatch_id, node_id))?;
            let mut draft = node.clone();
            apply(&mut draft)?;
            *node = draft.clone();
            out = Some(draft);
            Ok(())
        })?;
        out.ok_or_else(|| node_not_found(dispatch_id, node_id))
    }

    fn load_job(&self, dispatch_id: &str, node_id: NodeId) -> Result<JobRecord> {
        let rec = self.load_dispatch(dispatch_id)?;
        Ok(rec.jobs.get(&node_id).cloned().unwrap_or_default())
    }

    fn update_job(
        &self,
        dispatch_id: &str,
        node_id: NodeId,
        apply: &mut dyn FnMut(&mut JobRecord),
    ) -> Result<JobRecord> {
        let mut out = None;
        self.update_dispatch(dispatch_id, &mut |rec| {
            if rec.lattice.graph.node(node_id).is_none() {
                return Err(node_not_found(dispatch_id, node_id));
            }
            let job = rec.jobs.entry(node_id).or_default();
            apply(job);
            out = Some(job.clone());
            Ok(())
        })?;
        out.ok_or_else(|| node_not_found(dispatch_id, node_id))
    }
}

pub(crate) fn node_not_found(dispatch_id: &str, node_id: NodeId) -> DispatchError {
    DispatchError::NodeNotFound {
        dispatch_id: dispatch_id.to_string(),
        node_id,
    }
}

/// Process-local backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<DispatchId, DispatchRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DataStore for MemoryStore {
    fn insert_dispatch(&self, record: DispatchRecord) -> Result<()> {
        self.records
            .insert(record.meta.dispatch_id.clone(), record);
        Ok(())
    }

    fn load_dispatch(&self, dispatch_id: &str) -> Result<DispatchRecord> {
        self.records
            .get(dispatch_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| DispatchError::DispatchNotFound(dispatch_id.to_string()))
    }

    fn contains_dispatch(&self, dispatch_id: &str) -> Result<bool> {
        Ok(self.records.contains_key(dispatch_id))
    }

    fn dispatch_ids(&self) -> Result<Vec<DispatchId>> {
        let mut ids: Vec<DispatchId> = self.records.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }

    fn update_dispatch(
        &self,
        dispatch_id: &str,
        apply: &mut dyn FnMut(&mut DispatchRecord) -> Result<()>,
    ) -> Result<()> {
        let mut entry = self
            .records
            .get_mut(dispatch_id)
            .ok_or_else(|| DispatchError::DispatchNotFound(dispatch_id.to_string()))?;
        apply(entry.value_mut())
    }

    fn load_node(&self, dispatch_id: &str, node_id: NodeId) -> Result<Node> {
        let entry = self
            .records
            .get(dispatch_id)
            .ok_or_else(|| DispatchError::DispatchNotFound(dispatch_id.to_string()))?;
        entry
            .lattice
            .graph
            .node(node_id)
            .cloned()
            .ok_or_else(|| node_not_found(dispatch_id, node_id))
    }

    fn load_meta(&self, dispatch_id: &str) -> Result<DispatchMeta> {
        self.records
            .get(dispatch_id)
            .map(|r| r.meta.clone())
            .ok_or_else(|| DispatchError::DispatchNotFound(dispatch_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{Callable, Node, OutputTemplate, TransportGraph};
    use crate::types::Status;

    fn record(id: &str) -> DispatchRecord {
        let mut graph = TransportGraph::new();
        graph.add_node(Node::task("t", Callable::named("t")));
        DispatchRecord {
            meta: DispatchMeta {
                dispatch_id: id.to_string(),
                root_dispatch_id: id.to_string(),
                parent_electron_id: None,
                name: "wf".into(),
                status: Status::New,
                start_time: None,
                end_time: None,
                error: None,
                result: None,
                unresolved: 1,
            },
            lattice: Lattice::new("wf", graph, OutputTemplate::Node(0)),
            jobs: BTreeMap::new(),
        }
    }

    #[test]
    fn failed_node_update_leaves_record_untouched() {
        let store = MemoryStore::new();
        store.insert_dispatch(record("d1")).unwrap();

        let res = store.update_node("d1", 0, &mut |n| {
            n.status = Status::Running;
            Err(DispatchError::PostProcessing("nope".into()))
        });
        assert!(res.is_err());
        assert_eq!(store.load_node("d1", 0).unwrap().status, Status::New);
    }

    #[test]
    fn job_records_default_and_persist() {
        let store = MemoryStore::new();
        store.insert_dispatch(record("d1")).unwrap();

        assert_eq!(store.load_job("d1", 0).unwrap(), JobRecord::default());
        store
            .update_job("d1", 0, &mut |j| j.cancel_requested = true)
            .unwrap();
        assert!(store.load_job("d1", 0).unwrap().cancel_requested);
        assert!(matches!(
            store.update_job("d1", 7, &mut |_| {}),
            Err(DispatchError::NodeNotFound { .. })
        ));
    }
}
