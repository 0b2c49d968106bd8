// src/data/file_store.rs

use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::anyhow;
use tracing::debug;

use crate::dag::DispatchId;
use crate::data::store::{DataStore, DispatchRecord};
use crate::errors::{DispatchError, Result};
use crate::fs::FileSystem;

/// Durable backend: one JSON document per dispatch under `root`.
///
/// A single mutex serializes read-modify-write cycles, which keeps
/// `update_dispatch` atomic across all dispatches in this process.
#[derive(Debug)]
pub struct FileStore<F: FileSystem> {
    root: PathBuf,
    fs: F,
    lock: Mutex<()>,
}

impl<F: FileSystem> FileStore<F> {
    pub fn new(root: impl Into<PathBuf>, fs: F) -> Self {
        Self {
            root: root.into(),
            fs,
            lock: Mutex::new(()),
        }
    }

    fn record_path(&self, dispatch_id: &str) -> PathBuf {
        self.root.join(format!("{dispatch_id}.json"))
    }

    fn read(&self, dispatch_id: &str) -> Result<DispatchRecord> {
        let path = self.record_path(dispatch_id);
        if !self.fs.exists(&path) {
            return Err(DispatchError::DispatchNotFound(dispatch_id.to_string()));
        }
        let text = self.fs.read_to_string(&path)?;
        Ok(serde_json::from_str(&text)?)
    }

    fn write(&self, record: &DispatchRecord) -> Result<()> {
        let path = self.record_path(&record.meta.dispatch_id);
        let bytes = serde_json::to_vec_pretty(record)?;
        self.fs.write(&path, &bytes)?;
        debug!(dispatch_id = %record.meta.dispatch_id, path = ?path, "persisted dispatch record");
        Ok(())
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| DispatchError::Other(anyhow!("file store lock poisoned")))
    }
}

impl<F: FileSystem> DataStore for FileStore<F> {
    fn insert_dispatch(&self, record: DispatchRecord) -> Result<()> {
        let _guard = self.guard()?;
        self.write(&record)
    }

    fn load_dispatch(&self, dispatch_id: &str) -> Result<DispatchRecord> {
        let _guard = self.guard()?;
        self.read(dispatch_id)
    }

    fn contains_dispatch(&self, dispatch_id: &str) -> Result<bool> {
        Ok(self.fs.exists(&self.record_path(dispatch_id)))
    }

    fn dispatch_ids(&self) -> Result<Vec<DispatchId>> {
        if !self.fs.exists(&self.root) {
            return Ok(Vec::new());
        }
        let mut ids: Vec<DispatchId> = self
            .fs
            .read_dir(&self.root)?
            .into_iter()
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn update_dispatch(
        &self,
        dispatch_id: &str,
        apply: &mut dyn FnMut(&mut DispatchRecord) -> Result<()>,
    ) -> Result<()> {
        let _guard = self.guard()?;
        let mut record = self.read(dispatch_id)?;
        apply(&mut record)?;
        self.write(&record)
    }
}
