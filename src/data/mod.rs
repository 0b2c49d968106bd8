// src/data/mod.rs

//! Persistence: the storage backend contract, its memory and file
//! implementations, and the [`DataManager`] facade the engine talks to.

pub mod file_store;
pub mod jobs;
pub mod manager;
pub mod store;

pub use file_store::FileStore;
pub use jobs::JobRecord;
pub use manager::DataManager;
pub use store::{DataStore, DispatchMeta, DispatchRecord, MemoryStore};
