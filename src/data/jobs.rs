// src/data/jobs.rs

use serde::{Deserialize, Serialize};

use crate::types::Status;

/// Per-node executor bookkeeping kept beside the node state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Opaque handle the executor published for the running job.
    #[serde(default)]
    pub job_handle: Option<String>,
    /// Set by the cancellation manager; executors may poll it.
    #[serde(default)]
    pub cancel_requested: bool,
    /// Status as last seen by the cancellation path.
    #[serde(default)]
    pub status: Option<Status>,
}
