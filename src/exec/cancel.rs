// src/exec/cancel.rs

//! Best-effort cancellation of individual nodes.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::dag::{DispatchId, Node, NodeId, NodeResult};
use crate::data::{DataManager, JobRecord};
use crate::errors::{DispatchError, Result};
use crate::exec::backend::{ExecutorRegistry, JobSink, TaskMetadata};
use crate::types::Status;

/// What happened to one node in a cancellation request.
#[derive(Debug, Clone)]
pub struct CancelOutcome {
    pub node_id: NodeId,
    /// The node was moved to `CANCELLED` by this request.
    pub cancelled: bool,
    /// Node state after the request.
    pub node: Option<Node>,
}

#[derive(Debug, Clone)]
pub struct CancellationManager {
    data: Arc<DataManager>,
    executors: Arc<ExecutorRegistry>,
}

impl CancellationManager {
    pub fn new(data: Arc<DataManager>, executors: Arc<ExecutorRegistry>) -> Self {
        Self { data, executors }
    }

    /// Cancel `node_ids` of `dispatch_id`, one concurrent request per node.
    ///
    /// Every node is first flagged `cancel_requested`, which stops the task
    /// runner from starting it. A node that has not started is then moved
    /// straight to `CANCELLED`. A running node is cancelled through its
    /// executor's hook when a job handle is known; if the hook declines or
    /// fails the node keeps running. Outcomes come back in node-id order.
    pub async fn cancel_tasks(&self, dispatch_id: &str, node_ids: &[NodeId]) -> Result<Vec<CancelOutcome>> {
        let mut set = JoinSet::new();
        for &node_id in node_ids {
            let this = self.clone();
            let dispatch_id = dispatch_id.to_string();
            set.spawn(async move { this.cancel_one(dispatch_id, node_id).await });
        }

        let mut outcomes = Vec::with_capacity(node_ids.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(outcome)) => outcomes.push(outcome),
                Ok(Err(e)) => warn!(dispatch_id = %dispatch_id, error = %e, "node cancellation failed"),
                Err(e) => warn!(dispatch_id = %dispatch_id, error = %e, "node cancellation task panicked"),
            }
        }
        outcomes.sort_by_key(|o| o.node_id);
        Ok(outcomes)
    }

    async fn cancel_one(&self, dispatch_id: DispatchId, node_id: NodeId) -> Result<CancelOutcome> {
        let job = self.data.update_job(&dispatch_id, node_id, &mut |job| {
            job.cancel_requested = true;
        })?;
        let node = self.data.get_node(&dispatch_id, node_id)?;

        match node.status {
            Status::New => {
                match self
                    .data
                    .update_node_if(&dispatch_id, Status::New, &NodeResult::cancelled(node_id))
                {
                    Ok(node) => {
                        info!(dispatch_id = %dispatch_id, node_id, "cancelled node before it started");
                        self.mark_job_cancelled(&dispatch_id, node_id)?;
                        Ok(CancelOutcome { node_id, cancelled: true, node: Some(node) })
                    }
                    // The scheduler started it in the meantime. The runner
                    // checks the flag before invoking the executor, so the
                    // node ends up cancelled through its own result.
                    Err(DispatchError::InvalidStatusTransition { .. }) => {
                        debug!(dispatch_id = %dispatch_id, node_id, "node left NEW while cancelling");
                        Ok(self.unchanged(&dispatch_id, node_id))
                    }
                    Err(e) => Err(e),
                }
            }
            Status::Running => self.cancel_running(&dispatch_id, node, job).await,
            // Sub-dispatch cancellation is driven by the dispatcher.
            Status::Dispatching => Ok(CancelOutcome { node_id, cancelled: false, node: Some(node) }),
            _ => {
                debug!(dispatch_id = %dispatch_id, node_id, status = %node.status, "node already finished; nothing to cancel");
                Ok(CancelOutcome { node_id, cancelled: false, node: Some(node) })
            }
        }
    }

    /// Ask the executor of a running node to stop its job.
    async fn cancel_running(&self, dispatch_id: &str, node: Node, job: JobRecord) -> Result<CancelOutcome> {
        let node_id = node.node_id;
        let dispatch_id = dispatch_id.to_string();
        let Some(handle) = job.job_handle else {
            debug!(dispatch_id = %dispatch_id, node_id, "no job handle yet; cancel flag set");
            return Ok(CancelOutcome { node_id, cancelled: false, node: Some(node) });
        };
        let executor = match self.executors.get(&node.executor.name) {
            Ok(ex) => ex,
            Err(e) => {
                warn!(dispatch_id = %dispatch_id, node_id, error = %e, "cannot cancel: executor unavailable");
                return Ok(CancelOutcome { node_id, cancelled: false, node: Some(node) });
            }
        };
        let meta = TaskMetadata {
            dispatch_id: dispatch_id.clone(),
            node_id,
            node_name: node.name.clone(),
            executor_config: node.executor.config.clone(),
            jobs: JobSink::new(self.data.clone(), dispatch_id.clone(), node_id),
        };

        match executor.cancel(&meta, &handle).await {
            Ok(true) => match self.data.update_node(&dispatch_id, &NodeResult::cancelled(node_id)) {
                Ok(node) => {
                    info!(dispatch_id = %dispatch_id, node_id, job = %handle, "cancelled running node");
                    self.mark_job_cancelled(&dispatch_id, node_id)?;
                    Ok(CancelOutcome { node_id, cancelled: true, node: Some(node) })
                }
                Err(DispatchError::InvalidStatusTransition { .. }) => {
                    debug!(dispatch_id = %dispatch_id, node_id, "node finished before cancellation landed");
                    Ok(self.unchanged(&dispatch_id, node_id))
                }
                Err(e) => Err(e),
            },
            Ok(false) => {
                info!(dispatch_id = %dispatch_id, node_id, "executor declined cancellation; node keeps running");
                Ok(CancelOutcome { node_id, cancelled: false, node: Some(node) })
            }
            Err(e) => {
                warn!(dispatch_id = %dispatch_id, node_id, error = %e, "executor cancel hook failed; node keeps running");
                Ok(CancelOutcome { node_id, cancelled: false, node: Some(node) })
            }
        }
    }

    fn mark_job_cancelled(&self, dispatch_id: &str, node_id: NodeId) -> Result<()> {
        self.data.update_job(dispatch_id, node_id, &mut |job| {
            job.status = Some(Status::Cancelled);
        })?;
        Ok(())
    }

    fn unchanged(&self, dispatch_id: &str, node_id: NodeId) -> CancelOutcome {
        CancelOutcome {
            node_id,
            cancelled: false,
            node: self.data.get_node(dispatch_id, node_id).ok(),
        }
    }
}
