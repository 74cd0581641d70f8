//! Long-running, cancellable maintenance jobs.
//!
//! Every job follows the same shape: register with the operation
//! registry, persist an atomically-replaced state file about once a
//! second, check the cancellation token between files, and finish with
//! exactly one completion event whose `success` flag is authoritative.

pub mod clear;
pub mod corruption;
pub mod game_remove;
pub mod log_rewrite;
pub mod reset;

use std::path::PathBuf;
use std::sync::Arc;

use lancache_ops::registry::{OperationRegistry, OperationType};
use lancache_ops::state::{OperationState, OperationStateWriter, OperationStatus};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Result;

/// Shared wiring every job needs.
#[derive(Clone)]
pub struct JobContext {
    pub registry: OperationRegistry,
    /// Directory holding per-operation state files.
    pub operations_dir: PathBuf,
}

impl JobContext {
    pub fn new(registry: OperationRegistry, operations_dir: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            operations_dir: operations_dir.into(),
        }
    }

    /// Register a job and open its state file.
    pub fn begin(&self, op_type: OperationType, name: impl Into<String>) -> Arc<JobHandle> {
        let token = CancellationToken::new();
        let name = name.into();
        let id = self.registry.register(op_type, name.clone(), token.clone());

        let mut state = OperationState::new(id.clone(), op_type.as_str());
        state.message = name;
        let writer = OperationStateWriter::new(&self.operations_dir, &id);

        Arc::new(JobHandle {
            id,
            token,
            registry: self.registry.clone(),
            inner: Mutex::new(HandleInner { state, writer }),
        })
    }
}

struct HandleInner {
    state: OperationState,
    writer: OperationStateWriter,
}

/// Live handle for one running job. Shareable across worker threads.
pub struct JobHandle {
    pub id: String,
    pub token: CancellationToken,
    registry: OperationRegistry,
    inner: Mutex<HandleInner>,
}

impl JobHandle {
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Record progress: registry (throttled event) plus state file
    /// (throttled write).
    pub fn progress(&self, percent: f64, message: &str) {
        self.registry.update_progress(&self.id, percent, message);
        let mut inner = self.inner.lock();
        inner.state.percent_complete = inner.state.percent_complete.max(percent.clamp(0.0, 100.0));
        inner.state.message = message.to_string();
        let state = inner.state.clone();
        if let Err(e) = inner.writer.write(&state) {
            debug!("operation state write failed: {e}");
        }
    }

    /// Finish the job: terminal state file write plus the single
    /// completion event. Safe to call once; later calls are no-ops in
    /// the registry.
    pub fn finish(&self, success: bool, error: Option<String>) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            inner.state.status = if self.token.is_cancelled() {
                OperationStatus::Cancelled
            } else if success {
                OperationStatus::Completed
            } else {
                OperationStatus::Failed
            };
            if success {
                inner.state.percent_complete = 100.0;
            }
            if let Some(error) = &error {
                inner.state.message.clone_from(error);
            }
            // Completion events are delivered live; recovery must not
            // re-announce this operation after a restart.
            inner.state.announced = true;
            let state = inner.state.clone();
            inner.writer.write(&state)?;
        }
        self.registry.complete(&self.id, success, error);
        Ok(())
    }

    /// Number of files between cancellation checks on hot loops.
    pub const CANCEL_CHECK_INTERVAL: usize = 64;
}
