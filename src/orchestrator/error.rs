//! Error taxonomy for task orchestration.

use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::remote::{JobState, RemoteError};
use crate::store::StoreError;
use crate::task::TaskId;

/// Errors raised while driving a task through its lifecycle.
///
/// Inbound operations never return these directly; they are folded into a
/// failed [`crate::task::TaskReport`] carrying the message.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Service provisioning kept failing after every retry.
    #[error("provisioning service {service} failed after {attempts} attempts: {message}")]
    ProvisioningFailed {
        /// Service name.
        service: String,
        /// Attempts made.
        attempts: u32,
        /// Last runtime error message.
        message: String,
    },
    /// No live service exists for the stored reference.
    #[error("service {service} not found")]
    ServiceNotFound {
        /// Service name.
        service: String,
    },
    /// No job with the expected name exists on the service.
    #[error("job {job_name} not found")]
    JobNotFound {
        /// Job name.
        job_name: String,
    },
    /// The state store could not be reached or returned an error.
    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),
    /// The remote job ended in a non-success state.
    #[error("job {job_name} finished in state {state:?}")]
    RemoteJobFailed {
        /// Job name.
        job_name: String,
        /// Terminal state reported by the service.
        state: JobState,
    },
    /// The remote service returned an error.
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// Local file access failed.
    #[error("failed to write {path}: {message}")]
    Io {
        /// Path involved.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// The wait was aborted through its cancellation token.
    #[error("wait for task {task_id} was cancelled")]
    Cancelled {
        /// Task whose wait was aborted.
        task_id: TaskId,
    },
    /// The synchronous wait exceeded its configured bound.
    #[error("task {task_id} did not finish within {timeout:?}")]
    TimedOut {
        /// Task whose wait expired.
        task_id: TaskId,
        /// Configured bound.
        timeout: Duration,
    },
    /// The remote counterpart kept disappearing.
    #[error("task {task_id} could not be recovered after {attempts} resubmissions")]
    RecoveryExhausted {
        /// Task being recovered.
        task_id: TaskId,
        /// Resubmissions made.
        attempts: u32,
    },
    /// No record exists for the requested task.
    #[error("unknown task {task_id}")]
    UnknownTask {
        /// Requested identifier.
        task_id: TaskId,
    },
}

impl TaskError {
    /// Returns `true` for conditions handled by resubmitting the task.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ServiceNotFound { .. } | Self::JobNotFound { .. }
        )
    }
}
