//! Resubmission of tasks whose remote counterpart disappeared.

use tracing::warn;

use super::{TaskError, TaskOrchestrator};
use crate::remote::{RemoteExecution, ServiceHandle};
use crate::store::StateStore;
use crate::task::{TaskDescriptor, TaskStatus};
use crate::workload::TaskRequest;

impl<R, S> TaskOrchestrator<R, S>
where
    R: RemoteExecution,
    S: StateStore,
{
    /// Discards the stale record and reruns provisioning and submission
    /// under the same task identifier and job name.
    ///
    /// This is a full restart: any partial remote state is abandoned rather
    /// than reconciled. When the relaunch fails the previous record is put
    /// back, so the task stays queryable and a later attempt can retry.
    pub(super) async fn recover(&self, request: &TaskRequest) -> Result<ServiceHandle, TaskError> {
        let stale = self.store.find(&request.task_id)?;
        let removed = self.store.delete(&request.task_id)?;
        warn!(
            task_id = %request.task_id,
            job_name = %request.job_name,
            removed,
            "resubmitting task after losing its service or job"
        );
        match self.launch(request).await {
            Ok(service) => Ok(service),
            Err(err) => {
                self.restore(request, stale);
                Err(err)
            }
        }
    }

    fn restore(&self, request: &TaskRequest, stale: Option<TaskDescriptor>) {
        let descriptor = stale.unwrap_or_else(|| request.descriptor(TaskStatus::Failed));
        let restored = match self.store.find(&request.task_id) {
            Ok(Some(_)) => Ok(()),
            Ok(None) => self.store.insert(&descriptor),
            Err(err) => Err(err),
        };
        if let Err(err) = restored {
            warn!(task_id = %request.task_id, error = %err, "unable to restore task record after failed resubmission");
        }
    }
}
