//! Job/service lifecycle orchestration.
//!
//! [`TaskOrchestrator`] maps one logical task onto a managed service and a
//! named job on it. Submission precedes registration in the store, which
//! precedes waiting, extraction and finally the teardown decision. Teardown
//! is attempted on every path, including failures, so remote services are
//! not leaked.

use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::remote::{JobState, RemoteExecution, ServiceHandle};
use crate::store::{StateStore, TaskUpdate};
use crate::task::{TaskDescriptor, TaskId, TaskReport, TaskStatus};
use crate::workload::TaskRequest;

mod error;
mod provision;
mod recovery;
mod submit;
mod teardown;
mod wait;

pub use error::TaskError;
pub use teardown::RetireOutcome;
pub use wait::{OUTPUT_TABLE, OutputFile, log_file_name};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_WAITING_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_MAX_RECOVERIES: u32 = 3;

/// Bounded retry with randomised backoff for transient provisioning errors.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Lower bound of the jittered delay.
    pub min_delay: Duration,
    /// Upper bound of the jittered delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(2000),
        }
    }
}

impl RetryPolicy {
    /// Picks the next backoff delay uniformly within the configured bounds.
    #[must_use]
    pub fn next_delay(&self) -> Duration {
        let min = u64::try_from(self.min_delay.as_millis()).unwrap_or(u64::MAX);
        let max = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        if max <= min {
            return self.min_delay;
        }
        Duration::from_millis(rand::rng().random_range(min..=max))
    }
}

/// How the teardown controller decides whether a service is still needed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RetirePolicy {
    /// Retire when the owner has no Submitted or Running task in the store.
    #[default]
    OwnerActiveTasks,
    /// Retire when the live service has no jobs registered.
    ServiceJobs,
}

/// Timing and policy knobs for a [`TaskOrchestrator`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OrchestratorSettings {
    /// Interval between completion polls.
    pub poll_interval: Duration,
    /// Interval between polls while a job is still waiting to start.
    pub waiting_poll_interval: Duration,
    /// Provisioning retry policy.
    pub retry: RetryPolicy,
    /// Optional bound on the synchronous wait; `None` waits indefinitely.
    pub wait_timeout: Option<Duration>,
    /// Teardown policy.
    pub retire_policy: RetirePolicy,
    /// Resubmissions allowed during one synchronous submission.
    pub max_recoveries: u32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            waiting_poll_interval: DEFAULT_WAITING_POLL_INTERVAL,
            retry: RetryPolicy::default(),
            wait_timeout: None,
            retire_policy: RetirePolicy::default(),
            max_recoveries: DEFAULT_MAX_RECOVERIES,
        }
    }
}

/// Result of an administrative cleanup.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct CleanupOutcome {
    /// Task that was cleaned up.
    pub task_id: TaskId,
    /// Whether a stored record was removed.
    pub record_removed: bool,
    /// Whether a remote job was destroyed.
    pub job_destroyed: bool,
}

/// Drives tasks through provisioning, submission, waiting, extraction and
/// teardown.
#[derive(Debug)]
pub struct TaskOrchestrator<R, S> {
    remote: R,
    store: S,
    settings: OrchestratorSettings,
}

impl<R, S> TaskOrchestrator<R, S>
where
    R: RemoteExecution,
    S: StateStore,
{
    /// Creates an orchestrator over the given remote client and store.
    #[must_use]
    pub const fn new(remote: R, store: S, settings: OrchestratorSettings) -> Self {
        Self {
            remote,
            store,
            settings,
        }
    }

    /// Returns the remote client.
    #[must_use]
    pub const fn remote(&self) -> &R {
        &self.remote
    }

    /// Returns the state store.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Returns the active settings.
    #[must_use]
    pub const fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Submits a task and blocks until it reaches a terminal state.
    ///
    /// Failures are folded into a failed report that keeps the task
    /// identifier. The teardown decision runs on every path after the stored
    /// status has been finalised.
    pub async fn submit(&self, request: &TaskRequest, cancel: &CancellationToken) -> TaskReport {
        info!(task_id = %request.task_id, job_name = %request.job_name, "submitting task");
        let report = match self.run_to_completion(request, cancel).await {
            Ok(descriptor) => TaskReport::from_descriptor(&descriptor),
            Err(err) => {
                error!(task_id = %request.task_id, error = %err, "task failed");
                self.mark_failed(&request.task_id);
                TaskReport::failed(request.task_id.clone(), Some(err.to_string()))
            }
        };
        self.retire_quietly(request).await;
        report
    }

    /// Submits a task and returns once the job has left the waiting state.
    pub async fn submit_async(&self, request: &TaskRequest) -> TaskReport {
        info!(task_id = %request.task_id, job_name = %request.job_name, "submitting task asynchronously");
        let launched = match self.launch(request).await {
            Ok(service) => self.wait_until_running(&service, request).await,
            Err(err) => Err(err),
        };
        match launched {
            Ok(()) => TaskReport::running(request.task_id.clone()),
            Err(err) => {
                error!(task_id = %request.task_id, error = %err, "asynchronous submission failed");
                self.mark_failed(&request.task_id);
                self.retire_quietly(request).await;
                TaskReport::failed(request.task_id.clone(), Some(err.to_string()))
            }
        }
    }

    /// Polls a task once without blocking.
    ///
    /// Terminal tasks return their stored result. A task whose job has
    /// finished is extracted and torn down here, once. A task whose service
    /// or job vanished is resubmitted under the same job name, unless its
    /// job had already succeeded, in which case it is completed from the
    /// outputs already in its working directory.
    pub async fn query(&self, task_id: &TaskId) -> TaskReport {
        match self.poll_once(task_id).await {
            Ok(descriptor) => TaskReport::from_descriptor(&descriptor),
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "query failed");
                TaskReport::failed(task_id.clone(), Some(err.to_string()))
            }
        }
    }

    /// Removes a task record and destroys its remote job when it still
    /// exists, then re-evaluates teardown.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError`] when the store or the remote service fails.
    pub async fn cleanup(&self, task_id: &TaskId) -> Result<CleanupOutcome, TaskError> {
        let Some(descriptor) = self.store.find(task_id)? else {
            return Ok(CleanupOutcome {
                task_id: task_id.clone(),
                record_removed: false,
                job_destroyed: false,
            });
        };
        let mut job_destroyed = false;
        if let Some(service) = self.remote.service_from_ref(&descriptor.service).await?
            && let Some(job) = self.remote.get_job(&service, &descriptor.job_name).await?
        {
            self.remote.destroy_job(&service, &job).await?;
            job_destroyed = true;
        }
        let record_removed = self.store.delete(task_id)?;
        info!(task_id = %task_id, record_removed, job_destroyed, "cleaned up task");
        self.retire_quietly(&TaskRequest::from_descriptor(&descriptor))
            .await;
        Ok(CleanupOutcome {
            task_id: task_id.clone(),
            record_removed,
            job_destroyed,
        })
    }

    /// Provisions the service, launches the job and registers the task.
    async fn launch(&self, request: &TaskRequest) -> Result<ServiceHandle, TaskError> {
        let service = self
            .ensure_service(&request.service)
            .await?
            .ok_or_else(|| TaskError::ServiceNotFound {
                service: request.service.name.clone(),
            })?;
        let job = self
            .ensure_job(&service, &request.job_name, &request.inputs)
            .await?;
        let status = if job.state == JobState::Waiting {
            TaskStatus::Submitted
        } else {
            TaskStatus::Running
        };
        self.store.insert(&request.descriptor(status))?;
        info!(task_id = %request.task_id, status = ?status, "registered task");
        Ok(service)
    }

    async fn run_to_completion(
        &self,
        request: &TaskRequest,
        cancel: &CancellationToken,
    ) -> Result<TaskDescriptor, TaskError> {
        let mut service = self.launch(request).await?;
        let mut recoveries = 0;
        loop {
            match self.wait_for_terminal(&service, request, cancel).await {
                Ok(job) => return self.finish(request, &service, &job).await,
                Err(err) if err.is_recoverable() => {
                    if recoveries >= self.settings.max_recoveries {
                        return Err(TaskError::RecoveryExhausted {
                            task_id: request.task_id.clone(),
                            attempts: recoveries,
                        });
                    }
                    recoveries += 1;
                    warn!(task_id = %request.task_id, error = %err, attempt = recoveries, "remote counterpart lost");
                    service = self.recover(request).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn poll_once(&self, task_id: &TaskId) -> Result<TaskDescriptor, TaskError> {
        let descriptor = self
            .store
            .find(task_id)?
            .ok_or_else(|| TaskError::UnknownTask {
                task_id: task_id.clone(),
            })?;
        if descriptor.status.is_terminal() {
            return Ok(descriptor);
        }

        let request = TaskRequest::from_descriptor(&descriptor);
        let job = match self.remote.service_from_ref(&descriptor.service).await? {
            Some(service) => self
                .remote
                .get_job(&service, &request.job_name)
                .await?
                .map(|job| (service, job)),
            None => None,
        };
        let Some((service, job)) = job else {
            if descriptor.status == TaskStatus::Succeeded {
                let finalized = self.finalize_from_workdir(&request);
                self.retire_quietly(&request).await;
                return finalized;
            }
            self.recover(&request).await?;
            return self.current(task_id);
        };

        if job.state.is_in_progress() {
            if job.state == JobState::Running
                && descriptor.status == TaskStatus::Submitted
            {
                self.store
                    .update(task_id, &TaskUpdate::status(TaskStatus::Running))?;
            }
            return self.current(task_id);
        }

        let finished = self.finish(&request, &service, &job).await;
        if finished.is_err() {
            self.mark_failed(task_id);
        }
        self.retire_quietly(&request).await;
        finished
    }

    fn current(&self, task_id: &TaskId) -> Result<TaskDescriptor, TaskError> {
        self.store
            .find(task_id)?
            .ok_or_else(|| TaskError::UnknownTask {
                task_id: task_id.clone(),
            })
    }

    fn mark_failed(&self, task_id: &TaskId) {
        let result = self.store.find(task_id).and_then(|found| match found {
            Some(descriptor) if !descriptor.status.is_terminal() => self
                .store
                .update(task_id, &TaskUpdate::status(TaskStatus::Failed))
                .map(|_| ()),
            _ => Ok(()),
        });
        if let Err(err) = result {
            warn!(task_id = %task_id, error = %err, "unable to record task failure");
        }
    }

    async fn retire_quietly(&self, request: &TaskRequest) {
        if let Err(err) = self.maybe_retire(&request.service, &request.owner).await {
            warn!(service = %request.service.name, error = %err, "teardown failed");
        }
    }
}

#[cfg(test)]
mod tests;
