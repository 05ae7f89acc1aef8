//! Completion waiting, output extraction and execution logs.

use std::collections::BTreeMap;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde_json::json;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{TaskError, TaskOrchestrator};
use crate::files;
use crate::remote::{JobState, RemoteExecution, RemoteJob, ServiceHandle};
use crate::store::{StateStore, TaskUpdate};
use crate::task::{TaskDescriptor, TaskId, TaskStatus};
use crate::workload::TaskRequest;

/// Logical output name and the extension of its local file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OutputFile {
    /// Output name exposed by the job.
    pub name: &'static str,
    /// Extension, including the dot, of the local copy.
    pub extension: &'static str,
}

const fn output(name: &'static str, extension: &'static str) -> OutputFile {
    OutputFile { name, extension }
}

/// Every output the workflows may produce. Each workload keeps whichever
/// subset its job exposes.
pub const OUTPUT_TABLE: &[OutputFile] = &[
    output("gromitout", ".out"),
    output("gromiterr", ".err"),
    output("gromacslog2", ".out"),
    output("gromacslog3", ".out"),
    output("gromacslog4", ".out"),
    output("gromacslog5", ".out"),
    output("gromacslog6", ".out"),
    output("gromacslog7", ".out"),
    output("gromacslog8", ".out"),
    output("gromacslog9", ".out"),
    output("energy_edr", ".edr"),
    output("energy_dataframe", ".ene"),
    output("energyout", ".out"),
    output("energyerr", ".err"),
    output("decompose_dataframe", ".ene"),
    output("decompose_err", ".err"),
    output("decompose_out", ".out"),
];

/// Name of the execution log written into a task's working directory.
#[must_use]
pub fn log_file_name(task_id: &TaskId) -> String {
    format!("{task_id}.log")
}

impl<R, S> TaskOrchestrator<R, S>
where
    R: RemoteExecution,
    S: StateStore,
{
    /// Polls the job until it leaves the in-progress states.
    pub(super) async fn wait_for_terminal(
        &self,
        service: &ServiceHandle,
        request: &TaskRequest,
        cancel: &CancellationToken,
    ) -> Result<RemoteJob, TaskError> {
        let deadline = self
            .settings
            .wait_timeout
            .map(|timeout| Instant::now() + timeout);
        let mut last_state = None;
        loop {
            let job = self.poll_job(service, &request.job_name).await?;
            if last_state != Some(job.state) {
                info!(task_id = %request.task_id, job_name = %request.job_name, state = ?job.state, "job state changed");
                if job.state == JobState::Running {
                    self.store
                        .update(&request.task_id, &TaskUpdate::status(TaskStatus::Running))?;
                }
                last_state = Some(job.state);
            }
            if !job.state.is_in_progress() {
                return Ok(job);
            }
            self.pause(self.settings.poll_interval, deadline, &request.task_id, cancel)
                .await?;
        }
    }

    /// Polls while the job is still waiting to start, then records it as
    /// running.
    pub(super) async fn wait_until_running(
        &self,
        service: &ServiceHandle,
        request: &TaskRequest,
    ) -> Result<(), TaskError> {
        let deadline = self
            .settings
            .wait_timeout
            .map(|timeout| Instant::now() + timeout);
        let never = CancellationToken::new();
        loop {
            let job = self.poll_job(service, &request.job_name).await?;
            match job.state {
                JobState::Waiting => {
                    debug!(job_name = %request.job_name, "job still waiting to start");
                    self.pause(
                        self.settings.waiting_poll_interval,
                        deadline,
                        &request.task_id,
                        &never,
                    )
                    .await?;
                }
                JobState::Running => {
                    self.store
                        .update(&request.task_id, &TaskUpdate::status(TaskStatus::Running))?;
                    info!(task_id = %request.task_id, "job is running");
                    return Ok(());
                }
                state => {
                    info!(task_id = %request.task_id, state = ?state, "job finished before it was observed running");
                    return Ok(());
                }
            }
        }
    }

    async fn poll_job(
        &self,
        service: &ServiceHandle,
        job_name: &str,
    ) -> Result<RemoteJob, TaskError> {
        match self.remote.get_job(service, job_name).await {
            Ok(Some(job)) => Ok(job),
            Ok(None) => Err(TaskError::JobNotFound {
                job_name: job_name.to_owned(),
            }),
            Err(err) => {
                if self
                    .remote
                    .service_from_ref(&service.service)
                    .await?
                    .is_none()
                {
                    return Err(TaskError::ServiceNotFound {
                        service: service.service.name.clone(),
                    });
                }
                Err(err.into())
            }
        }
    }

    async fn pause(
        &self,
        interval: Duration,
        deadline: Option<Instant>,
        task_id: &TaskId,
        cancel: &CancellationToken,
    ) -> Result<(), TaskError> {
        let nap = deadline.map_or(interval, |limit| {
            interval.min(limit.saturating_duration_since(Instant::now()))
        });
        tokio::select! {
            () = cancel.cancelled() => Err(TaskError::Cancelled {
                task_id: task_id.clone(),
            }),
            () = sleep(nap) => match (deadline, self.settings.wait_timeout) {
                (Some(limit), Some(timeout)) if Instant::now() >= limit => Err(TaskError::TimedOut {
                    task_id: task_id.clone(),
                    timeout,
                }),
                _ => Ok(()),
            },
        }
    }

    /// Extracts outputs, writes the execution log, records the terminal
    /// status and then optionally destroys the remote job.
    pub(super) async fn finish(
        &self,
        request: &TaskRequest,
        service: &ServiceHandle,
        job: &RemoteJob,
    ) -> Result<TaskDescriptor, TaskError> {
        let succeeded = job.state == JobState::Success;
        if succeeded {
            self.store
                .update(&request.task_id, &TaskUpdate::status(TaskStatus::Succeeded))?;
        }

        let results = self.extract_outputs(service, job, request).await;
        self.write_log(service, job, request).await?;

        let update = if succeeded {
            TaskUpdate::completed(results)
        } else {
            let failure = TaskError::RemoteJobFailed {
                job_name: job.name.clone(),
                state: job.state,
            };
            warn!(task_id = %request.task_id, error = %failure, "remote job did not succeed");
            let status = if job.state == JobState::Unknown {
                TaskStatus::Unknown
            } else {
                TaskStatus::Failed
            };
            TaskUpdate::status(status)
        };
        let descriptor = self
            .store
            .update(&request.task_id, &update)?
            .ok_or_else(|| TaskError::UnknownTask {
                task_id: request.task_id.clone(),
            })?;

        if request.clean_remote {
            match self.remote.destroy_job(service, job).await {
                Ok(()) => debug!(job_name = %job.name, "destroyed remote job"),
                Err(err) => warn!(job_name = %job.name, error = %err, "unable to destroy remote job"),
            }
        }
        Ok(descriptor)
    }

    /// Completes a task whose outputs were already copied into its working
    /// directory but whose remote job is gone.
    pub(super) fn finalize_from_workdir(
        &self,
        request: &TaskRequest,
    ) -> Result<TaskDescriptor, TaskError> {
        let results: BTreeMap<String, Utf8PathBuf> = OUTPUT_TABLE
            .iter()
            .map(|entry| (entry.name.to_owned(), local_path(&request.workdir, entry)))
            .filter(|(_, path)| files::is_file(path))
            .collect();
        info!(task_id = %request.task_id, outputs = results.len(), "completing task from previously extracted outputs");
        self.store
            .update(&request.task_id, &TaskUpdate::completed(results))?
            .ok_or_else(|| TaskError::UnknownTask {
                task_id: request.task_id.clone(),
            })
    }

    async fn extract_outputs(
        &self,
        service: &ServiceHandle,
        job: &RemoteJob,
        request: &TaskRequest,
    ) -> BTreeMap<String, Utf8PathBuf> {
        let mut results = BTreeMap::new();
        for entry in OUTPUT_TABLE {
            if !job.has_output(entry.name) {
                debug!(output = entry.name, "output not produced");
                continue;
            }
            let destination = local_path(&request.workdir, entry);
            match self
                .remote
                .save_output(service, job, entry.name, &destination)
                .await
            {
                Ok(()) if files::is_file(&destination) => {
                    results.insert(entry.name.to_owned(), destination);
                }
                Ok(()) => {
                    warn!(output = entry.name, path = %destination, "extraction incomplete: file missing after copy");
                }
                Err(err) => {
                    warn!(output = entry.name, error = %err, "extraction incomplete");
                }
            }
        }
        results
    }

    async fn write_log(
        &self,
        service: &ServiceHandle,
        job: &RemoteJob,
        request: &TaskRequest,
    ) -> Result<(), TaskError> {
        let log = match self.remote.job_log(service, job).await {
            Ok(log) => Some(log),
            Err(err) => {
                warn!(job_name = %job.name, error = %err, "unable to fetch job log");
                None
            }
        };
        let document = json!({
            "task_id": request.task_id,
            "job_name": job.name,
            "job_id": job.id,
            "state": format!("{:?}", job.state),
            "log": log,
        });
        let name = log_file_name(&request.task_id);
        let path = request.workdir.join(&name);
        write_json(&request.workdir, &name, &document).map_err(|err| TaskError::Io {
            path: path.clone(),
            message: err.to_string(),
        })?;
        info!(task_id = %request.task_id, path = %path, "wrote execution log");
        Ok(())
    }
}

fn local_path(workdir: &Utf8Path, entry: &OutputFile) -> Utf8PathBuf {
    workdir.join(format!("{}{}", entry.name, entry.extension))
}

fn write_json(dir: &Utf8Path, name: &str, document: &serde_json::Value) -> std::io::Result<()> {
    let rendered = serde_json::to_string_pretty(document)?;
    Dir::open_ambient_dir(dir, ambient_authority())?.write(name, rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn output_names_are_unique() {
        let mut names: Vec<_> = OUTPUT_TABLE.iter().map(|entry| entry.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), OUTPUT_TABLE.len());
    }

    #[rstest]
    fn log_file_is_named_after_task() {
        assert_eq!(log_file_name(&TaskId::new("abc")), "abc.log");
    }
}
