//! Capability interface to the remote execution service.
//!
//! A managed service hosts any number of named jobs. Expected absence (no
//! such service, no such job) is reported as `Ok(None)`; errors are reserved
//! for genuinely exceptional conditions.

use std::future::Future;
use std::pin::Pin;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::task::ServiceRef;

/// Future returned by remote operations.
pub type RemoteFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RemoteError>> + Send + 'a>>;

/// Lifecycle state reported by the remote service for a job.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobState {
    /// Accepted, not yet started.
    Waiting,
    /// Executing.
    Running,
    /// Finished successfully.
    Success,
    /// Cancelled by a user or the service.
    Cancelled,
    /// Failed and will not succeed on retry.
    PermanentFailure,
    /// Failed, possibly transiently.
    TemporaryFailure,
    /// The service itself failed while running the job.
    SystemError,
    /// Any state the service reports that is not listed above.
    Unknown,
}

impl JobState {
    /// Parses a state name as reported by the service, case-insensitively.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "waiting" => Self::Waiting,
            "running" => Self::Running,
            "success" => Self::Success,
            "cancelled" => Self::Cancelled,
            "permanentfailure" => Self::PermanentFailure,
            "temporaryfailure" => Self::TemporaryFailure,
            "systemerror" => Self::SystemError,
            _ => Self::Unknown,
        }
    }

    /// Returns `true` while the job may still make progress.
    #[must_use]
    pub const fn is_in_progress(self) -> bool {
        matches!(self, Self::Waiting | Self::Running)
    }

    /// States in which an existing job is resumed rather than recreated.
    #[must_use]
    pub const fn is_reusable(self) -> bool {
        matches!(self, Self::Waiting | Self::Running | Self::Success)
    }
}

/// Live handle to a managed service.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServiceHandle {
    /// Descriptor the handle was built from.
    pub service: ServiceRef,
    /// Runtime identifier of the service instance (for example a container id).
    pub instance_id: String,
}

impl ServiceHandle {
    /// Starts a local job draft; nothing is sent until the draft is run.
    #[must_use]
    pub fn create_job(&self, name: impl Into<String>) -> JobDraft {
        JobDraft::new(name)
    }
}

/// Snapshot of a job on the service.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteJob {
    /// Service-assigned identifier.
    pub id: String,
    /// Caller-chosen job name.
    pub name: String,
    /// State at the time of the snapshot.
    pub state: JobState,
    /// Names of the outputs the job currently exposes.
    pub outputs: Vec<String>,
}

impl RemoteJob {
    /// Returns `true` when the job exposes an output named `name`.
    #[must_use]
    pub fn has_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|output| output == name)
    }
}

/// A job being assembled before launch.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct JobDraft {
    name: String,
    workflow: Option<Utf8PathBuf>,
    input_files: Vec<(String, Utf8PathBuf)>,
    secondary_files: Vec<(String, Utf8PathBuf)>,
    parameters: Map<String, Value>,
}

impl JobDraft {
    /// Creates an empty draft for the named job.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the workflow document the job executes.
    pub fn set_workflow(&mut self, workflow: &Utf8Path) {
        self.workflow = Some(workflow.to_path_buf());
    }

    /// Attaches a named input file.
    pub fn add_input_file(&mut self, name: impl Into<String>, path: &Utf8Path) {
        self.input_files.push((name.into(), path.to_path_buf()));
    }

    /// Attaches an auxiliary file to a previously added input.
    pub fn add_secondary_file(&mut self, anchor: impl Into<String>, path: &Utf8Path) {
        self.secondary_files.push((anchor.into(), path.to_path_buf()));
    }

    /// Sets a scalar workflow parameter.
    pub fn set_input(&mut self, key: impl Into<String>, value: Value) {
        self.parameters.insert(key.into(), value);
    }

    /// Job name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Workflow document, if set.
    #[must_use]
    pub fn workflow(&self) -> Option<&Utf8Path> {
        self.workflow.as_deref()
    }

    /// Attached input files in attachment order.
    #[must_use]
    pub fn input_files(&self) -> &[(String, Utf8PathBuf)] {
        &self.input_files
    }

    /// Attached auxiliary files as `(anchor, path)` pairs.
    #[must_use]
    pub fn secondary_files(&self) -> &[(String, Utf8PathBuf)] {
        &self.secondary_files
    }

    /// Scalar parameters.
    #[must_use]
    pub const fn parameters(&self) -> &Map<String, Value> {
        &self.parameters
    }
}

/// Errors raised by remote execution clients.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RemoteError {
    /// Transient failure while creating or starting a managed service.
    #[error("failed to provision service {service}: {message}")]
    Provisioning {
        /// Service name.
        service: String,
        /// Runtime error message.
        message: String,
    },
    /// The container runtime failed outside provisioning.
    #[error("service runtime error: {message}")]
    Runtime {
        /// Runtime error message.
        message: String,
    },
    /// The service API rejected a request or could not be reached.
    #[error("service API error: {message}")]
    Api {
        /// Transport or status error message.
        message: String,
    },
    /// The service answered with something that could not be understood.
    #[error("unexpected service response: {message}")]
    InvalidResponse {
        /// Parser error message.
        message: String,
    },
    /// Local file access failed while uploading or downloading.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Local path involved.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
}

impl RemoteError {
    /// Returns `true` for errors worth retrying with backoff.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Provisioning { .. })
    }
}

/// Operations the orchestrator needs from a remote execution service.
pub trait RemoteExecution: Send + Sync {
    /// Returns a live service for `service`, creating or starting it when
    /// necessary. `Ok(None)` means the runtime accepted the request but no
    /// usable handle could be obtained.
    fn require_service<'a>(
        &'a self,
        service: &'a ServiceRef,
    ) -> RemoteFuture<'a, Option<ServiceHandle>>;

    /// Reconstructs a handle to an already running service.
    fn service_from_ref<'a>(
        &'a self,
        service: &'a ServiceRef,
    ) -> RemoteFuture<'a, Option<ServiceHandle>>;

    /// Lists every job registered on the service.
    fn list_jobs<'a>(&'a self, service: &'a ServiceHandle) -> RemoteFuture<'a, Vec<RemoteJob>>;

    /// Looks a job up by name.
    fn get_job<'a>(
        &'a self,
        service: &'a ServiceHandle,
        name: &'a str,
    ) -> RemoteFuture<'a, Option<RemoteJob>>;

    /// Uploads the draft's inputs and launches it.
    fn run<'a>(&'a self, service: &'a ServiceHandle, draft: JobDraft)
    -> RemoteFuture<'a, RemoteJob>;

    /// Fetches the job's execution log.
    fn job_log<'a>(
        &'a self,
        service: &'a ServiceHandle,
        job: &'a RemoteJob,
    ) -> RemoteFuture<'a, String>;

    /// Copies output `output` of `job` to `destination`.
    fn save_output<'a>(
        &'a self,
        service: &'a ServiceHandle,
        job: &'a RemoteJob,
        output: &'a str,
        destination: &'a Utf8Path,
    ) -> RemoteFuture<'a, ()>;

    /// Removes the job and its remote artifacts.
    fn destroy_job<'a>(
        &'a self,
        service: &'a ServiceHandle,
        job: &'a RemoteJob,
    ) -> RemoteFuture<'a, ()>;

    /// Stops the managed service.
    fn stop_service<'a>(&'a self, service: &'a ServiceHandle) -> RemoteFuture<'a, ()>;

    /// Destroys the managed service.
    fn destroy_service<'a>(&'a self, service: &'a ServiceHandle) -> RemoteFuture<'a, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("Waiting", JobState::Waiting)]
    #[case("running", JobState::Running)]
    #[case("Success", JobState::Success)]
    #[case("PermanentFailure", JobState::PermanentFailure)]
    #[case("SystemError", JobState::SystemError)]
    #[case("Exploded", JobState::Unknown)]
    fn parses_service_states(#[case] raw: &str, #[case] expected: JobState) {
        assert_eq!(JobState::parse(raw), expected);
    }

    #[rstest]
    fn draft_records_inputs_in_order() {
        let mut draft = JobDraft::new("job-1");
        draft.add_input_file("ligand_file", Utf8Path::new("/w/ligand.pdb"));
        draft.add_input_file("topology_file", Utf8Path::new("/w/ligand.itp"));
        draft.add_secondary_file("protein_top", Utf8Path::new("/w/attype.itp"));
        draft.set_input("sim_time", Value::from(0.001));

        assert_eq!(draft.name(), "job-1");
        assert_eq!(draft.input_files().len(), 2);
        assert_eq!(draft.input_files()[0].0, "ligand_file");
        assert_eq!(draft.secondary_files()[0].0, "protein_top");
        assert!(draft.parameters().contains_key("sim_time"));
    }

    #[rstest]
    fn only_provisioning_errors_are_transient() {
        let provisioning = RemoteError::Provisioning {
            service: String::from("svc"),
            message: String::from("port in use"),
        };
        let api = RemoteError::Api {
            message: String::from("500"),
        };
        assert!(provisioning.is_transient());
        assert!(!api.is_transient());
    }
}
