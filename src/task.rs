//! Task model shared by the orchestrator, the state store and the CLI.
//!
//! A [`TaskDescriptor`] is the durable record tying one logical task to a
//! managed service and a named job on that service. The job name is derived
//! from the task identifier alone so a crashed process can always find (or
//! recreate) the same job again.

use std::collections::BTreeMap;
use std::fmt;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::files::serialize_value;

/// Default TCP port exposed by the managed job service.
pub const DEFAULT_SERVICE_PORT: u16 = 29593;

/// Prefix applied to every job name derived from a task identifier.
const JOB_NAME_PREFIX: &str = "simrelay-";

/// Opaque, immutable task identifier.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generates a fresh identifier. Identifiers are never reused.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Wraps an existing identifier, typically one read back from a caller.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into().trim().to_owned())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives the remote job name for a task.
///
/// This is a pure function of the task identifier so retries and recovery
/// always address the same remote job.
#[must_use]
pub fn job_name_for(task_id: &TaskId) -> String {
    format!("{JOB_NAME_PREFIX}{}", task_id.as_str())
}

/// Lifecycle state of a task as persisted in the state store.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// The job has been launched but has not been observed running.
    Submitted,
    /// The job is waiting or running on the remote service.
    Running,
    /// The remote job succeeded; outputs have not been extracted yet.
    Succeeded,
    /// The remote job reached a non-success terminal state.
    Failed,
    /// Outputs were extracted and `results` is final.
    Completed,
    /// The remote job reported a state this crate does not recognise.
    Unknown,
}

impl TaskStatus {
    /// Returns `true` when a remote job is expected to exist and still be
    /// making progress.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Submitted | Self::Running)
    }

    /// Returns `true` once no further transitions will happen.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Completed | Self::Unknown)
    }

    /// Maps the internal status onto the externally reported status.
    #[must_use]
    pub const fn reported(self) -> ReportedStatus {
        match self {
            Self::Submitted | Self::Running | Self::Succeeded => ReportedStatus::Running,
            Self::Completed => ReportedStatus::Completed,
            Self::Failed | Self::Unknown => ReportedStatus::Failed,
        }
    }
}

/// Status exposed to callers of the inbound operations.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportedStatus {
    /// The task is still in flight.
    Running,
    /// The task finished and its results are available.
    Completed,
    /// The task failed; inspect the working directory for diagnostics.
    Failed,
}

/// Workload classification, decided by the presence of the primary input.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum JobType {
    /// Ligand in solvent; no primary structural input.
    #[serde(rename = "solvent_ligand_md")]
    SolventLigand,
    /// Protein-ligand complex in solvent.
    #[serde(rename = "protein_ligand_md")]
    ProteinLigand,
}

impl JobType {
    /// Classifies a workload by whether the primary structural input exists.
    #[must_use]
    pub const fn from_primary_present(primary_present: bool) -> Self {
        if primary_present {
            Self::ProteinLigand
        } else {
            Self::SolventLigand
        }
    }

    /// File name of the workflow document used for this workload.
    #[must_use]
    pub const fn workflow_file(self) -> &'static str {
        match self {
            Self::SolventLigand => "solvent_ligand.cwl",
            Self::ProteinLigand => "protein_ligand.cwl",
        }
    }
}

/// Reference to credentials without embedding the secret itself.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CredentialsRef {
    /// Account name on the compute resource behind the service.
    pub username: String,
    /// Environment variable that holds the password at provisioning time.
    pub password_env: String,
}

/// Everything needed to reconstruct a handle to a managed service.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ServiceRef {
    /// Unique service name; at most one live service exists per name.
    pub name: String,
    /// Host on which the service endpoint is published.
    pub host: String,
    /// Published port of the service endpoint.
    pub port: u16,
    /// Container image providing the service.
    pub image: String,
    /// Optional credentials forwarded to the service.
    pub credentials: Option<CredentialsRef>,
}

impl ServiceRef {
    /// Base URL of the service's REST endpoint.
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// A named input file attached to a job.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NamedInput {
    /// Input name declared by the workflow.
    pub name: String,
    /// Local path of the materialised file.
    pub path: Utf8PathBuf,
}

/// Auxiliary files that accompany one of the named inputs.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct SecondaryFiles {
    /// Name of the input the files are attached to.
    pub anchor: String,
    /// Local paths of the auxiliary files.
    pub paths: Vec<Utf8PathBuf>,
}

/// Complete input set for a job, persisted so recovery can resubmit.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobInputs {
    /// Workflow document executed by the service.
    pub workflow: Utf8PathBuf,
    /// Declared input files, attached in order.
    pub files: Vec<NamedInput>,
    /// Primary structural input; absent for reduced-input workloads.
    pub primary: Option<NamedInput>,
    /// Auxiliary files for one of the declared inputs.
    #[serde(default)]
    pub secondary: Option<SecondaryFiles>,
    /// Scalar workflow parameters.
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// Durable orchestration record for one task.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Primary key; assigned before any remote resource exists.
    pub task_id: TaskId,
    /// Requester identity, scoping teardown reference counting.
    pub owner: String,
    /// Service the job runs on.
    pub service: ServiceRef,
    /// Remote job name, always `job_name_for(task_id)`.
    pub job_name: String,
    /// Workload classification.
    pub job_type: JobType,
    /// Local directory holding inputs, outputs and the execution log.
    pub workdir: Utf8PathBuf,
    /// Destroy the remote job once outputs are extracted.
    pub clean_remote: bool,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Logical output name to local file; set once on completion.
    #[serde(default)]
    pub results: BTreeMap<String, Utf8PathBuf>,
    /// Inputs used to (re)submit the job.
    pub inputs: JobInputs,
}

/// Structured result returned by every inbound operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    /// Externally visible status.
    pub status: ReportedStatus,
    /// Task identifier, preserved even on failure.
    pub task_id: TaskId,
    /// Serialised output files keyed by logical output name.
    #[serde(default)]
    pub results: BTreeMap<String, Value>,
    /// Human readable failure cause, when the infrastructure failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskReport {
    /// Report for a task that is still in flight.
    #[must_use]
    pub const fn running(task_id: TaskId) -> Self {
        Self {
            status: ReportedStatus::Running,
            task_id,
            results: BTreeMap::new(),
            error: None,
        }
    }

    /// Report for a failed task with an optional cause.
    #[must_use]
    pub const fn failed(task_id: TaskId, error: Option<String>) -> Self {
        Self {
            status: ReportedStatus::Failed,
            task_id,
            results: BTreeMap::new(),
            error,
        }
    }

    /// Builds a report from a stored descriptor, serialising its results.
    #[must_use]
    pub fn from_descriptor(descriptor: &TaskDescriptor) -> Self {
        let status = descriptor.status.reported();
        let results = if status == ReportedStatus::Completed {
            descriptor
                .results
                .iter()
                .map(|(name, path)| {
                    let value = serialize_value(Value::String(path.to_string()));
                    (name.clone(), value)
                })
                .collect()
        } else {
            BTreeMap::new()
        };
        Self {
            status,
            task_id: descriptor.task_id.clone(),
            results,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn job_name_is_a_pure_function_of_task_id() {
        let task_id = TaskId::new("abc123");
        assert_eq!(job_name_for(&task_id), job_name_for(&TaskId::new("abc123")));
        assert_eq!(job_name_for(&task_id), "simrelay-abc123");
    }

    #[rstest]
    fn generated_task_ids_are_unique() {
        assert_ne!(TaskId::generate(), TaskId::generate());
    }

    #[rstest]
    #[case(TaskStatus::Submitted, ReportedStatus::Running, true)]
    #[case(TaskStatus::Running, ReportedStatus::Running, true)]
    #[case(TaskStatus::Succeeded, ReportedStatus::Running, false)]
    #[case(TaskStatus::Completed, ReportedStatus::Completed, false)]
    #[case(TaskStatus::Failed, ReportedStatus::Failed, false)]
    #[case(TaskStatus::Unknown, ReportedStatus::Failed, false)]
    fn status_maps_to_reported_status(
        #[case] status: TaskStatus,
        #[case] reported: ReportedStatus,
        #[case] active: bool,
    ) {
        assert_eq!(status.reported(), reported);
        assert_eq!(status.is_active(), active);
    }

    #[rstest]
    fn job_type_follows_primary_input() {
        assert_eq!(JobType::from_primary_present(true), JobType::ProteinLigand);
        assert_eq!(JobType::from_primary_present(false), JobType::SolventLigand);
        assert_eq!(
            JobType::SolventLigand.workflow_file(),
            "solvent_ligand.cwl"
        );
    }

    #[rstest]
    fn reported_status_serialises_lowercase() {
        let report = TaskReport::running(TaskId::new("t1"));
        let json = serde_json::to_value(&report).expect("serialise report");
        assert_eq!(json["status"], "running");
        assert_eq!(json["task_id"], "t1");
        assert!(json.get("error").is_none());
    }
}
