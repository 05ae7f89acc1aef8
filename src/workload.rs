//! Inbound workload requests and their conversion into task requests.
//!
//! Validation happens here, at the boundary, so orchestration code only ever
//! sees a complete [`TaskRequest`].

use std::collections::BTreeMap;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::info;

use crate::config::RelayConfig;
use crate::files::{FileError, SerializedFile, materialize};
use crate::task::{
    JobInputs, JobType, NamedInput, SecondaryFiles, ServiceRef, TaskDescriptor, TaskId,
    TaskStatus, job_name_for,
};

/// Input name under which the primary structural input is attached.
pub const PRIMARY_INPUT_NAME: &str = "protein_file";
/// Input that auxiliary include files accompany by default.
pub const DEFAULT_INCLUDE_ANCHOR: &str = "protein_top";
/// Snapshot of the effective request written into each task directory.
pub const TASK_SNAPSHOT_FILE: &str = "task.json";

const fn default_clean_remote() -> bool {
    true
}

fn default_include_anchor() -> String {
    DEFAULT_INCLUDE_ANCHOR.to_owned()
}

/// Per-request overrides of the configured service.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct ServiceOverrides {
    /// Service name override.
    pub name: Option<String>,
    /// Image override.
    pub image: Option<String>,
    /// Host override.
    pub host: Option<String>,
    /// Port override.
    pub port: Option<u16>,
}

/// Workload as submitted by a caller.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct WorkloadSpec {
    /// Existing base directory; a per-task directory is created inside it.
    pub workdir: Utf8PathBuf,
    /// Requester identity; the configured owner is used when absent.
    #[serde(default)]
    pub owner: Option<String>,
    /// Optional service overrides.
    #[serde(default)]
    pub service: Option<ServiceOverrides>,
    /// Declared input files keyed by workflow input name.
    #[serde(default)]
    pub inputs: BTreeMap<String, SerializedFile>,
    /// Primary structural input; absent for solvent-only workloads.
    #[serde(default, alias = "protein_file")]
    pub primary: Option<SerializedFile>,
    /// Auxiliary files that travel with the include anchor input.
    #[serde(default)]
    pub include: Vec<SerializedFile>,
    /// Input the include files are attached to.
    #[serde(default = "default_include_anchor")]
    pub include_anchor: String,
    /// Scalar workflow parameters.
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Destroy the remote job once outputs are extracted.
    #[serde(default = "default_clean_remote", alias = "clean_remote_workdir")]
    pub clean_remote: bool,
}

/// Defaults applied to every workload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkloadDefaults {
    /// Owner used when the request names none.
    pub owner: String,
    /// Service used when the request does not override it.
    pub service: ServiceRef,
    /// Directory containing the workflow documents.
    pub workflows_dir: Utf8PathBuf,
}

impl WorkloadDefaults {
    /// Derives defaults from the relay configuration.
    #[must_use]
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            owner: config.owner.trim().to_owned(),
            service: config.service_ref(),
            workflows_dir: config.workflows_path(),
        }
    }
}

/// Immutable request-scoped configuration passed into every orchestration
/// step.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct TaskRequest {
    /// Identifier assigned before any remote resource exists.
    pub task_id: TaskId,
    /// Requester identity.
    pub owner: String,
    /// Target service.
    pub service: ServiceRef,
    /// Remote job name derived from `task_id`.
    pub job_name: String,
    /// Workload classification.
    pub job_type: JobType,
    /// Per-task working directory.
    pub workdir: Utf8PathBuf,
    /// Destroy the remote job once outputs are extracted.
    pub clean_remote: bool,
    /// Materialised job inputs.
    pub inputs: JobInputs,
}

impl TaskRequest {
    /// Builds the descriptor persisted for this request.
    #[must_use]
    pub fn descriptor(&self, status: TaskStatus) -> TaskDescriptor {
        TaskDescriptor {
            task_id: self.task_id.clone(),
            owner: self.owner.clone(),
            service: self.service.clone(),
            job_name: self.job_name.clone(),
            job_type: self.job_type,
            workdir: self.workdir.clone(),
            clean_remote: self.clean_remote,
            status,
            results: BTreeMap::new(),
            inputs: self.inputs.clone(),
        }
    }

    /// Rebuilds the request from a stored descriptor, keeping its identity.
    #[must_use]
    pub fn from_descriptor(descriptor: &TaskDescriptor) -> Self {
        Self {
            task_id: descriptor.task_id.clone(),
            owner: descriptor.owner.clone(),
            service: descriptor.service.clone(),
            job_name: job_name_for(&descriptor.task_id),
            job_type: descriptor.job_type,
            workdir: descriptor.workdir.clone(),
            clean_remote: descriptor.clean_remote,
            inputs: descriptor.inputs.clone(),
        }
    }
}

/// Errors raised while preparing a workload.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum WorkloadError {
    /// Raised when the base working directory does not exist.
    #[error("workdir does not exist: {path}")]
    WorkdirMissing {
        /// Missing directory.
        path: Utf8PathBuf,
    },
    /// Raised when the request declares no input files at all.
    #[error("workload declares no input files")]
    NoInputs,
    /// Raised when an input name is blank.
    #[error("input names must not be blank")]
    BlankInputName,
    /// Raised when the owner resolves to an empty string.
    #[error("owner must not be blank")]
    BlankOwner,
    /// Raised when the task directory cannot be created or written.
    #[error("unable to prepare task directory {path}: {message}")]
    Io {
        /// Directory or file involved.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when an input file cannot be materialised.
    #[error(transparent)]
    File(#[from] FileError),
}

fn io_error(path: &Utf8Path, err: &io::Error) -> WorkloadError {
    WorkloadError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

impl WorkloadSpec {
    /// Parses a workload from JSON.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error when the document does not match.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Validates the workload without touching the file system.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadError`] for requests with no inputs or blank names.
    pub fn validate(&self) -> Result<(), WorkloadError> {
        if self.inputs.is_empty() && self.primary.is_none() {
            return Err(WorkloadError::NoInputs);
        }
        if self.inputs.keys().any(|name| name.trim().is_empty()) {
            return Err(WorkloadError::BlankInputName);
        }
        if self
            .owner
            .as_ref()
            .is_some_and(|owner| owner.trim().is_empty())
        {
            return Err(WorkloadError::BlankOwner);
        }
        Ok(())
    }

    /// Assigns a task identifier, creates the task directory, materialises
    /// every input into it and returns the resulting request.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadError`] when validation fails, the base workdir is
    /// missing, or any file cannot be written.
    pub fn prepare(&self, defaults: &WorkloadDefaults) -> Result<TaskRequest, WorkloadError> {
        self.validate()?;
        let base = Dir::open_ambient_dir(&self.workdir, ambient_authority()).map_err(|_| {
            WorkloadError::WorkdirMissing {
                path: self.workdir.clone(),
            }
        })?;

        let task_id = TaskId::generate();
        base.create_dir(task_id.as_str())
            .map_err(|err| io_error(&self.workdir.join(task_id.as_str()), &err))?;
        let workdir = self.workdir.join(task_id.as_str());
        info!(task_id = %task_id, workdir = %workdir, "prepared task working directory");

        let inputs = self.materialize_inputs(&workdir, defaults)?;
        let job_type = JobType::from_primary_present(inputs.primary.is_some());
        let request = TaskRequest {
            job_name: job_name_for(&task_id),
            task_id,
            owner: self
                .owner
                .as_ref()
                .map_or_else(|| defaults.owner.clone(), |owner| owner.trim().to_owned()),
            service: self.resolve_service(&defaults.service),
            job_type,
            workdir,
            clean_remote: self.clean_remote,
            inputs,
        };
        if request.owner.is_empty() {
            return Err(WorkloadError::BlankOwner);
        }
        write_snapshot(&request)?;
        Ok(request)
    }

    fn materialize_inputs(
        &self,
        workdir: &Utf8Path,
        defaults: &WorkloadDefaults,
    ) -> Result<JobInputs, WorkloadError> {
        let mut files = Vec::with_capacity(self.inputs.len());
        for (name, file) in &self.inputs {
            files.push(NamedInput {
                name: name.trim().to_owned(),
                path: materialize(file, workdir)?,
            });
        }

        let primary = self
            .primary
            .as_ref()
            .map(|file| {
                materialize(file, workdir).map(|path| NamedInput {
                    name: PRIMARY_INPUT_NAME.to_owned(),
                    path,
                })
            })
            .transpose()?;

        let secondary = if self.include.is_empty() {
            None
        } else {
            let paths = self
                .include
                .iter()
                .map(|file| materialize(file, workdir))
                .collect::<Result<Vec<_>, _>>()?;
            Some(SecondaryFiles {
                anchor: self.include_anchor.trim().to_owned(),
                paths,
            })
        };

        let job_type = JobType::from_primary_present(primary.is_some());
        Ok(JobInputs {
            workflow: defaults.workflows_dir.join(job_type.workflow_file()),
            files,
            primary,
            secondary,
            parameters: self.parameters.clone(),
        })
    }

    fn resolve_service(&self, default: &ServiceRef) -> ServiceRef {
        let Some(overrides) = &self.service else {
            return default.clone();
        };
        ServiceRef {
            name: overrides
                .name
                .clone()
                .unwrap_or_else(|| default.name.clone()),
            host: overrides
                .host
                .clone()
                .unwrap_or_else(|| default.host.clone()),
            port: overrides.port.unwrap_or(default.port),
            image: overrides
                .image
                .clone()
                .unwrap_or_else(|| default.image.clone()),
            credentials: default.credentials.clone(),
        }
    }
}

fn write_snapshot(request: &TaskRequest) -> Result<(), WorkloadError> {
    let dir = Dir::open_ambient_dir(&request.workdir, ambient_authority())
        .map_err(|err| io_error(&request.workdir, &err))?;
    let rendered = serde_json::to_string_pretty(request).map_err(|err| WorkloadError::Io {
        path: request.workdir.join(TASK_SNAPSHOT_FILE),
        message: err.to_string(),
    })?;
    dir.write(TASK_SNAPSHOT_FILE, rendered)
        .map_err(|err| io_error(&request.workdir.join(TASK_SNAPSHOT_FILE), &err))
}
