//! Core library for simrelay, a lifecycle orchestrator for simulation jobs
//! on a managed remote execution service.
//!
//! A task is mapped onto a named job on a managed service. The orchestrator
//! provisions the service, submits the job idempotently, waits for it (or
//! lets callers poll), extracts outputs into a per-task working directory,
//! records everything in a durable state store and retires the service once
//! no active task depends on it.

pub mod cerise;
pub mod command;
pub mod config;
pub mod files;
pub mod orchestrator;
pub mod remote;
pub mod store;
pub mod task;
pub mod test_support;
pub mod workload;

pub use cerise::{CeriseRemote, DockerRuntime};
pub use command::{CommandError, CommandOutput, CommandRunner, ProcessCommandRunner};
pub use config::{ConfigError, RelayConfig};
pub use files::{FileError, SerializedFile};
pub use orchestrator::{
    CleanupOutcome, OrchestratorSettings, RetireOutcome, RetirePolicy, RetryPolicy, TaskError,
    TaskOrchestrator,
};
pub use remote::{JobDraft, JobState, RemoteError, RemoteExecution, RemoteJob, ServiceHandle};
pub use store::{FileStore, MemoryStore, StateStore, StoreError, TaskUpdate};
pub use task::{
    JobType, ReportedStatus, ServiceRef, TaskDescriptor, TaskId, TaskReport, TaskStatus,
};
pub use workload::{TaskRequest, WorkloadDefaults, WorkloadError, WorkloadSpec};
