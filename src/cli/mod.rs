//! Command-line interface definitions for the `simrelay` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `simrelay` binary.
#[derive(Debug, Parser)]
#[command(
    name = "simrelay",
    about = "Run simulation jobs on a managed remote execution service",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Submit a workload and wait for it to finish.
    #[command(name = "submit", about = "Submit a workload and wait for it to finish")]
    Submit(SubmitCommand),
    /// Submit a workload and return once it is running.
    #[command(
        name = "submit-async",
        about = "Submit a workload and return once it is running"
    )]
    SubmitAsync(SubmitCommand),
    /// Poll a task once, extracting its results when it has finished.
    #[command(name = "query", about = "Poll a task once")]
    Query(TaskCommand),
    /// Remove a task record and its remote job.
    #[command(name = "cleanup", about = "Remove a task record and its remote job")]
    Cleanup(TaskCommand),
}

/// Arguments for the submission subcommands.
#[derive(Debug, Parser)]
pub(crate) struct SubmitCommand {
    /// Path to the JSON workload request.
    ///
    /// The request names an existing base working directory, the input files
    /// (inline or by local path), optional auxiliary files and scalar
    /// workflow parameters.
    #[arg(value_name = "REQUEST")]
    pub(crate) request: String,
}

/// Arguments for subcommands addressing an existing task.
#[derive(Debug, Parser)]
pub(crate) struct TaskCommand {
    /// Task identifier returned by a previous submission.
    #[arg(value_name = "TASK_ID")]
    pub(crate) task_id: String,
}
