//! Binary entry point for the simrelay CLI.
//!
//! Reports are written to stdout as JSON; logs go to stderr.

use std::io::{self, Write};
use std::process;

use clap::Parser;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use simrelay::{
    CeriseRemote, FileStore, ProcessCommandRunner, RelayConfig, ReportedStatus, TaskId,
    TaskOrchestrator, TaskReport, WorkloadDefaults, WorkloadSpec,
};

mod cli;

use cli::{Cli, SubmitCommand, TaskCommand};

const EXIT_FAILED_TASK: i32 = 2;

type Orchestrator = TaskOrchestrator<CeriseRemote<ProcessCommandRunner>, FileStore>;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid request {path}: {message}")]
    Request { path: String, message: String },
    #[error("state store error: {0}")]
    Store(String),
    #[error("cleanup failed: {0}")]
    Cleanup(String),
    #[error("failed to write report: {0}")]
    Output(String),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "simrelay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    let config =
        RelayConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    let settings = config
        .orchestrator_settings()
        .map_err(|err| CliError::Config(err.to_string()))?;
    let store =
        FileStore::open(&config.state_path()).map_err(|err| CliError::Store(err.to_string()))?;
    let remote = CeriseRemote::with_process_runner(config.docker_bin.trim());
    let orchestrator = TaskOrchestrator::new(remote, store, settings);

    match cli {
        Cli::Submit(command) => submit(&orchestrator, &config, &command).await,
        Cli::SubmitAsync(command) => {
            let request = load_request(&command)?
                .prepare(&WorkloadDefaults::from_config(&config))
                .map_err(|err| request_error(&command, &err))?;
            emit_report(&orchestrator.submit_async(&request).await)
        }
        Cli::Query(TaskCommand { task_id }) => {
            emit_report(&orchestrator.query(&TaskId::new(task_id)).await)
        }
        Cli::Cleanup(TaskCommand { task_id }) => {
            let outcome = orchestrator
                .cleanup(&TaskId::new(task_id))
                .await
                .map_err(|err| CliError::Cleanup(err.to_string()))?;
            emit_json(&outcome)?;
            Ok(0)
        }
    }
}

async fn submit(
    orchestrator: &Orchestrator,
    config: &RelayConfig,
    command: &SubmitCommand,
) -> Result<i32, CliError> {
    let request = load_request(command)?
        .prepare(&WorkloadDefaults::from_config(config))
        .map_err(|err| request_error(command, &err))?;

    let cancel = CancellationToken::new();
    let watcher = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling the wait");
            watcher.cancel();
        }
    });

    let report = orchestrator.submit(&request, &cancel).await;
    emit_report(&report)
}

fn load_request(command: &SubmitCommand) -> Result<WorkloadSpec, CliError> {
    let raw = std::fs::read_to_string(&command.request)
        .map_err(|err| request_error(command, &err))?;
    WorkloadSpec::from_json(&raw).map_err(|err| request_error(command, &err))
}

fn request_error(command: &SubmitCommand, err: &impl std::fmt::Display) -> CliError {
    CliError::Request {
        path: command.request.clone(),
        message: err.to_string(),
    }
}

fn emit_report(report: &TaskReport) -> Result<i32, CliError> {
    emit_json(report)?;
    Ok(exit_code_for(report.status))
}

const fn exit_code_for(status: ReportedStatus) -> i32 {
    match status {
        ReportedStatus::Running | ReportedStatus::Completed => 0,
        ReportedStatus::Failed => EXIT_FAILED_TASK,
    }
}

fn emit_json(value: &impl serde::Serialize) -> Result<(), CliError> {
    let rendered =
        serde_json::to_string_pretty(value).map_err(|err| CliError::Output(err.to_string()))?;
    writeln!(io::stdout(), "{rendered}").map_err(|err| CliError::Output(err.to_string()))
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ReportedStatus::Running, 0)]
    #[case(ReportedStatus::Completed, 0)]
    #[case(ReportedStatus::Failed, 2)]
    fn exit_code_follows_reported_status(#[case] status: ReportedStatus, #[case] code: i32) {
        assert_eq!(exit_code_for(status), code);
    }

    #[rstest]
    fn write_error_writes_cli_error() {
        let mut buf = Vec::new();
        let err = CliError::Request {
            path: String::from("req.json"),
            message: String::from("missing field `workdir`"),
        };
        write_error(&mut buf, &err);
        let rendered = String::from_utf8(buf).expect("utf8");
        assert!(
            rendered.contains("invalid request req.json: missing field `workdir`"),
            "rendered: {rendered}"
        );
    }
}
