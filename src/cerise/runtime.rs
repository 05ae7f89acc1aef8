//! Service container lifecycle through the `docker` CLI.

use std::env;
use std::ffi::OsString;

use crate::command::{CommandOutput, CommandRunner};
use crate::remote::RemoteError;
use crate::task::ServiceRef;

/// Port the service listens on inside its container.
pub const CONTAINER_PORT: u16 = 29593;

const INSPECT_FORMAT: &str = "{{.Id}} {{.State.Running}}";

/// Observed state of a service container.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ContainerState {
    /// Container identifier.
    pub id: String,
    /// Whether the container is running.
    pub running: bool,
}

/// Drives the container runtime binary.
#[derive(Clone, Debug)]
pub struct DockerRuntime<R: CommandRunner> {
    docker_bin: String,
    runner: R,
}

impl<R: CommandRunner> DockerRuntime<R> {
    /// Creates a runtime using `docker_bin` and `runner`.
    #[must_use]
    pub fn new(docker_bin: impl Into<String>, runner: R) -> Self {
        Self {
            docker_bin: docker_bin.into(),
            runner,
        }
    }

    /// Looks up the container named `name`.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Runtime`] when the runtime fails for any reason
    /// other than the container being absent.
    pub fn inspect(&self, name: &str) -> Result<Option<ContainerState>, RemoteError> {
        let args = [
            OsString::from("inspect"),
            OsString::from("--type"),
            OsString::from("container"),
            OsString::from("--format"),
            OsString::from(INSPECT_FORMAT),
            OsString::from(name),
        ];
        let output = self.invoke(&args)?;
        if !output.is_success() {
            if output.stderr.to_ascii_lowercase().contains("no such") {
                return Ok(None);
            }
            return Err(self.failure("inspect", &output));
        }
        parse_inspect(&output.stdout).map(Some)
    }

    /// Returns the id of a running container for `service`, starting or
    /// creating it when needed.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Provisioning`] when the container cannot be
    /// created or started.
    pub fn ensure_running(&self, service: &ServiceRef) -> Result<String, RemoteError> {
        match self.inspect(&service.name)? {
            Some(state) if state.running => Ok(state.id),
            Some(state) => {
                self.provision(service, &[OsString::from("start"), OsString::from(&service.name)])?;
                Ok(state.id)
            }
            None => {
                let output = self.provision(service, &run_args(service))?;
                Ok(output.stdout.trim().to_owned())
            }
        }
    }

    /// Stops the container; an already stopped container is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Runtime`] when the runtime rejects the request.
    pub fn stop(&self, id: &str) -> Result<(), RemoteError> {
        let output = self.invoke(&[OsString::from("stop"), OsString::from(id)])?;
        if output.is_success() || output.stderr.to_ascii_lowercase().contains("is not running") {
            return Ok(());
        }
        Err(self.failure("stop", &output))
    }

    /// Force-removes the container.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Runtime`] when the runtime rejects the request.
    pub fn remove(&self, id: &str) -> Result<(), RemoteError> {
        let output = self.invoke(&[
            OsString::from("rm"),
            OsString::from("-f"),
            OsString::from(id),
        ])?;
        if output.is_success() || output.stderr.to_ascii_lowercase().contains("no such") {
            return Ok(());
        }
        Err(self.failure("rm", &output))
    }

    fn provision(
        &self,
        service: &ServiceRef,
        args: &[OsString],
    ) -> Result<CommandOutput, RemoteError> {
        let output = self.invoke(args)?;
        if output.is_success() {
            return Ok(output);
        }
        Err(RemoteError::Provisioning {
            service: service.name.clone(),
            message: output.stderr.trim().to_owned(),
        })
    }

    fn invoke(&self, args: &[OsString]) -> Result<CommandOutput, RemoteError> {
        self.runner
            .run(&self.docker_bin, args)
            .map_err(|err| RemoteError::Runtime {
                message: err.to_string(),
            })
    }

    fn failure(&self, action: &str, output: &CommandOutput) -> RemoteError {
        let status = output
            .code
            .map_or_else(|| String::from("unknown"), |code| code.to_string());
        RemoteError::Runtime {
            message: format!(
                "{} {action} exited with status {status}: {}",
                self.docker_bin,
                output.stderr.trim()
            ),
        }
    }
}

fn run_args(service: &ServiceRef) -> Vec<OsString> {
    let mut args = vec![
        OsString::from("run"),
        OsString::from("-d"),
        OsString::from("--name"),
        OsString::from(&service.name),
        OsString::from("-p"),
        OsString::from(format!("{}:{CONTAINER_PORT}", service.port)),
    ];
    if let Some(credentials) = &service.credentials {
        args.push(OsString::from("-e"));
        args.push(OsString::from(format!(
            "CERISE_USERNAME={}",
            credentials.username
        )));
        if let Some(password) = env::var_os(&credentials.password_env) {
            let mut pair = OsString::from("CERISE_PASSWORD=");
            pair.push(password);
            args.push(OsString::from("-e"));
            args.push(pair);
        }
    }
    args.push(OsString::from(&service.image));
    args
}

fn parse_inspect(stdout: &str) -> Result<ContainerState, RemoteError> {
    let mut parts = stdout.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(id), Some(running)) => Ok(ContainerState {
            id: id.to_owned(),
            running: running == "true",
        }),
        _ => Err(RemoteError::InvalidResponse {
            message: format!("unexpected inspect output: {}", stdout.trim()),
        }),
    }
}
