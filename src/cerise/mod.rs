//! [`RemoteExecution`] backed by a Cerise job service in a local container.
//!
//! The service container is managed through the `docker` CLI and jobs are
//! driven through the service's REST API. Container commands block, so they
//! run on the blocking pool.

use std::time::Duration;

use camino::Utf8Path;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::command::{CommandRunner, ProcessCommandRunner};
use crate::remote::{
    JobDraft, RemoteError, RemoteExecution, RemoteFuture, RemoteJob, ServiceHandle,
};
use crate::task::ServiceRef;

mod api;
mod runtime;

use api::CeriseApi;
pub use runtime::{CONTAINER_PORT, ContainerState, DockerRuntime};

const READY_ATTEMPTS: u32 = 30;
const READY_INTERVAL: Duration = Duration::from_secs(1);

/// Cerise-backed remote execution client.
#[derive(Clone, Debug)]
pub struct CeriseRemote<R: CommandRunner> {
    runtime: DockerRuntime<R>,
    ready_attempts: u32,
    ready_interval: Duration,
}

impl CeriseRemote<ProcessCommandRunner> {
    /// Creates a client that shells out to `docker_bin`.
    #[must_use]
    pub fn with_process_runner(docker_bin: impl Into<String>) -> Self {
        Self::new(docker_bin, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> CeriseRemote<R> {
    /// Creates a client using `runner` to invoke `docker_bin`.
    #[must_use]
    pub fn new(docker_bin: impl Into<String>, runner: R) -> Self {
        Self {
            runtime: DockerRuntime::new(docker_bin, runner),
            ready_attempts: READY_ATTEMPTS,
            ready_interval: READY_INTERVAL,
        }
    }

    /// Overrides how long provisioning waits for the API to answer.
    #[must_use]
    pub const fn with_readiness(mut self, attempts: u32, interval: Duration) -> Self {
        self.ready_attempts = attempts;
        self.ready_interval = interval;
        self
    }

    async fn blocking<T, F>(&self, task: F) -> Result<T, RemoteError>
    where
        T: Send + 'static,
        F: FnOnce(&DockerRuntime<R>) -> Result<T, RemoteError> + Send + 'static,
    {
        let runtime = self.runtime.clone();
        tokio::task::spawn_blocking(move || task(&runtime))
            .await
            .map_err(|err| RemoteError::Runtime {
                message: err.to_string(),
            })?
    }

    async fn wait_until_ready(&self, api: &CeriseApi) -> bool {
        for attempt in 1..=self.ready_attempts {
            if api.is_ready().await {
                return true;
            }
            debug!(attempt, "service API not answering yet");
            sleep(self.ready_interval).await;
        }
        false
    }

    async fn running_container(
        &self,
        service: &ServiceRef,
    ) -> Result<Option<ServiceHandle>, RemoteError> {
        let name = service.name.clone();
        let state = self.blocking(move |runtime| runtime.inspect(&name)).await?;
        Ok(state
            .filter(|container| container.running)
            .map(|container| ServiceHandle {
                service: service.clone(),
                instance_id: container.id,
            }))
    }
}

fn api_for(service: &ServiceHandle) -> CeriseApi {
    CeriseApi::new(service.service.base_url())
}

impl<R: CommandRunner> RemoteExecution for CeriseRemote<R> {
    fn require_service<'a>(
        &'a self,
        service: &'a ServiceRef,
    ) -> RemoteFuture<'a, Option<ServiceHandle>> {
        Box::pin(async move {
            let spec = service.clone();
            let instance_id = self
                .blocking(move |runtime| runtime.ensure_running(&spec))
                .await?;
            let api = CeriseApi::new(service.base_url());
            if !self.wait_until_ready(&api).await {
                warn!(service = %service.name, "container started but its API never answered");
                return Ok(None);
            }
            Ok(Some(ServiceHandle {
                service: service.clone(),
                instance_id,
            }))
        })
    }

    fn service_from_ref<'a>(
        &'a self,
        service: &'a ServiceRef,
    ) -> RemoteFuture<'a, Option<ServiceHandle>> {
        Box::pin(self.running_container(service))
    }

    fn list_jobs<'a>(&'a self, service: &'a ServiceHandle) -> RemoteFuture<'a, Vec<RemoteJob>> {
        Box::pin(async move {
            let records = api_for(service).list_jobs().await?;
            Ok(records.iter().map(api::JobRecord::to_remote).collect())
        })
    }

    fn get_job<'a>(
        &'a self,
        service: &'a ServiceHandle,
        name: &'a str,
    ) -> RemoteFuture<'a, Option<RemoteJob>> {
        Box::pin(async move {
            let record = api_for(service).find_job(name).await?;
            Ok(record.as_ref().map(api::JobRecord::to_remote))
        })
    }

    fn run<'a>(
        &'a self,
        service: &'a ServiceHandle,
        draft: JobDraft,
    ) -> RemoteFuture<'a, RemoteJob> {
        Box::pin(async move {
            let record = api_for(service).submit(&draft).await?;
            Ok(record.to_remote())
        })
    }

    fn job_log<'a>(
        &'a self,
        service: &'a ServiceHandle,
        job: &'a RemoteJob,
    ) -> RemoteFuture<'a, String> {
        Box::pin(async move { api_for(service).log(&job.id).await })
    }

    fn save_output<'a>(
        &'a self,
        service: &'a ServiceHandle,
        job: &'a RemoteJob,
        output: &'a str,
        destination: &'a Utf8Path,
    ) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            api_for(service)
                .download(&job.id, output, destination)
                .await
        })
    }

    fn destroy_job<'a>(
        &'a self,
        service: &'a ServiceHandle,
        job: &'a RemoteJob,
    ) -> RemoteFuture<'a, ()> {
        Box::pin(async move { api_for(service).delete(&job.id).await })
    }

    fn stop_service<'a>(&'a self, service: &'a ServiceHandle) -> RemoteFuture<'a, ()> {
        let id = service.instance_id.clone();
        Box::pin(self.blocking(move |runtime| runtime.stop(&id)))
    }

    fn destroy_service<'a>(&'a self, service: &'a ServiceHandle) -> RemoteFuture<'a, ()> {
        let id = service.instance_id.clone();
        Box::pin(self.blocking(move |runtime| runtime.remove(&id)))
    }
}

#[cfg(test)]
mod tests;
