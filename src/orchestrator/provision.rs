//! Idempotent service provisioning.

use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{TaskError, TaskOrchestrator};
use crate::remote::{RemoteExecution, ServiceHandle};
use crate::store::StateStore;
use crate::task::ServiceRef;

impl<R, S> TaskOrchestrator<R, S>
where
    R: RemoteExecution,
    S: StateStore,
{
    /// Ensures a live service exists for `service.name` and returns a handle
    /// to it.
    ///
    /// An already running service is reused without a provisioning call.
    /// Transient provisioning errors are retried with jittered backoff up to
    /// the configured number of attempts. `Ok(None)` means the runtime
    /// accepted the request but produced no usable handle; callers must
    /// check for it.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::ProvisioningFailed`] once retries are exhausted
    /// and [`TaskError::Remote`] for non-transient runtime errors.
    pub async fn ensure_service(
        &self,
        service: &ServiceRef,
    ) -> Result<Option<ServiceHandle>, TaskError> {
        if let Some(handle) = self.remote.service_from_ref(service).await? {
            debug!(service = %service.name, instance = %handle.instance_id, "reusing live service");
            return Ok(Some(handle));
        }

        let max_attempts = self.settings.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.remote.require_service(service).await {
                Ok(Some(handle)) => {
                    info!(service = %service.name, instance = %handle.instance_id, attempt, "service provisioned");
                    return Ok(Some(handle));
                }
                Ok(None) => {
                    warn!(service = %service.name, "provisioning succeeded but no usable handle was returned");
                    return Ok(None);
                }
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.settings.retry.next_delay();
                    warn!(
                        service = %service.name,
                        attempt,
                        delay = ?delay,
                        error = %err,
                        "provisioning failed; retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) if err.is_transient() => {
                    return Err(TaskError::ProvisioningFailed {
                        service: service.name.clone(),
                        attempts: attempt,
                        message: err.to_string(),
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}
