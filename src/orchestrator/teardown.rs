//! Reference-counted service teardown.

use serde::Serialize;
use tracing::info;

use super::{RetirePolicy, TaskError, TaskOrchestrator};
use crate::remote::RemoteExecution;
use crate::store::StateStore;
use crate::task::ServiceRef;

/// Decision taken by [`TaskOrchestrator::maybe_retire`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RetireOutcome {
    /// The service was stopped and destroyed.
    Retired,
    /// Other work still depends on the service.
    Retained {
        /// Active tasks or registered jobs observed.
        active: usize,
    },
    /// No live service was found; nothing to do.
    AlreadyGone,
}

impl<R, S> TaskOrchestrator<R, S>
where
    R: RemoteExecution,
    S: StateStore,
{
    /// Retires the service when nothing depends on it any more.
    ///
    /// The decision reads the current count once and acts on it without a
    /// lock; a submission racing this call may see its service destroyed and
    /// provisioned again.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError`] when the store or the remote service fails.
    pub async fn maybe_retire(
        &self,
        service: &ServiceRef,
        owner: &str,
    ) -> Result<RetireOutcome, TaskError> {
        let Some(handle) = self.remote.service_from_ref(service).await? else {
            info!(service = %service.name, "service already gone");
            return Ok(RetireOutcome::AlreadyGone);
        };

        let active = match self.settings.retire_policy {
            RetirePolicy::OwnerActiveTasks => self.store.count_active(owner)?,
            RetirePolicy::ServiceJobs => self.remote.list_jobs(&handle).await?.len(),
        };
        if active > 0 {
            info!(service = %service.name, owner, active, "service retained");
            return Ok(RetireOutcome::Retained { active });
        }

        self.remote.stop_service(&handle).await?;
        self.remote.destroy_service(&handle).await?;
        info!(service = %service.name, owner, "service retired");
        Ok(RetireOutcome::Retired)
    }
}
