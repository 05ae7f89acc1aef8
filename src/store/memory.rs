//! In-process store, used by tests and ephemeral runs.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{StateStore, StoreError, TaskUpdate};
use crate::task::{TaskDescriptor, TaskId, TaskStatus};

#[derive(Debug, Default)]
struct State {
    records: BTreeMap<TaskId, TaskDescriptor>,
    unavailable: bool,
    rejected_statuses: Vec<TaskStatus>,
}

/// Shared in-memory [`StateStore`]. Clones observe the same records.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates losing (or regaining) connectivity to the store.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.unavailable = unavailable;
        }
    }

    /// Makes updates that move a record into any of `statuses` fail as
    /// unavailable. An empty slice clears the restriction.
    pub fn reject_status_updates(&self, statuses: &[TaskStatus]) {
        if let Ok(mut state) = self.state.lock() {
            state.rejected_statuses = statuses.to_vec();
        }
    }

    /// Returns every stored descriptor, ordered by task identifier.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] when the store is marked
    /// unavailable.
    pub fn snapshot(&self) -> Result<Vec<TaskDescriptor>, StoreError> {
        Ok(self.lock()?.records.values().cloned().collect())
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        let state = self.state.lock().map_err(|_| StoreError::Unavailable {
            message: String::from("memory store lock poisoned"),
        })?;
        if state.unavailable {
            return Err(StoreError::Unavailable {
                message: String::from("memory store marked unavailable"),
            });
        }
        Ok(state)
    }
}

impl StateStore for MemoryStore {
    fn insert(&self, descriptor: &TaskDescriptor) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if state.records.contains_key(&descriptor.task_id) {
            return Err(StoreError::Duplicate {
                task_id: descriptor.task_id.clone(),
            });
        }
        state
            .records
            .insert(descriptor.task_id.clone(), descriptor.clone());
        Ok(())
    }

    fn find(&self, task_id: &TaskId) -> Result<Option<TaskDescriptor>, StoreError> {
        Ok(self.lock()?.records.get(task_id).cloned())
    }

    fn update(
        &self,
        task_id: &TaskId,
        update: &TaskUpdate,
    ) -> Result<Option<TaskDescriptor>, StoreError> {
        let mut state = self.lock()?;
        if let Some(status) = update.status
            && state.rejected_statuses.contains(&status)
        {
            return Err(StoreError::Unavailable {
                message: format!("memory store rejected update to {status:?}"),
            });
        }
        Ok(state.records.get_mut(task_id).map(|descriptor| {
            update.apply(descriptor);
            descriptor.clone()
        }))
    }

    fn delete(&self, task_id: &TaskId) -> Result<bool, StoreError> {
        Ok(self.lock()?.records.remove(task_id).is_some())
    }

    fn count_active(&self, owner: &str) -> Result<usize, StoreError> {
        Ok(self
            .lock()?
            .records
            .values()
            .filter(|descriptor| descriptor.owner == owner && descriptor.status.is_active())
            .count())
    }
}
