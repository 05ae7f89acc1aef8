//! Durable keyed storage for task descriptors.
//!
//! The store is the only component that touches persistent state. It does
//! not retry: connectivity problems surface as [`StoreError::Unavailable`]
//! and the caller decides what to do.

use std::collections::BTreeMap;
use std::sync::Arc;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::task::{TaskDescriptor, TaskId, TaskStatus};

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Errors raised by state stores.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StoreError {
    /// Raised when the backing store cannot be reached.
    #[error("state store unavailable: {message}")]
    Unavailable {
        /// Human-readable error message.
        message: String,
    },
    /// Raised when inserting a descriptor whose key already exists.
    #[error("task {task_id} is already registered")]
    Duplicate {
        /// Conflicting task identifier.
        task_id: TaskId,
    },
    /// Raised when a task identifier cannot be used as a storage key.
    #[error("invalid task identifier: {task_id:?}")]
    InvalidKey {
        /// Offending identifier.
        task_id: TaskId,
    },
    /// Raised when a stored record cannot be decoded.
    #[error("stored record for task {task_id} is corrupt: {message}")]
    Corrupt {
        /// Task whose record is unreadable.
        task_id: TaskId,
        /// Parser error message.
        message: String,
    },
}

/// Partial update applied to a stored descriptor.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TaskUpdate {
    /// New status, when changing.
    pub status: Option<TaskStatus>,
    /// Extracted results; only applied while none are recorded yet.
    pub results: Option<BTreeMap<String, Utf8PathBuf>>,
}

impl TaskUpdate {
    /// Update that only changes the status.
    #[must_use]
    pub const fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            results: None,
        }
    }

    /// Update recording the single transition into `Completed`.
    #[must_use]
    pub const fn completed(results: BTreeMap<String, Utf8PathBuf>) -> Self {
        Self {
            status: Some(TaskStatus::Completed),
            results: Some(results),
        }
    }

    /// Applies the update in place.
    pub fn apply(&self, descriptor: &mut TaskDescriptor) {
        if let Some(status) = self.status {
            descriptor.status = status;
        }
        if let Some(results) = &self.results
            && descriptor.results.is_empty()
        {
            descriptor.results.clone_from(results);
        }
    }
}

/// Keyed persistence of task descriptors.
pub trait StateStore: Send + Sync {
    /// Stores a new descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Duplicate`] when the task is already stored and
    /// [`StoreError::Unavailable`] when the store cannot be reached.
    fn insert(&self, descriptor: &TaskDescriptor) -> Result<(), StoreError>;

    /// Looks a descriptor up by task identifier.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    fn find(&self, task_id: &TaskId) -> Result<Option<TaskDescriptor>, StoreError>;

    /// Applies `update` to an existing descriptor and returns the result.
    /// Returns `Ok(None)` when no such record exists; deleted records are
    /// never recreated.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read or written.
    fn update(
        &self,
        task_id: &TaskId,
        update: &TaskUpdate,
    ) -> Result<Option<TaskDescriptor>, StoreError>;

    /// Removes a descriptor, returning whether one existed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be written.
    fn delete(&self, task_id: &TaskId) -> Result<bool, StoreError>;

    /// Counts descriptors of `owner` whose remote job is still in flight.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    fn count_active(&self, owner: &str) -> Result<usize, StoreError>;
}

impl<S: StateStore + ?Sized> StateStore for Arc<S> {
    fn insert(&self, descriptor: &TaskDescriptor) -> Result<(), StoreError> {
        (**self).insert(descriptor)
    }

    fn find(&self, task_id: &TaskId) -> Result<Option<TaskDescriptor>, StoreError> {
        (**self).find(task_id)
    }

    fn update(
        &self,
        task_id: &TaskId,
        update: &TaskUpdate,
    ) -> Result<Option<TaskDescriptor>, StoreError> {
        (**self).update(task_id, update)
    }

    fn delete(&self, task_id: &TaskId) -> Result<bool, StoreError> {
        (**self).delete(task_id)
    }

    fn count_active(&self, owner: &str) -> Result<usize, StoreError> {
        (**self).count_active(owner)
    }
}

#[cfg(test)]
mod tests;
