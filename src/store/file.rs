//! One JSON document per task under a state directory.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use tracing::warn;
use uuid::Uuid;

use super::{StateStore, StoreError, TaskUpdate};
use crate::task::{TaskDescriptor, TaskId};

const RECORD_EXTENSION: &str = ".json";
const TEMP_SUFFIX: &str = ".tmp";

/// File-backed [`StateStore`].
///
/// Records are replaced atomically by writing a temporary file and renaming
/// it over the previous version, so single-record writes never tear. Updates
/// re-check that the record still exists before the rename.
#[derive(Debug)]
pub struct FileStore {
    root: Utf8PathBuf,
    dir: Dir,
}

impl FileStore {
    /// Opens (and creates if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] when the directory cannot be
    /// created or opened.
    pub fn open(root: &Utf8Path) -> Result<Self, StoreError> {
        Dir::create_ambient_dir_all(root, ambient_authority())
            .map_err(|err| unavailable(root, &err))?;
        let dir =
            Dir::open_ambient_dir(root, ambient_authority()).map_err(|err| unavailable(root, &err))?;
        Ok(Self {
            root: root.to_path_buf(),
            dir,
        })
    }

    /// Directory holding the records.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn record_name(task_id: &TaskId) -> Result<String, StoreError> {
        let key = task_id.as_str();
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_'));
        if !valid {
            return Err(StoreError::InvalidKey {
                task_id: task_id.clone(),
            });
        }
        Ok(format!("{key}{RECORD_EXTENSION}"))
    }

    fn read_record(&self, task_id: &TaskId) -> Result<Option<TaskDescriptor>, StoreError> {
        let name = Self::record_name(task_id)?;
        let contents = match self.dir.read_to_string(&name) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(unavailable(&self.root.join(&name), &err)),
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|err| StoreError::Corrupt {
                task_id: task_id.clone(),
                message: err.to_string(),
            })
    }

    fn write_record(&self, descriptor: &TaskDescriptor) -> Result<(), StoreError> {
        let name = Self::record_name(&descriptor.task_id)?;
        let temp = self.stage(&name, descriptor)?;
        self.commit(&temp, &name)
    }

    /// Writes `descriptor` to a uniquely named temporary file next to the
    /// record `name`.
    fn stage(&self, name: &str, descriptor: &TaskDescriptor) -> Result<String, StoreError> {
        let temp = format!("{name}.{}{TEMP_SUFFIX}", Uuid::new_v4().simple());
        let rendered =
            serde_json::to_string_pretty(descriptor).map_err(|err| StoreError::Corrupt {
                task_id: descriptor.task_id.clone(),
                message: err.to_string(),
            })?;
        self.dir
            .write(&temp, rendered)
            .map_err(|err| unavailable(&self.root.join(&temp), &err))?;
        Ok(temp)
    }

    fn commit(&self, temp: &str, name: &str) -> Result<(), StoreError> {
        self.dir
            .rename(temp, &self.dir, name)
            .map_err(|err| unavailable(&self.root.join(name), &err))
    }

    fn discard(&self, temp: &str) {
        if let Err(err) = self.dir.remove_file(temp) {
            warn!(path = %self.root.join(temp), error = %err, "unable to remove staged record");
        }
    }

    /// Applies `update` and runs `before_commit` between staging the new
    /// version and renaming it into place.
    ///
    /// A record deleted in that window stays deleted: the staged copy is
    /// discarded and `Ok(None)` is returned.
    pub(super) fn update_staged(
        &self,
        task_id: &TaskId,
        update: &TaskUpdate,
        before_commit: impl FnOnce(),
    ) -> Result<Option<TaskDescriptor>, StoreError> {
        let Some(mut descriptor) = self.read_record(task_id)? else {
            return Ok(None);
        };
        update.apply(&mut descriptor);
        let name = Self::record_name(task_id)?;
        let temp = self.stage(&name, &descriptor)?;
        before_commit();
        if !self.dir.exists(&name) {
            self.discard(&temp);
            return Ok(None);
        }
        self.commit(&temp, &name)?;
        Ok(Some(descriptor))
    }

    fn record_names(&self) -> Result<Vec<String>, StoreError> {
        let entries = self
            .dir
            .entries()
            .map_err(|err| unavailable(&self.root, &err))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| unavailable(&self.root, &err))?;
            let name = entry
                .file_name()
                .map_err(|err| unavailable(&self.root, &err))?;
            if name.ends_with(RECORD_EXTENSION) {
                names.push(name);
            }
        }
        Ok(names)
    }
}

impl StateStore for FileStore {
    fn insert(&self, descriptor: &TaskDescriptor) -> Result<(), StoreError> {
        let name = Self::record_name(&descriptor.task_id)?;
        if self.dir.exists(&name) {
            return Err(StoreError::Duplicate {
                task_id: descriptor.task_id.clone(),
            });
        }
        self.write_record(descriptor)
    }

    fn find(&self, task_id: &TaskId) -> Result<Option<TaskDescriptor>, StoreError> {
        self.read_record(task_id)
    }

    fn update(
        &self,
        task_id: &TaskId,
        update: &TaskUpdate,
    ) -> Result<Option<TaskDescriptor>, StoreError> {
        self.update_staged(task_id, update, || {})
    }

    fn delete(&self, task_id: &TaskId) -> Result<bool, StoreError> {
        let name = Self::record_name(task_id)?;
        match self.dir.remove_file(&name) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(unavailable(&self.root.join(&name), &err)),
        }
    }

    fn count_active(&self, owner: &str) -> Result<usize, StoreError> {
        let mut active = 0;
        for name in self.record_names()? {
            let contents = match self.dir.read_to_string(&name) {
                Ok(contents) => contents,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(unavailable(&self.root.join(&name), &err)),
            };
            match serde_json::from_str::<TaskDescriptor>(&contents) {
                Ok(descriptor) if descriptor.owner == owner && descriptor.status.is_active() => {
                    active += 1;
                }
                Ok(_) => {}
                Err(err) => warn!(record = %name, error = %err, "skipping unreadable task record"),
            }
        }
        Ok(active)
    }
}

fn unavailable(path: &Utf8Path, err: &io::Error) -> StoreError {
    StoreError::Unavailable {
        message: format!("{path}: {err}"),
    }
}
