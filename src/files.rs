//! File values crossing the system boundary.
//!
//! Inbound files arrive as `{path, extension, content}`. When `content` is
//! present the bytes are written into the task working directory, otherwise
//! the file at `path` is copied there. Outbound values are the inverse: any
//! string naming an existing file becomes `{path, extension, content: null}`
//! while everything else passes through structurally unchanged.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Serialised representation of a file.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SerializedFile {
    /// Original location of the file.
    pub path: Utf8PathBuf,
    /// Extension without the leading dot.
    #[serde(default)]
    pub extension: Option<String>,
    /// Inline contents; `None` means "copy from `path`".
    #[serde(default)]
    pub content: Option<String>,
    /// Optional content encoding label, carried through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

impl SerializedFile {
    /// Describes an existing local file without inlining its content.
    #[must_use]
    pub fn reference(path: &Utf8Path) -> Self {
        Self {
            path: path.to_path_buf(),
            extension: path.extension().map(str::to_owned),
            content: None,
            encoding: None,
        }
    }

    /// Describes a file whose bytes travel inline.
    #[must_use]
    pub fn inline(path: impl Into<Utf8PathBuf>, content: impl Into<String>) -> Self {
        let file_path = path.into();
        Self {
            extension: file_path.extension().map(str::to_owned),
            path: file_path,
            content: Some(content.into()),
            encoding: None,
        }
    }
}

/// Errors raised while materialising files.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum FileError {
    /// Raised when the serialised path has no file name component.
    #[error("serialised file path {path} has no file name")]
    MissingFileName {
        /// Offending path.
        path: Utf8PathBuf,
    },
    /// Raised when file system access fails.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
}

impl FileError {
    fn io(path: &Utf8Path, err: &io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

/// Writes or copies `file` into `workdir`, returning the new local path.
///
/// The destination keeps the original file name.
///
/// # Errors
///
/// Returns [`FileError`] when the source cannot be read or the destination
/// cannot be written.
pub fn materialize(file: &SerializedFile, workdir: &Utf8Path) -> Result<Utf8PathBuf, FileError> {
    let file_name = file
        .path
        .file_name()
        .ok_or_else(|| FileError::MissingFileName {
            path: file.path.clone(),
        })?;
    let destination = workdir.join(file_name);
    let target =
        Dir::open_ambient_dir(workdir, ambient_authority()).map_err(|err| FileError::io(workdir, &err))?;

    let bytes = match &file.content {
        Some(content) => content.clone().into_bytes(),
        None => read_bytes(&file.path)?,
    };
    target
        .write(file_name, bytes)
        .map_err(|err| FileError::io(&destination, &err))?;
    Ok(destination)
}

/// Reads a local file through a capability-scoped directory handle.
///
/// # Errors
///
/// Returns [`FileError`] when the file cannot be read.
pub fn read_bytes(path: &Utf8Path) -> Result<Vec<u8>, FileError> {
    let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    let parent = if parent.as_str().is_empty() {
        Utf8Path::new(".")
    } else {
        parent
    };
    let file_name = path.file_name().ok_or_else(|| FileError::MissingFileName {
        path: path.to_path_buf(),
    })?;
    let dir =
        Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| FileError::io(parent, &err))?;
    dir.read(file_name).map_err(|err| FileError::io(path, &err))
}

/// Returns `true` when `path` names an existing regular file.
#[must_use]
pub fn is_file(path: &Utf8Path) -> bool {
    let Some(file_name) = path.file_name() else {
        return false;
    };
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    Dir::open_ambient_dir(parent, ambient_authority())
        .and_then(|dir| dir.metadata(file_name))
        .is_ok_and(|meta| meta.is_file())
}

/// Replaces every string naming an existing file with a serialised file
/// reference, recursing through maps and sequences.
#[must_use]
pub fn serialize_value(value: Value) -> Value {
    match value {
        Value::String(text) => {
            let path = Utf8Path::new(&text);
            if is_file(path) {
                serde_json::to_value(SerializedFile::reference(path)).unwrap_or(Value::String(text))
            } else {
                Value::String(text)
            }
        }
        Value::Array(items) => Value::Array(items.into_iter().map(serialize_value).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, item)| (key, serialize_value(item)))
                .collect::<Map<String, Value>>(),
        ),
        other => other,
    }
}

/// Inverse of [`serialize_value`]: materialises serialised file objects
/// into `workdir` and replaces them with their new local path.
///
/// Values that are not serialised files pass through unchanged.
///
/// # Errors
///
/// Returns [`FileError`] when a referenced file cannot be materialised.
pub fn deserialize_value(value: Value, workdir: &Utf8Path) -> Result<Value, FileError> {
    match value {
        Value::Object(map) if looks_like_serialized_file(&map) => {
            let file: SerializedFile = serde_json::from_value(Value::Object(map.clone()))
                .map_err(|err| FileError::Io {
                    path: workdir.to_path_buf(),
                    message: err.to_string(),
                })?;
            let local = materialize(&file, workdir)?;
            Ok(Value::String(local.into_string()))
        }
        Value::Object(map) => {
            let mut converted = Map::with_capacity(map.len());
            for (key, item) in map {
                converted.insert(key, deserialize_value(item, workdir)?);
            }
            Ok(Value::Object(converted))
        }
        Value::Array(items) => items
            .into_iter()
            .map(|item| deserialize_value(item, workdir))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other),
    }
}

fn looks_like_serialized_file(map: &Map<String, Value>) -> bool {
    const KEYS: [&str; 4] = ["path", "extension", "content", "encoding"];
    map.get("path").is_some_and(Value::is_string) && map.keys().all(|key| KEYS.contains(&key.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};
    use serde_json::json;
    use tempfile::TempDir;

    #[fixture]
    fn workdir() -> TempDir {
        TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"))
    }

    fn utf8(tmp: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
            .unwrap_or_else(|path| panic!("non-utf8 tempdir: {}", path.display()))
    }

    #[rstest]
    fn materialize_writes_inline_content(workdir: TempDir) {
        let dir = utf8(&workdir);
        let file = SerializedFile::inline("/elsewhere/ligand.pdb", "ATOM 1");
        let local = materialize(&file, &dir).expect("materialise inline file");
        assert_eq!(local, dir.join("ligand.pdb"));
        assert_eq!(read_bytes(&local).expect("read back"), b"ATOM 1");
    }

    #[rstest]
    fn materialize_copies_when_content_absent(workdir: TempDir) {
        let source_tmp = TempDir::new().expect("source tempdir");
        let source = utf8(&source_tmp).join("topology.itp");
        std::fs::write(&source, b"[ atoms ]").expect("seed source");

        let dir = utf8(&workdir);
        let local = materialize(&SerializedFile::reference(&source), &dir).expect("copy file");
        assert_eq!(read_bytes(&local).expect("read back"), b"[ atoms ]");
    }

    #[rstest]
    fn materialize_reports_missing_source(workdir: TempDir) {
        let dir = utf8(&workdir);
        let file = SerializedFile::reference(Utf8Path::new("/nonexistent/input.gro"));
        let err = materialize(&file, &dir).expect_err("missing source should fail");
        assert!(matches!(err, FileError::Io { .. }), "unexpected error: {err}");
    }

    #[rstest]
    fn serialize_value_rewrites_existing_paths_recursively(workdir: TempDir) {
        let dir = utf8(&workdir);
        let output = dir.join("energy.ene");
        std::fs::write(&output, b"1.0 2.0").expect("seed output");

        let value = json!({
            "energy": output.as_str(),
            "label": "not a file",
            "nested": [output.as_str(), 3],
        });
        let serialised = serialize_value(value);

        assert_eq!(serialised["energy"]["path"], output.as_str());
        assert_eq!(serialised["energy"]["extension"], "ene");
        assert!(serialised["energy"]["content"].is_null());
        assert_eq!(serialised["label"], "not a file");
        assert_eq!(serialised["nested"][0]["extension"], "ene");
        assert_eq!(serialised["nested"][1], 3);
    }

    #[rstest]
    #[case(json!("just text"))]
    #[case(json!(42))]
    #[case(json!({"a": ["b", {"c": null}]}))]
    fn non_path_values_round_trip_unchanged(workdir: TempDir, #[case] value: Value) {
        let dir = utf8(&workdir);
        let serialised = serialize_value(value.clone());
        assert_eq!(serialised, value);
        let restored = deserialize_value(serialised, &dir).expect("deserialise");
        assert_eq!(restored, value);
    }

    #[rstest]
    fn serialised_output_materialises_byte_identical(workdir: TempDir) {
        let dir = utf8(&workdir);
        let output = dir.join("gromitout.out");
        std::fs::write(&output, b"step 1\nstep 2\n").expect("seed output");

        let serialised = serialize_value(Value::String(output.to_string()));
        let other_tmp = TempDir::new().expect("second tempdir");
        let other = utf8(&other_tmp);
        let restored = deserialize_value(serialised, &other).expect("materialise");

        let Value::String(local) = restored else {
            panic!("expected a path string, got {restored:?}");
        };
        assert_eq!(
            read_bytes(Utf8Path::new(&local)).expect("read copy"),
            b"step 1\nstep 2\n"
        );
    }
}
