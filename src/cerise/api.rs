//! REST and WebDAV calls against a running service.

use std::sync::LazyLock;
use std::time::Duration;

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::files;
use crate::remote::{JobDraft, JobState, RemoteError, RemoteJob};

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Job description as returned by the service.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub(super) struct JobRecord {
    pub(super) id: String,
    pub(super) name: String,
    pub(super) state: String,
    #[serde(default)]
    pub(super) output: Option<Map<String, Value>>,
}

impl JobRecord {
    pub(super) fn to_remote(&self) -> RemoteJob {
        let outputs = self
            .output
            .iter()
            .flat_map(Map::iter)
            .filter(|(_, value)| output_location(value).is_some())
            .map(|(name, _)| name.clone())
            .collect();
        RemoteJob {
            id: self.id.clone(),
            name: self.name.clone(),
            state: JobState::parse(&self.state),
            outputs,
        }
    }

    fn location_of(&self, output: &str) -> Option<&str> {
        self.output
            .as_ref()
            .and_then(|outputs| outputs.get(output))
            .and_then(output_location)
    }
}

fn output_location(value: &Value) -> Option<&str> {
    value.get("location").and_then(Value::as_str)
}

#[derive(Debug, Serialize)]
struct NewJob<'a> {
    name: &'a str,
    workflow: String,
    input: Map<String, Value>,
}

/// Thin client for the service's job and file endpoints.
#[derive(Clone, Debug)]
pub(super) struct CeriseApi {
    base_url: String,
}

impl CeriseApi {
    pub(super) fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        }
    }

    fn jobs_url(&self) -> String {
        format!("{}/jobs", self.base_url)
    }

    fn input_url(&self, job_name: &str, file_name: &str) -> String {
        format!("{}/files/input/{job_name}/{file_name}", self.base_url)
    }

    /// Returns `true` once the job endpoint answers.
    pub(super) async fn is_ready(&self) -> bool {
        HTTP_CLIENT
            .get(self.jobs_url())
            .send()
            .await
            .is_ok_and(|response| response.status().is_success())
    }

    pub(super) async fn list_jobs(&self) -> Result<Vec<JobRecord>, RemoteError> {
        let response = send(HTTP_CLIENT.get(self.jobs_url())).await?;
        response
            .json::<Vec<JobRecord>>()
            .await
            .map_err(|err| RemoteError::InvalidResponse {
                message: err.to_string(),
            })
    }

    pub(super) async fn find_job(&self, name: &str) -> Result<Option<JobRecord>, RemoteError> {
        Ok(self
            .list_jobs()
            .await?
            .into_iter()
            .find(|record| record.name == name))
    }

    async fn job(&self, id: &str) -> Result<JobRecord, RemoteError> {
        let url = format!("{}/{id}", self.jobs_url());
        send(HTTP_CLIENT.get(url))
            .await?
            .json::<JobRecord>()
            .await
            .map_err(|err| RemoteError::InvalidResponse {
                message: err.to_string(),
            })
    }

    /// Uploads the draft's files and creates the job.
    pub(super) async fn submit(&self, draft: &JobDraft) -> Result<JobRecord, RemoteError> {
        let workflow_path = draft.workflow().ok_or_else(|| RemoteError::Api {
            message: format!("job {} has no workflow", draft.name()),
        })?;
        let workflow = self.upload(draft.name(), workflow_path).await?;

        let mut input = draft.parameters().clone();
        for (name, path) in draft.input_files() {
            let location = self.upload(draft.name(), path).await?;
            input.insert(name.clone(), file_object(&location));
        }
        for (anchor, path) in draft.secondary_files() {
            let location = self.upload(draft.name(), path).await?;
            if let Some(Value::Object(file)) = input.get_mut(anchor) {
                let secondary = file
                    .entry("secondaryFiles")
                    .or_insert_with(|| Value::Array(Vec::new()));
                if let Value::Array(entries) = secondary {
                    entries.push(file_object(&location));
                }
            }
        }

        let body = NewJob {
            name: draft.name(),
            workflow,
            input,
        };
        send(HTTP_CLIENT.post(self.jobs_url()).json(&body))
            .await?
            .json::<JobRecord>()
            .await
            .map_err(|err| RemoteError::InvalidResponse {
                message: err.to_string(),
            })
    }

    async fn upload(&self, job_name: &str, path: &Utf8Path) -> Result<String, RemoteError> {
        let file_name = path.file_name().ok_or_else(|| RemoteError::Io {
            path: path.to_path_buf(),
            message: String::from("path has no file name"),
        })?;
        let bytes = files::read_bytes(path).map_err(|err| RemoteError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        let url = self.input_url(job_name, file_name);
        send(HTTP_CLIENT.put(&url).body(bytes)).await?;
        Ok(url)
    }

    pub(super) async fn log(&self, id: &str) -> Result<String, RemoteError> {
        let url = format!("{}/{id}/log", self.jobs_url());
        send(HTTP_CLIENT.get(url))
            .await?
            .text()
            .await
            .map_err(|err| RemoteError::InvalidResponse {
                message: err.to_string(),
            })
    }

    /// Downloads output `output` of job `id` to `destination`.
    pub(super) async fn download(
        &self,
        id: &str,
        output: &str,
        destination: &Utf8Path,
    ) -> Result<(), RemoteError> {
        let record = self.job(id).await?;
        let location = record.location_of(output).ok_or_else(|| RemoteError::Api {
            message: format!("job {} exposes no output {output}", record.name),
        })?;
        let bytes = send(HTTP_CLIENT.get(location))
            .await?
            .bytes()
            .await
            .map_err(|err| RemoteError::Api {
                message: err.to_string(),
            })?;
        write_file(destination, &bytes)
    }

    pub(super) async fn delete(&self, id: &str) -> Result<(), RemoteError> {
        let url = format!("{}/{id}", self.jobs_url());
        send(HTTP_CLIENT.delete(url)).await.map(|_| ())
    }
}

fn file_object(location: &str) -> Value {
    json!({"class": "File", "location": location})
}

async fn send(request: reqwest::RequestBuilder) -> Result<reqwest::Response, RemoteError> {
    let response = request.send().await.map_err(|err| RemoteError::Api {
        message: err.to_string(),
    })?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RemoteError::Api {
        message: format!("HTTP {status}: {body}"),
    })
}

fn write_file(destination: &Utf8Path, bytes: &[u8]) -> Result<(), RemoteError> {
    let io_error = |err: std::io::Error| RemoteError::Io {
        path: destination.to_path_buf(),
        message: err.to_string(),
    };
    let parent = destination.parent().ok_or_else(|| RemoteError::Io {
        path: destination.to_path_buf(),
        message: String::from("destination has no parent directory"),
    })?;
    let file_name = destination.file_name().ok_or_else(|| RemoteError::Io {
        path: destination.to_path_buf(),
        message: String::from("destination has no file name"),
    })?;
    Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(io_error)?
        .write(file_name, bytes)
        .map_err(io_error)
}
