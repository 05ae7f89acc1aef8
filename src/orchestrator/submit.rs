//! Idempotent job submission.

use tracing::{info, warn};

use super::{TaskError, TaskOrchestrator};
use crate::remote::{JobDraft, RemoteExecution, RemoteJob, ServiceHandle};
use crate::store::StateStore;
use crate::task::JobInputs;

impl<R, S> TaskOrchestrator<R, S>
where
    R: RemoteExecution,
    S: StateStore,
{
    /// Ensures a job named `job_name` exists on `service` and has been
    /// launched.
    ///
    /// A job that is waiting, running or already successful is returned
    /// untouched. A job in any other state is destroyed and recreated under
    /// the same name. Inputs are only attached to freshly created jobs, so
    /// no job is launched twice.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Remote`] when the service rejects a request.
    pub async fn ensure_job(
        &self,
        service: &ServiceHandle,
        job_name: &str,
        inputs: &JobInputs,
    ) -> Result<RemoteJob, TaskError> {
        if let Some(existing) = self.remote.get_job(service, job_name).await? {
            if existing.state.is_reusable() {
                info!(job_name, state = ?existing.state, "resuming existing job");
                return Ok(existing);
            }
            warn!(job_name, state = ?existing.state, "destroying unusable job before recreating it");
            self.remote.destroy_job(service, &existing).await?;
        }

        let draft = build_draft(service, job_name, inputs);
        let job = self.remote.run(service, draft).await?;
        info!(job_name, job_id = %job.id, state = ?job.state, "launched job");
        Ok(job)
    }
}

fn build_draft(service: &ServiceHandle, job_name: &str, inputs: &JobInputs) -> JobDraft {
    let mut draft = service.create_job(job_name);
    draft.set_workflow(&inputs.workflow);
    for input in &inputs.files {
        draft.add_input_file(&input.name, &input.path);
    }
    match &inputs.primary {
        Some(primary) => draft.add_input_file(&primary.name, &primary.path),
        None => info!(
            job_name,
            "primary structural input absent; using the reduced-input workflow"
        ),
    }

    if let Some(secondary) = &inputs.secondary {
        let anchored = draft
            .input_files()
            .iter()
            .any(|(name, _)| *name == secondary.anchor);
        if anchored {
            for path in &secondary.paths {
                draft.add_secondary_file(&secondary.anchor, path);
            }
        } else {
            warn!(
                job_name,
                anchor = %secondary.anchor,
                "auxiliary files skipped; their anchor input is not attached"
            );
        }
    }

    for (key, value) in &inputs.parameters {
        draft.set_input(key, value.clone());
    }
    draft
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{NamedInput, SecondaryFiles};
    use crate::test_support::service_ref;
    use camino::Utf8PathBuf;
    use rstest::rstest;
    use serde_json::{Map, Value};

    fn handle() -> ServiceHandle {
        ServiceHandle {
            service: service_ref("svc"),
            instance_id: String::from("c-1"),
        }
    }

    fn inputs(primary: bool, anchor: &str) -> JobInputs {
        JobInputs {
            workflow: Utf8PathBuf::from("/wf/protein_ligand.cwl"),
            files: vec![
                NamedInput {
                    name: String::from("protein_top"),
                    path: Utf8PathBuf::from("/w/protein.top"),
                },
                NamedInput {
                    name: String::from("ligand_file"),
                    path: Utf8PathBuf::from("/w/ligand.pdb"),
                },
            ],
            primary: primary.then(|| NamedInput {
                name: String::from("protein_file"),
                path: Utf8PathBuf::from("/w/protein.pdb"),
            }),
            secondary: Some(SecondaryFiles {
                anchor: anchor.to_owned(),
                paths: vec![Utf8PathBuf::from("/w/attype.itp")],
            }),
            parameters: Map::from_iter([(String::from("sim_time"), Value::from(0.001))]),
        }
    }

    #[rstest]
    fn draft_attaches_primary_after_declared_inputs() {
        let draft = build_draft(&handle(), "job-1", &inputs(true, "protein_top"));
        let names: Vec<_> = draft
            .input_files()
            .iter()
            .map(|(name, _)| name.as_str())
            .collect();
        assert_eq!(names, ["protein_top", "ligand_file", "protein_file"]);
        assert_eq!(draft.secondary_files().len(), 1);
        assert_eq!(
            draft.workflow(),
            Some(camino::Utf8Path::new("/wf/protein_ligand.cwl"))
        );
        assert_eq!(draft.parameters().get("sim_time"), Some(&Value::from(0.001)));
    }

    #[rstest]
    fn draft_without_primary_omits_it() {
        let draft = build_draft(&handle(), "job-1", &inputs(false, "protein_top"));
        assert!(
            draft
                .input_files()
                .iter()
                .all(|(name, _)| name != "protein_file")
        );
    }

    #[rstest]
    fn unanchored_auxiliary_files_are_skipped() {
        let draft = build_draft(&handle(), "job-1", &inputs(true, "missing_input"));
        assert!(draft.secondary_files().is_empty());
    }
}
