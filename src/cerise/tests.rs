//! Unit tests for the Cerise client.

use rstest::{fixture, rstest};
use serde_json::json;

use super::api::JobRecord;
use super::*;
use crate::remote::JobState;
use crate::task::CredentialsRef;
use crate::test_support::{CommandInvocation, EnvGuard, ScriptedRunner, service_ref};

#[fixture]
fn runner() -> ScriptedRunner {
    ScriptedRunner::new()
}

#[rstest]
fn missing_container_is_created(runner: ScriptedRunner) {
    runner.push_failure(1, "Error: No such container: svc");
    runner.push_success("abc123\n");
    let runtime = DockerRuntime::new("docker", runner.clone());

    let id = runtime
        .ensure_running(&service_ref("svc"))
        .expect("container created");

    assert_eq!(id, "abc123");
    let calls = runner.invocations();
    assert_eq!(calls.len(), 2);
    assert_eq!(
        calls.get(1).map(CommandInvocation::command_string),
        Some(String::from(
            "docker run -d --name svc -p 29593:29593 example/cerise:test"
        ))
    );
}

#[rstest]
fn stopped_container_is_started(runner: ScriptedRunner) {
    runner.push_success("abc123 false\n");
    runner.push_success("svc\n");
    let runtime = DockerRuntime::new("docker", runner.clone());

    let id = runtime
        .ensure_running(&service_ref("svc"))
        .expect("container started");

    assert_eq!(id, "abc123");
    assert_eq!(
        runner.invocations().get(1).map(CommandInvocation::command_string),
        Some(String::from("docker start svc"))
    );
}

#[rstest]
fn running_container_is_reused(runner: ScriptedRunner) {
    runner.push_success("abc123 true\n");
    let runtime = DockerRuntime::new("docker", runner.clone());

    let id = runtime
        .ensure_running(&service_ref("svc"))
        .expect("container reused");

    assert_eq!(id, "abc123");
    assert_eq!(runner.invocations().len(), 1);
}

#[rstest]
fn failed_run_is_a_transient_provisioning_error(runner: ScriptedRunner) {
    runner.push_failure(1, "Error: No such container: svc");
    runner.push_failure(125, "port is already allocated");
    let runtime = DockerRuntime::new("docker", runner);

    let err = runtime
        .ensure_running(&service_ref("svc"))
        .expect_err("run fails");

    assert!(err.is_transient());
    assert!(err.to_string().contains("port is already allocated"));
}

#[rstest]
fn inspect_failure_other_than_absence_is_a_runtime_error(runner: ScriptedRunner) {
    runner.push_failure(1, "Cannot connect to the Docker daemon");
    let runtime = DockerRuntime::new("docker", runner);

    let err = runtime.inspect("svc").expect_err("daemon down");
    assert!(matches!(err, RemoteError::Runtime { .. }));
}

#[rstest]
fn stopping_a_stopped_container_succeeds(runner: ScriptedRunner) {
    runner.push_failure(1, "Error: container abc123 is not running");
    let runtime = DockerRuntime::new("docker", runner);
    assert!(runtime.stop("abc123").is_ok());
}

#[rstest]
#[tokio::test]
async fn credentials_are_forwarded_to_the_container(runner: ScriptedRunner) {
    let _env = EnvGuard::set_vars(&[("SIMRELAY_TEST_PW", "s3cret")]).await;
    runner.push_failure(1, "Error: No such container: svc");
    runner.push_success("abc123\n");
    let runtime = DockerRuntime::new("docker", runner.clone());
    let mut service = service_ref("svc");
    service.credentials = Some(CredentialsRef {
        username: String::from("alice"),
        password_env: String::from("SIMRELAY_TEST_PW"),
    });

    runtime.ensure_running(&service).expect("container created");

    let line = runner
        .invocations()
        .get(1)
        .map(CommandInvocation::command_string)
        .unwrap_or_default();
    assert!(line.contains("-e CERISE_USERNAME=alice"), "{line}");
    assert!(line.contains("-e CERISE_PASSWORD=s3cret"), "{line}");
}

#[rstest]
#[tokio::test]
async fn service_from_ref_ignores_stopped_containers(runner: ScriptedRunner) {
    runner.push_success("abc123 false\n");
    runner.push_success("abc123 true\n");
    let remote = CeriseRemote::new("docker", runner);
    let service = service_ref("svc");

    let stopped = remote.service_from_ref(&service).await.expect("inspect");
    let running = remote.service_from_ref(&service).await.expect("inspect");

    assert!(stopped.is_none());
    assert_eq!(running.map(|handle| handle.instance_id), Some(String::from("abc123")));
}

#[rstest]
fn job_record_lists_outputs_with_locations() {
    let record: JobRecord = serde_json::from_value(json!({
        "id": "42",
        "name": "simrelay-t1",
        "state": "Success",
        "output": {
            "energyout": {"class": "File", "location": "http://localhost:29593/files/output/42/energy.out"},
            "decompose_out": null
        }
    }))
    .expect("parse record");

    let job = record.to_remote();
    assert_eq!(job.state, JobState::Success);
    assert_eq!(job.outputs, ["energyout"]);
}
