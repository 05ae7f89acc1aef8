//! Unit tests for provisioning, job submission and teardown.

use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};

use super::*;
use crate::remote::JobState;
use crate::store::MemoryStore;
use crate::test_support::{FakeRemote, descriptor, fast_settings, job_inputs, service_ref};

type Orchestrator = TaskOrchestrator<FakeRemote, MemoryStore>;

#[fixture]
fn orchestrator() -> Orchestrator {
    TaskOrchestrator::new(FakeRemote::new(), MemoryStore::new(), fast_settings())
}

#[rstest]
#[tokio::test]
async fn ensure_service_reuses_a_live_service(orchestrator: Orchestrator) {
    let service = service_ref("svc");
    let first = orchestrator
        .ensure_service(&service)
        .await
        .expect("first ensure")
        .expect("handle");
    let second = orchestrator
        .ensure_service(&service)
        .await
        .expect("second ensure")
        .expect("handle");

    assert_eq!(first, second);
    assert_eq!(orchestrator.remote().require_calls(), 1);
}

#[rstest]
#[tokio::test]
async fn concurrent_ensure_service_yields_one_instance(orchestrator: Orchestrator) {
    let service = service_ref("svc");
    let (left, right) = tokio::join!(
        orchestrator.ensure_service(&service),
        orchestrator.ensure_service(&service)
    );
    let left = left.expect("left").expect("left handle");
    let right = right.expect("right").expect("right handle");

    assert_eq!(left.instance_id, right.instance_id);
    assert_eq!(orchestrator.remote().provisions(), 1);
    assert_eq!(orchestrator.remote().live_services(), ["svc"]);
}

#[rstest]
#[tokio::test]
async fn transient_provisioning_errors_are_retried(orchestrator: Orchestrator) {
    orchestrator.remote().fail_provisioning(2);
    let handle = orchestrator
        .ensure_service(&service_ref("svc"))
        .await
        .expect("ensure after retries");

    assert!(handle.is_some());
    assert_eq!(orchestrator.remote().require_calls(), 3);
}

#[rstest]
#[tokio::test]
async fn provisioning_gives_up_after_the_bound(orchestrator: Orchestrator) {
    orchestrator.remote().fail_provisioning(10);
    let err = orchestrator
        .ensure_service(&service_ref("svc"))
        .await
        .expect_err("retries exhausted");

    assert!(matches!(
        err,
        TaskError::ProvisioningFailed { attempts: 3, .. }
    ));
    assert_eq!(orchestrator.remote().require_calls(), 3);
}

#[rstest]
#[tokio::test]
async fn accepted_provisioning_without_handle_returns_none(orchestrator: Orchestrator) {
    orchestrator.remote().withhold_handle();
    let handle = orchestrator
        .ensure_service(&service_ref("svc"))
        .await
        .expect("no error");
    assert!(handle.is_none());
}

#[rstest]
#[tokio::test]
async fn ensure_job_is_idempotent(orchestrator: Orchestrator) {
    let handle = orchestrator.remote().seed_service(&service_ref("svc"));
    let inputs = job_inputs(&Utf8PathBuf::from("/w"));

    let first = orchestrator
        .ensure_job(&handle, "simrelay-t1", &inputs)
        .await
        .expect("first ensure");
    let second = orchestrator
        .ensure_job(&handle, "simrelay-t1", &inputs)
        .await
        .expect("second ensure");

    assert_eq!(first.id, second.id);
    assert_eq!(orchestrator.remote().launched().len(), 1);
    assert_eq!(orchestrator.remote().job_names("svc"), ["simrelay-t1"]);
}

#[rstest]
#[case(JobState::Waiting, false)]
#[case(JobState::Running, false)]
#[case(JobState::Success, false)]
#[case(JobState::PermanentFailure, true)]
#[case(JobState::Cancelled, true)]
#[case(JobState::Unknown, true)]
#[tokio::test]
async fn ensure_job_recreates_only_unusable_jobs(
    orchestrator: Orchestrator,
    #[case] existing: JobState,
    #[case] recreated: bool,
) {
    let service = service_ref("svc");
    let handle = orchestrator.remote().seed_service(&service);
    orchestrator
        .remote()
        .seed_job(&service, "simrelay-t1", existing);

    let job = orchestrator
        .ensure_job(&handle, "simrelay-t1", &job_inputs(&Utf8PathBuf::from("/w")))
        .await
        .expect("ensure job");

    assert_eq!(orchestrator.remote().launched().len(), usize::from(recreated));
    assert_eq!(
        orchestrator.remote().destroyed_jobs().len(),
        usize::from(recreated)
    );
    assert_eq!(orchestrator.remote().job_names("svc").len(), 1);
    if !recreated {
        assert_eq!(job.state, existing);
    }
}

#[rstest]
#[tokio::test]
async fn service_survives_while_owner_has_active_tasks(orchestrator: Orchestrator) {
    let service = service_ref("svc");
    orchestrator.remote().seed_service(&service);
    orchestrator
        .store()
        .insert(&descriptor("other", "alice", TaskStatus::Running))
        .expect("insert");

    let outcome = orchestrator
        .maybe_retire(&service, "alice")
        .await
        .expect("retire");

    assert_eq!(outcome, RetireOutcome::Retained { active: 1 });
    assert_eq!(orchestrator.remote().live_services(), ["svc"]);
}

#[rstest]
#[tokio::test]
async fn service_is_retired_when_owner_is_idle(orchestrator: Orchestrator) {
    let service = service_ref("svc");
    orchestrator.remote().seed_service(&service);
    orchestrator
        .store()
        .insert(&descriptor("done", "alice", TaskStatus::Completed))
        .expect("insert");
    orchestrator
        .store()
        .insert(&descriptor("foreign", "bob", TaskStatus::Running))
        .expect("insert");

    let outcome = orchestrator
        .maybe_retire(&service, "alice")
        .await
        .expect("retire");

    assert_eq!(outcome, RetireOutcome::Retired);
    assert!(orchestrator.remote().live_services().is_empty());
    assert_eq!(orchestrator.remote().destroyed_services(), ["svc"]);
}

#[rstest]
#[tokio::test]
async fn missing_service_counts_as_retired(orchestrator: Orchestrator) {
    let outcome = orchestrator
        .maybe_retire(&service_ref("svc"), "alice")
        .await
        .expect("retire");
    assert_eq!(outcome, RetireOutcome::AlreadyGone);
}

#[rstest]
#[tokio::test]
async fn service_jobs_policy_counts_registered_jobs() {
    let orchestrator = TaskOrchestrator::new(
        FakeRemote::new(),
        MemoryStore::new(),
        OrchestratorSettings {
            retire_policy: RetirePolicy::ServiceJobs,
            ..fast_settings()
        },
    );
    let service = service_ref("svc");
    orchestrator.remote().seed_service(&service);
    orchestrator
        .remote()
        .seed_job(&service, "simrelay-x", JobState::Success);

    let outcome = orchestrator
        .maybe_retire(&service, "alice")
        .await
        .expect("retire");

    assert_eq!(outcome, RetireOutcome::Retained { active: 1 });
}

#[rstest]
fn retry_delay_stays_within_bounds() {
    let policy = RetryPolicy::default();
    for _ in 0..50 {
        let delay = policy.next_delay();
        assert!(delay >= Duration::from_millis(500));
        assert!(delay <= Duration::from_millis(2000));
    }
}
