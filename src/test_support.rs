//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, MutexGuard as StdMutexGuard, PoisonError};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Map;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

use crate::command::{CommandError, CommandOutput, CommandRunner};
use crate::orchestrator::{OrchestratorSettings, RetryPolicy};
use crate::remote::{
    JobDraft, JobState, RemoteError, RemoteExecution, RemoteFuture, RemoteJob, ServiceHandle,
};
use crate::task::{
    JobInputs, JobType, NamedInput, ServiceRef, TaskDescriptor, TaskId, TaskStatus, job_name_for,
};

fn lock<T>(mutex: &Mutex<T>) -> StdMutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Pushes a successful exit status with the given stdout.
    pub fn push_success(&self, stdout: impl Into<String>) {
        self.push_output(Some(0), stdout, "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32, stderr: impl Into<String>) {
        self.push_output(Some(code), "", stderr);
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        lock(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        lock(&self.responses)
            .pop_front()
            .ok_or_else(|| CommandError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}

/// Service reference pointing at a local test endpoint.
#[must_use]
pub fn service_ref(name: &str) -> ServiceRef {
    ServiceRef {
        name: name.to_owned(),
        host: String::from("localhost"),
        port: crate::task::DEFAULT_SERVICE_PORT,
        image: String::from("example/cerise:test"),
        credentials: None,
    }
}

/// Minimal input set with two declared files and no primary input.
#[must_use]
pub fn job_inputs(workdir: &Utf8Path) -> JobInputs {
    JobInputs {
        workflow: Utf8PathBuf::from("workflows/solvent_ligand.cwl"),
        files: vec![
            NamedInput {
                name: String::from("ligand_file"),
                path: workdir.join("ligand.pdb"),
            },
            NamedInput {
                name: String::from("topology_file"),
                path: workdir.join("ligand.itp"),
            },
        ],
        primary: None,
        secondary: None,
        parameters: Map::new(),
    }
}

/// Descriptor for `task_id` owned by `owner` in the given status.
#[must_use]
pub fn descriptor(task_id: &str, owner: &str, status: TaskStatus) -> TaskDescriptor {
    let task_id = TaskId::new(task_id);
    let workdir = Utf8PathBuf::from("/tmp/simrelay").join(task_id.as_str());
    TaskDescriptor {
        job_name: job_name_for(&task_id),
        task_id,
        owner: owner.to_owned(),
        service: service_ref("svc"),
        job_type: JobType::SolventLigand,
        inputs: job_inputs(&workdir),
        workdir,
        clean_remote: true,
        status,
        results: BTreeMap::new(),
    }
}

/// Settings with millisecond polling for fast tests.
#[must_use]
pub fn fast_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        poll_interval: Duration::from_millis(1),
        waiting_poll_interval: Duration::from_millis(1),
        retry: RetryPolicy {
            max_attempts: 3,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        },
        ..OrchestratorSettings::default()
    }
}

#[derive(Debug)]
struct FakeJob {
    id: String,
    state: JobState,
    script: VecDeque<JobState>,
    outputs: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct FakeState {
    services: BTreeMap<String, String>,
    jobs: BTreeMap<(String, String), FakeJob>,
    scripts: BTreeMap<String, VecDeque<JobState>>,
    outputs: BTreeMap<String, BTreeMap<String, String>>,
    failing_outputs: BTreeSet<String>,
    vanishing_jobs: BTreeMap<String, u32>,
    vanishing_services: BTreeMap<String, u32>,
    transient_failures: u32,
    withhold_handle: bool,
    next_id: u32,
    require_calls: usize,
    provisions: usize,
    launched: Vec<JobDraft>,
    destroyed_jobs: Vec<String>,
    destroyed_services: Vec<String>,
}

impl FakeState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn handle(&self, service: &ServiceRef) -> Option<ServiceHandle> {
        self.services
            .get(&service.name)
            .map(|instance_id| ServiceHandle {
                service: service.clone(),
                instance_id: instance_id.clone(),
            })
    }

    fn live(&self, service: &ServiceHandle) -> Result<(), RemoteError> {
        if self.services.get(&service.service.name) == Some(&service.instance_id) {
            Ok(())
        } else {
            Err(RemoteError::Api {
                message: format!("connection refused: {}", service.service.base_url()),
            })
        }
    }
}

fn snapshot(name: &str, job: &FakeJob) -> RemoteJob {
    RemoteJob {
        id: job.id.clone(),
        name: name.to_owned(),
        state: job.state,
        outputs: job.outputs.keys().cloned().collect(),
    }
}

fn take_one(counters: &mut BTreeMap<String, u32>, name: &str) -> bool {
    match counters.get_mut(name) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

fn ready<'a, T: Send + 'a>(value: Result<T, RemoteError>) -> RemoteFuture<'a, T> {
    Box::pin(async move { value })
}

/// In-memory [`RemoteExecution`] with scripted job state sequences and
/// fault injection. Clones share state.
#[derive(Clone, Debug, Default)]
pub struct FakeRemote {
    state: Arc<Mutex<FakeState>>,
}

impl FakeRemote {
    /// Creates a remote with no services or jobs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// States the named job moves through, one per poll, once launched. The
    /// first state is the one reported right after launch.
    pub fn script_job(&self, job_name: &str, states: &[JobState]) {
        lock(&self.state)
            .scripts
            .insert(job_name.to_owned(), states.iter().copied().collect());
    }

    /// Outputs the named job exposes once launched, with their contents.
    pub fn set_outputs(&self, job_name: &str, outputs: &[(&str, &str)]) {
        lock(&self.state).outputs.insert(
            job_name.to_owned(),
            outputs
                .iter()
                .map(|(name, content)| ((*name).to_owned(), (*content).to_owned()))
                .collect(),
        );
    }

    /// Makes copying the named output fail.
    pub fn fail_output(&self, output: &str) {
        lock(&self.state).failing_outputs.insert(output.to_owned());
    }

    /// Deletes the named job the next `times` it is polled after launch, as
    /// if it were removed out of band while being waited on.
    pub fn vanish_job_on_poll(&self, job_name: &str, times: u32) {
        lock(&self.state)
            .vanishing_jobs
            .insert(job_name.to_owned(), times);
    }

    /// Destroys the service hosting the named job the next `times` the job
    /// is polled after launch.
    pub fn vanish_service_on_poll(&self, job_name: &str, times: u32) {
        lock(&self.state)
            .vanishing_services
            .insert(job_name.to_owned(), times);
    }

    /// Makes the next `count` provisioning calls fail transiently.
    pub fn fail_provisioning(&self, count: u32) {
        lock(&self.state).transient_failures = count;
    }

    /// Makes provisioning succeed without producing a handle.
    pub fn withhold_handle(&self) {
        lock(&self.state).withhold_handle = true;
    }

    /// Starts a service directly, bypassing provisioning counters.
    pub fn seed_service(&self, service: &ServiceRef) -> ServiceHandle {
        let mut state = lock(&self.state);
        let instance_id = state.next_id("svc");
        state
            .services
            .insert(service.name.clone(), instance_id.clone());
        ServiceHandle {
            service: service.clone(),
            instance_id,
        }
    }

    /// Registers a job in `state` on a running service without launching
    /// it through [`RemoteExecution::run`].
    pub fn seed_job(&self, service: &ServiceRef, job_name: &str, job_state: JobState) {
        let mut state = lock(&self.state);
        let id = state.next_id("job");
        state.jobs.insert(
            (service.name.clone(), job_name.to_owned()),
            FakeJob {
                id,
                state: job_state,
                script: VecDeque::new(),
                outputs: BTreeMap::new(),
            },
        );
    }

    /// Destroys a service out of band, together with its jobs.
    pub fn remove_service(&self, name: &str) {
        let mut state = lock(&self.state);
        state.services.remove(name);
        state.jobs.retain(|(service, _), _| service != name);
    }

    /// Deletes a job out of band.
    pub fn remove_job(&self, service: &str, job_name: &str) {
        lock(&self.state)
            .jobs
            .remove(&(service.to_owned(), job_name.to_owned()));
    }

    /// Number of provisioning calls made.
    #[must_use]
    pub fn require_calls(&self) -> usize {
        lock(&self.state).require_calls
    }

    /// Number of services actually created by provisioning.
    #[must_use]
    pub fn provisions(&self) -> usize {
        lock(&self.state).provisions
    }

    /// Names of live services.
    #[must_use]
    pub fn live_services(&self) -> Vec<String> {
        lock(&self.state).services.keys().cloned().collect()
    }

    /// Names of jobs registered on `service`.
    #[must_use]
    pub fn job_names(&self, service: &str) -> Vec<String> {
        lock(&self.state)
            .jobs
            .keys()
            .filter(|(owner, _)| owner == service)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Drafts launched so far, in launch order.
    #[must_use]
    pub fn launched(&self) -> Vec<JobDraft> {
        lock(&self.state).launched.clone()
    }

    /// Names of jobs destroyed so far.
    #[must_use]
    pub fn destroyed_jobs(&self) -> Vec<String> {
        lock(&self.state).destroyed_jobs.clone()
    }

    /// Names of services destroyed so far.
    #[must_use]
    pub fn destroyed_services(&self) -> Vec<String> {
        lock(&self.state).destroyed_services.clone()
    }
}

impl RemoteExecution for FakeRemote {
    fn require_service<'a>(
        &'a self,
        service: &'a ServiceRef,
    ) -> RemoteFuture<'a, Option<ServiceHandle>> {
        let mut state = lock(&self.state);
        state.require_calls += 1;
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return ready(Err(RemoteError::Provisioning {
                service: service.name.clone(),
                message: String::from("port is already allocated"),
            }));
        }
        if state.withhold_handle {
            return ready(Ok(None));
        }
        if let Some(handle) = state.handle(service) {
            return ready(Ok(Some(handle)));
        }
        let instance_id = state.next_id("svc");
        state
            .services
            .insert(service.name.clone(), instance_id.clone());
        state.provisions += 1;
        ready(Ok(Some(ServiceHandle {
            service: service.clone(),
            instance_id,
        })))
    }

    fn service_from_ref<'a>(
        &'a self,
        service: &'a ServiceRef,
    ) -> RemoteFuture<'a, Option<ServiceHandle>> {
        ready(Ok(lock(&self.state).handle(service)))
    }

    fn list_jobs<'a>(&'a self, service: &'a ServiceHandle) -> RemoteFuture<'a, Vec<RemoteJob>> {
        let state = lock(&self.state);
        let result = state.live(service).map(|()| {
            state
                .jobs
                .iter()
                .filter(|((owner, _), _)| *owner == service.service.name)
                .map(|((_, name), job)| snapshot(name, job))
                .collect()
        });
        ready(result)
    }

    fn get_job<'a>(
        &'a self,
        service: &'a ServiceHandle,
        name: &'a str,
    ) -> RemoteFuture<'a, Option<RemoteJob>> {
        let mut state = lock(&self.state);
        if let Err(err) = state.live(service) {
            return ready(Err(err));
        }
        let key = (service.service.name.clone(), name.to_owned());
        if state.jobs.contains_key(&key) {
            if take_one(&mut state.vanishing_services, name) {
                let owner = service.service.name.clone();
                state.services.remove(&owner);
                state.jobs.retain(|(candidate, _), _| *candidate != owner);
                return ready(state.live(service).map(|()| None));
            }
            if take_one(&mut state.vanishing_jobs, name) {
                state.jobs.remove(&key);
                return ready(Ok(None));
            }
        }
        let result = state.jobs.get_mut(&key).map(|job| {
            if let Some(next) = job.script.pop_front() {
                job.state = next;
            }
            snapshot(name, job)
        });
        ready(Ok(result))
    }

    fn run<'a>(
        &'a self,
        service: &'a ServiceHandle,
        draft: JobDraft,
    ) -> RemoteFuture<'a, RemoteJob> {
        let mut state = lock(&self.state);
        if let Err(err) = state.live(service) {
            return ready(Err(err));
        }
        let name = draft.name().to_owned();
        let mut script = state.scripts.get(&name).cloned().unwrap_or_default();
        let initial = script.pop_front().unwrap_or(JobState::Waiting);
        let outputs = state.outputs.get(&name).cloned().unwrap_or_default();
        let id = state.next_id("job");
        let job = FakeJob {
            id,
            state: initial,
            script,
            outputs,
        };
        let remote_job = snapshot(&name, &job);
        state
            .jobs
            .insert((service.service.name.clone(), name), job);
        state.launched.push(draft);
        ready(Ok(remote_job))
    }

    fn job_log<'a>(
        &'a self,
        service: &'a ServiceHandle,
        job: &'a RemoteJob,
    ) -> RemoteFuture<'a, String> {
        let result = lock(&self.state)
            .live(service)
            .map(|()| format!("{} finished in state {:?}\n", job.name, job.state));
        ready(result)
    }

    fn save_output<'a>(
        &'a self,
        service: &'a ServiceHandle,
        job: &'a RemoteJob,
        output: &'a str,
        destination: &'a Utf8Path,
    ) -> RemoteFuture<'a, ()> {
        let state = lock(&self.state);
        if let Err(err) = state.live(service) {
            return ready(Err(err));
        }
        if state.failing_outputs.contains(output) {
            return ready(Err(RemoteError::Api {
                message: format!("output {output} unavailable"),
            }));
        }
        let key = (service.service.name.clone(), job.name.clone());
        let content = state
            .jobs
            .get(&key)
            .and_then(|stored| stored.outputs.get(output))
            .cloned();
        drop(state);
        let result = match content {
            Some(content) => {
                std::fs::write(destination, content).map_err(|err| RemoteError::Io {
                    path: destination.to_path_buf(),
                    message: err.to_string(),
                })
            }
            None => Err(RemoteError::Api {
                message: format!("job {} has no output {output}", job.name),
            }),
        };
        ready(result)
    }

    fn destroy_job<'a>(
        &'a self,
        service: &'a ServiceHandle,
        job: &'a RemoteJob,
    ) -> RemoteFuture<'a, ()> {
        let mut state = lock(&self.state);
        if let Err(err) = state.live(service) {
            return ready(Err(err));
        }
        state
            .jobs
            .remove(&(service.service.name.clone(), job.name.clone()));
        state.destroyed_jobs.push(job.name.clone());
        ready(Ok(()))
    }

    fn stop_service<'a>(&'a self, service: &'a ServiceHandle) -> RemoteFuture<'a, ()> {
        ready(lock(&self.state).live(service))
    }

    fn destroy_service<'a>(&'a self, service: &'a ServiceHandle) -> RemoteFuture<'a, ()> {
        let mut state = lock(&self.state);
        state.services.remove(&service.service.name);
        let name = service.service.name.clone();
        state.jobs.retain(|(owner, _), _| *owner != name);
        state.destroyed_services.push(name);
        ready(Ok(()))
    }
}
