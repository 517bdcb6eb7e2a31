//! Test doubles and fixtures shared across modules

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use gantry_client::{
    ClientError, Coordinator, DownloadResult, PatchResult, UpdateJobInfo, UpdateResult,
    UploadResult,
};
use gantry_core::domain::artifact::ArtifactOptions;
use gantry_core::domain::job::{JobCredentials, JobResponse, JobVariables, SessionInfo};
use gantry_core::domain::runner::RunnerConfig;
use gantry_core::domain::secret::Secret;
use gantry_core::dto::runner::{RegisterRunnerRequest, RegisterRunnerResponse};

use crate::executor::{Executor, ExecutorCommand, ExecutorError, PrepareOptions};
use crate::trace::JobTrace;

pub fn runner_config() -> RunnerConfig {
    serde_json::from_value(serde_json::json!({
        "name": "test-runner",
        "url": "https://ci.example.com",
        "token": "runner-token-0123",
        "executor": "shell",
    }))
    .unwrap()
}

pub fn job_response(id: u64) -> JobResponse {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "token": format!("job-token-{}", id),
    }))
    .unwrap()
}

pub fn job_with_steps(id: u64, steps: serde_json::Value) -> JobResponse {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "token": format!("job-token-{}", id),
        "steps": steps,
    }))
    .unwrap()
}

pub fn secret(provider: &str) -> Secret {
    Secret {
        provider: provider.to_string(),
        file: None,
        params: Default::default(),
    }
}

pub fn job_trace() -> (JobTrace, Arc<MockCoordinator>) {
    let coordinator = Arc::new(MockCoordinator::new());
    let trace = JobTrace::new(
        Arc::new(runner_config()),
        JobCredentials {
            id: 1,
            token: "job-token".to_string(),
        },
        coordinator.clone() as Arc<dyn Coordinator>,
        CancellationToken::new(),
    )
    .unwrap();
    (trace, coordinator)
}

struct MockState {
    patch_response: PatchResult,
    update_response: UpdateResult,
    upload_responses: VecDeque<UploadResult>,
    download_response: DownloadResult,
    jobs: VecDeque<JobResponse>,
    request_errors: u32,
    stream: Vec<u8>,
    patch_count: usize,
    request_count: usize,
    upload_count: usize,
    updates: Vec<UpdateJobInfo>,
    uploads: Vec<ArtifactOptions>,
}

/// Scriptable in-memory coordinator
pub struct MockCoordinator {
    state: Mutex<MockState>,
}

impl MockCoordinator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                patch_response: PatchResult::Accepted {
                    update_interval: None,
                },
                update_response: UpdateResult::Accepted,
                upload_responses: VecDeque::new(),
                download_response: DownloadResult::NotFound,
                jobs: VecDeque::new(),
                request_errors: 0,
                stream: Vec::new(),
                patch_count: 0,
                request_count: 0,
                upload_count: 0,
                updates: Vec::new(),
                uploads: Vec::new(),
            }),
        }
    }

    pub fn respond_to_patch(&self, response: PatchResult) {
        self.state.lock().patch_response = response;
    }

    pub fn respond_to_update(&self, response: UpdateResult) {
        self.state.lock().update_response = response;
    }

    /// Upload responses consumed in order; `Ok` once exhausted.
    pub fn queue_upload_responses(&self, responses: Vec<UploadResult>) {
        self.state.lock().upload_responses = responses.into();
    }

    pub fn respond_to_download(&self, response: DownloadResult) {
        self.state.lock().download_response = response;
    }

    pub fn enqueue_job(&self, job: JobResponse) {
        self.state.lock().jobs.push_back(job);
    }

    pub fn fail_requests(&self, count: u32) {
        self.state.lock().request_errors = count;
    }

    /// The trace as the coordinator accepted it.
    pub fn patched_bytes(&self) -> Vec<u8> {
        self.state.lock().stream.clone()
    }

    pub fn patch_count(&self) -> usize {
        self.state.lock().patch_count
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().request_count
    }

    pub fn upload_count(&self) -> usize {
        self.state.lock().upload_count
    }

    pub fn updates(&self) -> Vec<UpdateJobInfo> {
        self.state.lock().updates.clone()
    }

    pub fn uploads(&self) -> Vec<ArtifactOptions> {
        self.state.lock().uploads.clone()
    }
}

#[async_trait]
impl Coordinator for MockCoordinator {
    async fn register_runner(
        &self,
        _url: &str,
        request: RegisterRunnerRequest,
    ) -> Result<Option<RegisterRunnerResponse>, ClientError> {
        Ok(Some(RegisterRunnerResponse {
            id: 1,
            token: request.token,
        }))
    }

    async fn verify_runner(&self, _runner: &RunnerConfig) -> Result<bool, ClientError> {
        Ok(true)
    }

    async fn unregister_runner(&self, _runner: &RunnerConfig) -> Result<bool, ClientError> {
        Ok(true)
    }

    async fn request_job(
        &self,
        _runner: &RunnerConfig,
        _session: Option<SessionInfo>,
    ) -> Result<Option<JobResponse>, ClientError> {
        let mut state = self.state.lock();
        state.request_count += 1;
        if state.request_errors > 0 {
            state.request_errors -= 1;
            return Err(ClientError::api_error(500, "coordinator unavailable"));
        }
        Ok(state.jobs.pop_front())
    }

    async fn patch_trace(
        &self,
        _runner: &RunnerConfig,
        _job: &JobCredentials,
        patch: &[u8],
        offset: usize,
        _checksum: &str,
    ) -> PatchResult {
        let mut state = self.state.lock();
        state.patch_count += 1;
        let response = state.patch_response.clone();
        if matches!(response, PatchResult::Accepted { .. }) && offset <= state.stream.len() {
            state.stream.truncate(offset);
            state.stream.extend_from_slice(patch);
        }
        response
    }

    async fn update_job(
        &self,
        _runner: &RunnerConfig,
        _job: &JobCredentials,
        update: UpdateJobInfo,
    ) -> UpdateResult {
        let mut state = self.state.lock();
        state.updates.push(update);
        state.update_response
    }

    async fn upload_artifacts(
        &self,
        _runner: &RunnerConfig,
        _job: &JobCredentials,
        _archive: &Path,
        options: &ArtifactOptions,
    ) -> UploadResult {
        let mut state = self.state.lock();
        state.upload_count += 1;
        state.uploads.push(options.clone());
        state.upload_responses.pop_front().unwrap_or(UploadResult::Ok)
    }

    async fn download_artifacts(
        &self,
        _runner: &RunnerConfig,
        _job: &JobCredentials,
        dest: &Path,
        _direct_download: bool,
    ) -> DownloadResult {
        let state = self.state.lock();
        if state.download_response == DownloadResult::Ok {
            // hand back an empty but valid zip archive
            drop(state);
            let file = std::fs::File::create(dest).expect("creating download dest");
            let mut writer = zip::ZipWriter::new(file);
            writer.finish().expect("finishing zip");
            return DownloadResult::Ok;
        }
        state.download_response
    }
}

/// Observers into a [`MockExecutor`] that outlive the boxed executor
#[derive(Clone)]
pub struct ExecutorProbe {
    pub calls: Arc<Mutex<Vec<String>>>,
    pub cleanups: Arc<AtomicU32>,
    /// Environment passed to the most recent `run`.
    pub last_env: Arc<Mutex<Vec<(String, String)>>>,
}

impl ExecutorProbe {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn cleanup_count(&self) -> u32 {
        self.cleanups.load(Ordering::SeqCst)
    }

    pub fn ran_stage(&self, stage: &str) -> bool {
        self.calls().iter().any(|c| c == &format!("run:{}", stage))
    }
}

/// Scriptable executor recording its lifecycle
pub struct MockExecutor {
    probe: ExecutorProbe,
    fail_prepare: bool,
    script_failures: HashMap<String, i32>,
    hang_stages: HashSet<String>,
    runtime_vars: JobVariables,
}

impl MockExecutor {
    pub fn new() -> (Self, ExecutorProbe) {
        let probe = ExecutorProbe {
            calls: Arc::new(Mutex::new(Vec::new())),
            cleanups: Arc::new(AtomicU32::new(0)),
            last_env: Arc::new(Mutex::new(Vec::new())),
        };
        (
            Self {
                probe: probe.clone(),
                fail_prepare: false,
                script_failures: HashMap::new(),
                hang_stages: HashSet::new(),
                runtime_vars: JobVariables::new(),
            },
            probe,
        )
    }

    pub fn fail_prepare(mut self) -> Self {
        self.fail_prepare = true;
        self
    }

    /// Make the named stage exit with `code`.
    pub fn fail_stage(mut self, stage: &str, code: i32) -> Self {
        self.script_failures.insert(stage.to_string(), code);
        self
    }

    /// Make the named stage block until its cancel token fires.
    pub fn hang_stage(mut self, stage: &str) -> Self {
        self.hang_stages.insert(stage.to_string());
        self
    }

    pub fn with_runtime_vars(mut self, vars: JobVariables) -> Self {
        self.runtime_vars = vars;
        self
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn prepare(&mut self, _options: PrepareOptions) -> Result<(), ExecutorError> {
        self.probe.calls.lock().push("prepare".to_string());
        if self.fail_prepare {
            return Err(ExecutorError::system("prepare blew up"));
        }
        Ok(())
    }

    async fn run(&mut self, cmd: ExecutorCommand) -> Result<(), ExecutorError> {
        let name = cmd.stage.name();
        self.probe.calls.lock().push(format!("run:{}", name));
        *self.probe.last_env.lock() = cmd.variables.clone();

        if self.hang_stages.contains(&name) {
            cmd.cancel.cancelled().await;
            return Err(ExecutorError::system("stage canceled"));
        }
        if let Some(code) = self.script_failures.get(&name) {
            return Err(ExecutorError::Script { exit_code: *code });
        }
        Ok(())
    }

    async fn finish(&mut self, success: bool) {
        self.probe.calls.lock().push(format!("finish:{}", success));
    }

    async fn cleanup(&mut self) {
        self.probe.calls.lock().push("cleanup".to_string());
        self.probe.cleanups.fetch_add(1, Ordering::SeqCst);
    }

    fn runtime_variables(&self) -> JobVariables {
        self.runtime_vars.clone()
    }
}
