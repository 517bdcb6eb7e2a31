//! Build state machine
//!
//! Drives one job through the staged pipeline:
//!
//! ```text
//! prepare -> get_sources -> restore_cache -> download_artifacts ->
//! user steps* -> archive_cache / upload_artifacts (on success | on failure) -> cleanup
//! ```
//!
//! Failure classification is upgrade-only, ordered
//! canceled > timed-out > system-failure > script-failure > success. The
//! executor lifecycle is invariant: one prepare, zero-or-more runs, one
//! finish, one cleanup on every path, prepare failure included.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use gantry_client::{Coordinator, UploadResult};
use gantry_core::domain::artifact::ArtifactOptions;
use gantry_core::domain::failure::BuildStatus;
use gantry_core::domain::job::{JobCredentials, JobResponse, JobVariable, JobVariables, StepWhen};
use gantry_core::domain::runner::RunnerConfig;
use gantry_core::domain::stage::BuildStage;
use gantry_core::features;

use crate::artifacts::{self, ArchiveError};
use crate::executor::{Executor, ExecutorCommand, ExecutorError, PrepareOptions};
use crate::secrets::{self, SecretResolverRegistry};
use crate::shells::{self, ScriptInfo, ShellScripter};
use crate::trace::JobTrace;

const DEFAULT_JOB_TIMEOUT: u64 = 3600;
const DEFAULT_STAGE_TIMEOUT: u64 = 3600;
const DEFAULT_PREPARE_TIMEOUT: u64 = 600;
const DEFAULT_CLEANUP_TIMEOUT: u64 = 300;
const UPLOAD_RETRY_DELAY: Duration = Duration::from_secs(5);

/// One job's runtime state machine
pub struct Build {
    job: JobResponse,
    runner: Arc<RunnerConfig>,
    trace: Arc<JobTrace>,
    coordinator: Arc<dyn Coordinator>,
    cancel: CancellationToken,
    status: BuildStatus,
    variables: JobVariables,
    environment: Vec<(String, String)>,
    build_dir: PathBuf,
    /// Holds file variables and scratch archives; removed with the build.
    tmp: TempDir,
}

impl Build {
    pub fn new(
        job: JobResponse,
        runner: Arc<RunnerConfig>,
        trace: Arc<JobTrace>,
        coordinator: Arc<dyn Coordinator>,
    ) -> anyhow::Result<Self> {
        let tmp = tempfile::Builder::new()
            .prefix("gantry-build-")
            .tempdir()
            .context("creating build temp directory")?;

        let build_dir = match &runner.builds_dir {
            Some(dir) => dir.join(format!("job-{}", job.id)),
            None => tmp.path().join("workspace"),
        };

        let cancel = trace.cancel_token();
        let mut build = Self {
            job,
            runner,
            trace,
            coordinator,
            cancel,
            status: BuildStatus::Success,
            variables: JobVariables::new(),
            environment: Vec::new(),
            build_dir,
            tmp,
        };

        build.assemble_base_variables();
        build.trace.set_masked(&build.variables.masked_values());
        Ok(build)
    }

    /// Terminal status wins by severity; later events only upgrade.
    fn upgrade(&mut self, status: BuildStatus) {
        self.status = self.status.combine(status);
    }

    fn flag_on(&self, name: &str) -> bool {
        self.runner.feature_flag_on(name)
    }

    fn skip_noop(&self) -> bool {
        self.flag_on(features::SKIP_NOOP_BUILD_STAGES)
    }

    /// Status for a failed setup stage (sources, cache restore, downloads).
    fn setup_failure_status(&self) -> BuildStatus {
        if self.flag_on(features::NON_FATAL_SETUP_FAILURES) {
            BuildStatus::ScriptFailure
        } else {
            BuildStatus::SystemFailure
        }
    }

    fn stage_timeout(&self, step_timeout: Option<u64>) -> Duration {
        let secs = step_timeout
            .or(self.runner.stage_timeout)
            .unwrap_or(DEFAULT_STAGE_TIMEOUT);
        Duration::from_secs(secs)
    }

    /// Layers 1-3 of the assembly order: predefined, runner-declared, job.
    /// Secrets and executor runtime variables are appended later; lookups
    /// take the last definition, so later layers override earlier ones.
    fn assemble_base_variables(&mut self) {
        let mut vars = JobVariables::new();

        for (key, value) in [
            ("CI", "true".to_string()),
            ("CI_JOB_ID", self.job.id.to_string()),
            ("CI_SERVER_URL", self.runner.url.clone()),
            ("CI_RUNNER_SHORT_TOKEN", self.runner.short_token().to_string()),
            ("CI_PROJECT_DIR", self.build_dir.to_string_lossy().into_owned()),
        ] {
            vars.push(JobVariable {
                internal: true,
                ..JobVariable::new(key, value)
            });
        }

        for (key, value) in self.runner.declared_variables() {
            vars.push(JobVariable::new(key, value));
        }

        vars.extend(self.job.variables.clone());
        self.variables = vars;
    }

    /// Materialize file variables and recompute the exported environment.
    fn refresh_environment(&mut self) -> anyhow::Result<()> {
        let secrets_dir = self.tmp.path().join("vars");

        let mut materialized = JobVariables::new();
        for var in self.variables.iter() {
            let mut var = var.clone();
            if var.file {
                std::fs::create_dir_all(&secrets_dir).context("creating variables dir")?;
                let path = secrets_dir.join(&var.key);
                std::fs::write(&path, &var.value)
                    .with_context(|| format!("writing file variable {}", var.key))?;
                var.value = path.to_string_lossy().into_owned();
            }
            materialized.push(var);
        }

        self.environment = materialized.expanded().to_env();
        Ok(())
    }

    /// Run the full pipeline. Consumes one executor lifecycle.
    pub async fn run(
        &mut self,
        mut executor: Box<dyn Executor>,
        secret_resolvers: &SecretResolverRegistry,
    ) -> BuildStatus {
        info!(
            job_id = self.job.id,
            runner = %self.runner.display_name(),
            "running job"
        );

        let job_timeout =
            Duration::from_secs(self.job.timeout.unwrap_or(DEFAULT_JOB_TIMEOUT));
        let timeout_token = CancellationToken::new();
        let trip = timeout_token.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(job_timeout).await;
            trip.cancel();
        });

        self.execute(&mut executor, secret_resolvers, &timeout_token)
            .await;

        timer.abort();

        executor.finish(self.status.is_success()).await;

        let stage = BuildStage::Cleanup;
        self.trace.section_start(&stage.name());
        let cleanup_timeout = Duration::from_secs(
            self.runner.cleanup_timeout.unwrap_or(DEFAULT_CLEANUP_TIMEOUT),
        );
        if tokio::time::timeout(cleanup_timeout, executor.cleanup())
            .await
            .is_err()
        {
            warn!(job_id = self.job.id, "executor cleanup timed out");
        }
        self.trace.section_end(&stage.name());

        match self.status {
            BuildStatus::Success => self.trace.infoln("Job succeeded"),
            status => self
                .trace
                .errorln(&format!("ERROR: Job failed: {}", status)),
        }

        info!(job_id = self.job.id, status = %self.status, "job finished");
        self.status
    }

    async fn execute(
        &mut self,
        executor: &mut Box<dyn Executor>,
        secret_resolvers: &SecretResolverRegistry,
        timeout_token: &CancellationToken,
    ) {
        let scripter = match shells::scripter_for(&self.runner.shell) {
            Some(s) => s,
            None => {
                self.trace
                    .errorln(&format!("ERROR: unknown shell {:?}", self.runner.shell));
                self.upgrade(BuildStatus::SystemFailure);
                return;
            }
        };
        tracing::debug!(job_id = self.job.id, shell = scripter.name(), "scripts ready");

        // secrets are injected before anything else so every later stage
        // (and the masker) sees them
        if let Err(e) = self.resolve_secrets(secret_resolvers) {
            self.trace
                .errorln(&format!("ERROR: resolving secrets: {}", e));
            self.upgrade(BuildStatus::ScriptFailure);
            return;
        }

        if let Err(e) = self.refresh_environment() {
            self.trace.errorln(&format!("ERROR: {:#}", e));
            self.upgrade(BuildStatus::SystemFailure);
            return;
        }

        // prepare must succeed before any other stage runs
        if let Err(status) = self.prepare(executor, timeout_token).await {
            self.fail_stage(&BuildStage::Prepare, status);
            return;
        }

        self.variables.extend(executor.runtime_variables());
        self.trace.set_masked(&self.variables.masked_values());
        if let Err(e) = self.refresh_environment() {
            self.trace.errorln(&format!("ERROR: {:#}", e));
            self.upgrade(BuildStatus::SystemFailure);
            return;
        }

        // setup stages: failures stop the build before user code runs
        if let Err(status) = self.get_sources(executor, scripter.as_ref(), timeout_token).await
        {
            self.fail_stage(&BuildStage::GetSources, status);
            return;
        }
        if let Err(status) = self.restore_cache(timeout_token).await {
            self.fail_stage(&BuildStage::RestoreCache, status);
            return;
        }
        if let Err(status) = self.download_artifacts(timeout_token).await {
            self.fail_stage(&BuildStage::DownloadArtifacts, status);
            return;
        }

        self.run_user_steps(executor, scripter.as_ref(), timeout_token)
            .await;

        // uploads are skipped on cancellation and timeout, attempted on
        // success and script/system failure paths
        if !matches!(self.status, BuildStatus::Canceled | BuildStatus::TimedOut) {
            self.archive_cache(timeout_token).await;
            self.upload_artifacts().await;
        }
    }

    fn fail_stage(&mut self, stage: &BuildStage, status: BuildStatus) {
        self.trace
            .errorln(&format!("ERROR: stage {} failed: {}", stage, status));
        self.upgrade(status);
    }

    fn resolve_secrets(
        &mut self,
        registry: &SecretResolverRegistry,
    ) -> Result<(), secrets::SecretError> {
        if self.job.secrets.is_empty() {
            return Ok(());
        }

        let fail_if_missing = self.flag_on(features::SECRET_RESOLUTION_FAILS_IF_MISSING);
        let resolved = secrets::resolve(
            registry,
            &self.trace,
            &self.job.secrets,
            fail_if_missing,
        )?;

        self.variables.extend(resolved);
        self.trace.set_masked(&self.variables.masked_values());
        Ok(())
    }

    async fn prepare(
        &mut self,
        executor: &mut Box<dyn Executor>,
        timeout_token: &CancellationToken,
    ) -> Result<(), BuildStatus> {
        let stage = BuildStage::Prepare;
        self.trace.section_start(&stage.name());
        self.trace.noticeln(&format!(
            "Preparing the \"{}\" executor",
            self.runner.executor
        ));

        let options = PrepareOptions {
            runner: Arc::clone(&self.runner),
            trace: Arc::clone(&self.trace),
            build_dir: self.build_dir.clone(),
            image: self.job.image.clone(),
            cancel: self.cancel.clone(),
        };
        let timeout = Duration::from_secs(
            self.runner.prepare_timeout.unwrap_or(DEFAULT_PREPARE_TIMEOUT),
        );

        let result = tokio::select! {
            res = executor.prepare(options) => {
                res.map_err(|e| {
                    self.trace.errorln(&format!("ERROR: preparing executor: {}", e));
                    BuildStatus::SystemFailure
                })
            }
            _ = self.cancel.cancelled() => Err(BuildStatus::Canceled),
            _ = timeout_token.cancelled() => Err(BuildStatus::TimedOut),
            _ = tokio::time::sleep(timeout) => Err(BuildStatus::TimedOut),
        };

        self.trace.section_end(&stage.name());
        result
    }

    /// Run one script stage through the executor, classifying the outcome.
    async fn run_executor_stage(
        &mut self,
        executor: &mut Box<dyn Executor>,
        scripter: &dyn ShellScripter,
        stage: BuildStage,
        lines: &[String],
        timeout: Duration,
        timeout_token: &CancellationToken,
    ) -> Result<(), BuildStatus> {
        let name = stage.name();
        self.trace.section_start(&name);
        if let BuildStage::Step(step) = &stage {
            self.trace.noticeln(&format!("Running step {}", step));
        }

        let script = scripter.generate(&ScriptInfo {
            script_lines: lines,
            build_dir: &self.build_dir,
        });
        let stage_cancel = CancellationToken::new();
        let cmd = ExecutorCommand {
            stage: stage.clone(),
            script,
            variables: self.environment.clone(),
            cancel: stage_cancel.clone(),
        };

        let is_user_step = stage.is_user_step();
        let run_fut = executor.run(cmd);
        tokio::pin!(run_fut);

        let result = tokio::select! {
            res = &mut run_fut => match res {
                Ok(()) => Ok(()),
                Err(ExecutorError::Script { exit_code }) => {
                    self.trace.errorln(&format!(
                        "ERROR: script failed with exit code {}", exit_code
                    ));
                    if is_user_step {
                        Err(BuildStatus::ScriptFailure)
                    } else {
                        Err(self.setup_failure_status())
                    }
                }
                Err(ExecutorError::System(e)) => {
                    self.trace.errorln(&format!("ERROR: {:#}", e));
                    Err(BuildStatus::SystemFailure)
                }
            },
            _ = self.cancel.cancelled() => {
                // drain the running stage through the executor's cancel hook
                stage_cancel.cancel();
                let _ = run_fut.await;
                Err(BuildStatus::Canceled)
            }
            _ = timeout_token.cancelled() => {
                stage_cancel.cancel();
                let _ = run_fut.await;
                Err(BuildStatus::TimedOut)
            }
            _ = tokio::time::sleep(timeout) => {
                self.trace.errorln(&format!(
                    "ERROR: stage {} exceeded its timeout of {:?}", name, timeout
                ));
                stage_cancel.cancel();
                let _ = run_fut.await;
                Err(BuildStatus::TimedOut)
            }
        };

        self.trace.section_end(&name);
        result
    }

    async fn get_sources(
        &mut self,
        executor: &mut Box<dyn Executor>,
        scripter: &dyn ShellScripter,
        timeout_token: &CancellationToken,
    ) -> Result<(), BuildStatus> {
        let Some(git_info) = self.job.git_info.clone() else {
            if self.skip_noop() {
                return Ok(());
            }
            self.trace.writeln("Skipping source checkout");
            return Ok(());
        };

        self.trace
            .noticeln(&format!("Fetching {} @ {}", git_info.ref_name, git_info.sha));

        let mut fetch = format!("git fetch origin {}", shells::quote(&git_info.ref_name));
        if let Some(depth) = git_info.depth {
            fetch = format!(
                "git fetch --depth {} origin {}",
                depth,
                shells::quote(&git_info.ref_name)
            );
        }

        let lines = vec![
            "git init --quiet .".to_string(),
            format!(
                "git remote add origin {url} 2>/dev/null || git remote set-url origin {url}",
                url = shells::quote(&git_info.repo_url)
            ),
            fetch,
            format!("git checkout -f --quiet {}", shells::quote(&git_info.sha)),
        ];

        self.run_executor_stage(
            executor,
            scripter,
            BuildStage::GetSources,
            &lines,
            self.stage_timeout(None),
            timeout_token,
        )
        .await
    }

    async fn restore_cache(
        &mut self,
        timeout_token: &CancellationToken,
    ) -> Result<(), BuildStatus> {
        let restorable: Vec<_> = self
            .job
            .cache
            .iter()
            .filter(|c| c.policy.restores())
            .cloned()
            .collect();
        let Some(cache_dir) = self.runner.cache_dir.clone() else {
            return Ok(());
        };
        if restorable.is_empty() && self.skip_noop() {
            return Ok(());
        }

        let stage = BuildStage::RestoreCache;
        self.trace.section_start(&stage.name());

        let result = self
            .with_stage_control(self.stage_timeout(None), timeout_token, async {
                for directive in &restorable {
                    let key = self.variables.expand_value(&directive.key);
                    let archive = cache_dir.join(format!("{}.zip", cache_file_name(&key)));

                    if !archive.is_file() {
                        self.trace
                            .writeln(&format!("No cache found for key {}", key));
                        continue;
                    }

                    self.trace.writeln(&format!("Restoring cache for key {}", key));
                    std::fs::create_dir_all(&self.build_dir)
                        .map_err(|_| self.setup_failure_status())?;
                    artifacts::extract_zip(&archive, &self.build_dir).map_err(|e| {
                        self.trace.errorln(&format!("ERROR: extracting cache: {}", e));
                        self.setup_failure_status()
                    })?;
                }
                Ok(())
            })
            .await;

        self.trace.section_end(&stage.name());
        result
    }

    async fn download_artifacts(
        &mut self,
        timeout_token: &CancellationToken,
    ) -> Result<(), BuildStatus> {
        if self.job.dependencies.is_empty() {
            return Ok(());
        }

        let stage = BuildStage::DownloadArtifacts;
        self.trace.section_start(&stage.name());

        let dependencies = self.job.dependencies.clone();
        let direct = self.flag_on(features::USE_DIRECT_DOWNLOAD);

        let result = self
            .with_stage_control(self.stage_timeout(None), timeout_token, async {
                for dep in &dependencies {
                    self.trace
                        .writeln(&format!("Downloading artifacts from {}", dep.name));

                    let creds = JobCredentials {
                        id: dep.id,
                        token: dep.token.clone(),
                    };
                    let dest = self.tmp.path().join(format!("dep-{}.zip", dep.id));

                    let mut outcome = self
                        .coordinator
                        .download_artifacts(&self.runner, &creds, &dest, direct)
                        .await;
                    if direct && outcome == gantry_client::DownloadResult::Failed {
                        // fall back to proxying through the coordinator
                        outcome = self
                            .coordinator
                            .download_artifacts(&self.runner, &creds, &dest, false)
                            .await;
                    }

                    match outcome {
                        gantry_client::DownloadResult::Ok => {
                            std::fs::create_dir_all(&self.build_dir)
                                .map_err(|_| self.setup_failure_status())?;
                            artifacts::extract_zip(&dest, &self.build_dir).map_err(|e| {
                                self.trace
                                    .errorln(&format!("ERROR: extracting artifacts: {}", e));
                                self.setup_failure_status()
                            })?;
                        }
                        gantry_client::DownloadResult::NotFound => {
                            self.trace
                                .writeln(&format!("No artifacts found for {}", dep.name));
                        }
                        gantry_client::DownloadResult::Forbidden
                        | gantry_client::DownloadResult::Failed => {
                            self.trace.errorln(&format!(
                                "ERROR: downloading artifacts from {} failed",
                                dep.name
                            ));
                            return Err(self.setup_failure_status());
                        }
                    }
                }
                Ok(())
            })
            .await;

        self.trace.section_end(&stage.name());
        result
    }

    async fn run_user_steps(
        &mut self,
        executor: &mut Box<dyn Executor>,
        scripter: &dyn ShellScripter,
        timeout_token: &CancellationToken,
    ) {
        let steps = self.job.steps.clone();
        for step in steps {
            if matches!(self.status, BuildStatus::Canceled | BuildStatus::TimedOut) {
                break;
            }

            let run_step = match step.when {
                StepWhen::OnSuccess => self.status.is_success(),
                StepWhen::OnFailure => !self.status.is_success(),
                StepWhen::Always => true,
            };
            if !run_step || step.script.is_empty() {
                continue;
            }

            let result = self
                .run_executor_stage(
                    executor,
                    scripter,
                    BuildStage::Step(step.name.clone()),
                    &step.script,
                    self.stage_timeout(step.timeout),
                    timeout_token,
                )
                .await;

            if let Err(status) = result {
                match status {
                    BuildStatus::ScriptFailure if step.allow_failure => {
                        self.trace.warningln(&format!(
                            "WARNING: step {} failed, but is allowed to fail",
                            step.name
                        ));
                    }
                    status => self.upgrade(status),
                }
            }
        }
    }

    async fn archive_cache(&mut self, timeout_token: &CancellationToken) {
        let success = self.status.is_success();
        let archivable: Vec<_> = self
            .job
            .cache
            .iter()
            .filter(|c| c.policy.archives() && c.when.applies(success) && !c.paths.is_empty())
            .cloned()
            .collect();
        let Some(cache_dir) = self.runner.cache_dir.clone() else {
            return;
        };
        if archivable.is_empty() && self.skip_noop() {
            return;
        }

        let stage = if success {
            BuildStage::ArchiveCache
        } else {
            BuildStage::ArchiveCacheOnFailure
        };
        self.trace.section_start(&stage.name());

        let result = self
            .with_stage_control(self.stage_timeout(None), timeout_token, async {
                for directive in &archivable {
                    let key = self.variables.expand_value(&directive.key);
                    self.trace
                        .writeln(&format!("Saving cache for key {}", key));

                    let scratch = self.tmp.path().join("cache.zip");
                    match artifacts::create_archive(
                        &self.build_dir,
                        &directive.paths,
                        gantry_core::domain::artifact::ArchiveFormat::Zip,
                        &scratch,
                    ) {
                        Ok(()) => {}
                        Err(ArchiveError::NoFiles) => {
                            self.trace.writeln("Nothing to cache, skipping");
                            continue;
                        }
                        Err(e) => {
                            self.trace
                                .warningln(&format!("WARNING: creating cache: {}", e));
                            continue;
                        }
                    }

                    let target = cache_dir.join(format!("{}.zip", cache_file_name(&key)));
                    let stored = std::fs::create_dir_all(&cache_dir)
                        .and_then(|_| std::fs::rename(&scratch, &target).or_else(|_| {
                            std::fs::copy(&scratch, &target).map(|_| ())
                        }));
                    if let Err(e) = stored {
                        self.trace
                            .warningln(&format!("WARNING: storing cache: {}", e));
                    }
                }
                Ok(())
            })
            .await;

        if let Err(status) = result {
            // cache archiving never downgrades an existing reason
            self.upgrade(status);
        }
        self.trace.section_end(&stage.name());
    }

    async fn upload_artifacts(&mut self) {
        let success = self.status.is_success();
        let directives: Vec<_> = self
            .job
            .artifacts
            .iter()
            .filter(|d| d.when.applies(success) && !d.paths.is_empty())
            .cloned()
            .collect();
        if directives.is_empty() {
            return;
        }

        let stage = if success {
            BuildStage::UploadArtifactsOnSuccess
        } else {
            BuildStage::UploadArtifactsOnFailure
        };
        self.trace.section_start(&stage.name());

        for directive in directives {
            let base_name = directive
                .name
                .clone()
                .map(|n| self.variables.expand_value(&n))
                .unwrap_or_else(|| "artifacts".to_string());
            let options = ArtifactOptions {
                base_name: base_name.clone(),
                expire_in: directive.expire_in.clone(),
                format: directive.format,
                artifact_type: directive.artifact_type.clone(),
            };

            self.trace
                .noticeln(&format!("Uploading artifacts ({})", base_name));

            let archive = self
                .tmp
                .path()
                .join(format!("{}.{}", base_name, directive.format.file_extension()));
            match artifacts::create_archive(
                &self.build_dir,
                &directive.paths,
                directive.format,
                &archive,
            ) {
                Ok(()) => {}
                Err(ArchiveError::NoFiles) => {
                    self.trace.writeln("No files to upload, skipping");
                    continue;
                }
                Err(e) => {
                    self.trace
                        .errorln(&format!("ERROR: creating artifact archive: {}", e));
                    self.record_upload_failure();
                    continue;
                }
            }

            let coordinator = Arc::clone(&self.coordinator);
            let runner = Arc::clone(&self.runner);
            let creds = self.job.credentials();
            let outcome = self
                .with_upload_retry(&base_name, || {
                    let coordinator = Arc::clone(&coordinator);
                    let runner = Arc::clone(&runner);
                    let creds = creds.clone();
                    let archive = archive.clone();
                    let options = options.clone();
                    async move {
                        coordinator
                            .upload_artifacts(&runner, &creds, &archive, &options)
                            .await
                    }
                })
                .await;

            match outcome {
                UploadResult::Ok => self.trace.writeln("Artifacts uploaded"),
                UploadResult::Forbidden => {
                    self.trace
                        .errorln("ERROR: uploading artifacts is forbidden");
                    self.record_upload_failure();
                }
                UploadResult::TooLarge => {
                    self.trace.errorln("ERROR: artifacts are too large");
                    self.record_upload_failure();
                }
                UploadResult::Failed => {
                    self.trace.errorln("ERROR: uploading artifacts failed");
                    self.record_upload_failure();
                }
            }
        }

        self.trace.section_end(&stage.name());
    }

    /// An upload failure fails a healthy build, but never reclassifies one
    /// that already failed: the original reason is what the user needs.
    fn record_upload_failure(&mut self) {
        if self.status.is_success() {
            self.upgrade(BuildStatus::SystemFailure);
        }
    }

    /// Bounded retries with a fixed spacing; aborts on non-retryable results.
    async fn with_upload_retry<F, Fut>(&self, what: &str, op: F) -> UploadResult
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = UploadResult>,
    {
        let attempts = self.runner.upload_retries;
        let mut attempt = 0;
        loop {
            let result = op().await;
            if !result.is_retryable() || attempt >= attempts {
                return result;
            }
            attempt += 1;
            self.trace.warningln(&format!(
                "WARNING: uploading {} failed, retrying ({}/{})",
                what, attempt, attempts
            ));
            tokio::time::sleep(UPLOAD_RETRY_DELAY).await;
        }
    }

    async fn with_stage_control<T>(
        &self,
        timeout: Duration,
        timeout_token: &CancellationToken,
        fut: impl std::future::Future<Output = Result<T, BuildStatus>>,
    ) -> Result<T, BuildStatus> {
        tokio::select! {
            res = fut => res,
            _ = self.cancel.cancelled() => Err(BuildStatus::Canceled),
            _ = timeout_token.cancelled() => Err(BuildStatus::TimedOut),
            _ = tokio::time::sleep(timeout) => Err(BuildStatus::TimedOut),
        }
    }
}

/// File-system-safe name for a cache key.
fn cache_file_name(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
