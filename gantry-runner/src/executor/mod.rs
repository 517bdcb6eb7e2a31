//! Executor capability
//!
//! An executor prepares an environment, runs stage scripts in it, and tears
//! it down. The build drives the lifecycle: exactly one `prepare`,
//! zero-or-more `run`, exactly one `finish` and exactly one `cleanup` on
//! every path, including prepare failure. `cleanup` must be idempotent and
//! tolerate an un-prepared state.
//!
//! Providers are registered by name at process start; the registry is
//! read-only afterwards.

pub mod shell;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use gantry_core::domain::job::JobVariables;
use gantry_core::domain::runner::RunnerConfig;
use gantry_core::domain::stage::BuildStage;

use crate::trace::JobTrace;

#[derive(Debug, Error)]
pub enum ExecutorError {
    /// User code exited non-zero.
    #[error("script failure: exit code {exit_code}")]
    Script { exit_code: i32 },

    /// The environment itself failed.
    #[error(transparent)]
    System(#[from] anyhow::Error),
}

impl ExecutorError {
    pub fn system(msg: impl Into<String>) -> Self {
        ExecutorError::System(anyhow::anyhow!(msg.into()))
    }

    pub fn is_script_failure(&self) -> bool {
        matches!(self, ExecutorError::Script { .. })
    }
}

/// Everything an executor needs to set up one job's environment
pub struct PrepareOptions {
    pub runner: Arc<RunnerConfig>,
    pub trace: Arc<JobTrace>,
    /// Workspace directory for the job; owned by the build.
    pub build_dir: PathBuf,
    /// Container image requested by the job, if any.
    pub image: Option<String>,
    pub cancel: CancellationToken,
}

/// One stage execution request
pub struct ExecutorCommand {
    pub stage: BuildStage,
    /// Generated script text for this stage.
    pub script: String,
    /// Environment exported into the stage.
    pub variables: Vec<(String, String)>,
    /// Canceling this token must make `run` return promptly.
    pub cancel: CancellationToken,
}

/// A prepared execution environment for one job
#[async_trait]
pub trait Executor: Send {
    async fn prepare(&mut self, options: PrepareOptions) -> Result<(), ExecutorError>;

    async fn run(&mut self, cmd: ExecutorCommand) -> Result<(), ExecutorError>;

    /// Observes the overall result before teardown.
    async fn finish(&mut self, success: bool);

    /// Releases everything `prepare` acquired. Idempotent; must tolerate
    /// never having been prepared.
    async fn cleanup(&mut self);

    /// Variables the environment contributes (container ids, host names...).
    /// Available after `prepare`.
    fn runtime_variables(&self) -> JobVariables {
        JobVariables::new()
    }
}

/// Creates one executor per job
pub trait ExecutorProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn create(&self) -> Box<dyn Executor>;
}

/// Name → provider map, write-once at startup
pub struct ExecutorRegistry {
    providers: HashMap<&'static str, Box<dyn ExecutorProvider>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Registry with all built-in executors.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(shell::ShellExecutorProvider));
        registry
    }

    pub fn register(&mut self, provider: Box<dyn ExecutorProvider>) {
        self.providers.insert(provider.name(), provider);
    }

    pub fn get(&self, name: &str) -> Option<&dyn ExecutorProvider> {
        self.providers.get(name).map(|p| p.as_ref())
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.providers.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
