//! Gantry Coordinator Client
//!
//! The coordinator capability consumed by the runner core, plus its HTTP
//! implementation. The runner never sees transport details: it talks to the
//! [`Coordinator`] trait, and trace/update outcomes come back as enums the
//! scheduling and trace code can branch on directly.

pub mod error;
mod artifacts;
mod jobs;
mod runners;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;

use gantry_core::domain::artifact::ArtifactOptions;
use gantry_core::domain::failure::{FailureReason, JobState};
use gantry_core::domain::job::{JobCredentials, JobResponse, SessionInfo};
use gantry_core::domain::runner::RunnerConfig;
use gantry_core::dto::runner::{RegisterRunnerRequest, RegisterRunnerResponse};

pub use error::{ClientError, Result};

/// Outcome of a trace patch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchResult {
    /// Patch accepted; the coordinator may suggest a new update interval.
    Accepted { update_interval: Option<Duration> },
    /// Our offset disagrees with the coordinator; resync to this offset.
    RangeMismatch { offset: usize },
    /// The job was canceled upstream.
    Canceled,
    /// The job is gone or access was revoked; stop tracing, fail the build.
    Aborted,
    /// Transient failure; retry with backoff.
    Failed,
}

/// Outcome of a job state update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResult {
    Accepted,
    Canceled,
    Aborted,
    Failed,
}

/// Outcome of an artifact upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadResult {
    Ok,
    Forbidden,
    TooLarge,
    Failed,
}

impl UploadResult {
    /// Forbidden and too-large uploads never succeed on retry.
    pub fn is_retryable(self) -> bool {
        self == UploadResult::Failed
    }
}

/// Outcome of an artifact download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadResult {
    Ok,
    Forbidden,
    NotFound,
    Failed,
}

/// Job state update sent upstream
#[derive(Debug, Clone)]
pub struct UpdateJobInfo {
    pub state: JobState,
    pub failure_reason: Option<FailureReason>,
    /// Final trace checksum, sent with terminal updates.
    pub checksum: Option<String>,
}

impl UpdateJobInfo {
    pub fn running() -> Self {
        Self {
            state: JobState::Running,
            failure_reason: None,
            checksum: None,
        }
    }
}

/// The coordinator capability
///
/// One implementation talks HTTP ([`HttpCoordinator`]); tests provide mocks.
/// `patch_trace`/`update_job`/`upload_artifacts`/`download_artifacts` return
/// outcome enums rather than errors: transport failures map to the `Failed`
/// variant and the caller owns the retry policy.
#[async_trait]
pub trait Coordinator: Send + Sync {
    async fn register_runner(
        &self,
        url: &str,
        request: RegisterRunnerRequest,
    ) -> Result<Option<RegisterRunnerResponse>>;

    async fn verify_runner(&self, runner: &RunnerConfig) -> Result<bool>;

    async fn unregister_runner(&self, runner: &RunnerConfig) -> Result<bool>;

    /// Ask for one job. `Ok(None)` means no job is available right now.
    async fn request_job(
        &self,
        runner: &RunnerConfig,
        session: Option<SessionInfo>,
    ) -> Result<Option<JobResponse>>;

    /// Send the trace bytes `[offset, offset + patch.len())`.
    async fn patch_trace(
        &self,
        runner: &RunnerConfig,
        job: &JobCredentials,
        patch: &[u8],
        offset: usize,
        checksum: &str,
    ) -> PatchResult;

    async fn update_job(
        &self,
        runner: &RunnerConfig,
        job: &JobCredentials,
        update: UpdateJobInfo,
    ) -> UpdateResult;

    /// Upload a packaged artifact archive.
    async fn upload_artifacts(
        &self,
        runner: &RunnerConfig,
        job: &JobCredentials,
        archive: &Path,
        options: &ArtifactOptions,
    ) -> UploadResult;

    /// Download a dependency artifact archive into `dest`.
    async fn download_artifacts(
        &self,
        runner: &RunnerConfig,
        job: &JobCredentials,
        dest: &Path,
        direct_download: bool,
    ) -> DownloadResult;
}

/// Job status reported by the coordinator in response headers
pub(crate) const JOB_STATUS_HEADER: &str = "X-Job-Status";
pub(crate) const TRACE_RANGE_HEADER: &str = "X-Trace-Range-Start";
pub(crate) const TRACE_INTERVAL_HEADER: &str = "X-Trace-Update-Interval";

/// HTTP client for the coordinator API
#[derive(Debug, Clone)]
pub struct HttpCoordinator {
    client: Client,
}

impl HttpCoordinator {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    /// Build with a configured reqwest client (timeouts, proxies, TLS).
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    pub(crate) fn http(&self) -> &Client {
        &self.client
    }

    pub(crate) fn api_url(base: &str, path: &str) -> String {
        format!("{}/api/v1/{}", base.trim_end_matches('/'), path)
    }

    /// Check the status code and deserialize the JSON body.
    pub(crate) async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("invalid JSON response: {}", e)))
    }
}

impl Default for HttpCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_url_trims_trailing_slash() {
        assert_eq!(
            HttpCoordinator::api_url("https://ci.example.com/", "jobs/request"),
            "https://ci.example.com/api/v1/jobs/request"
        );
        assert_eq!(
            HttpCoordinator::api_url("https://ci.example.com", "runners"),
            "https://ci.example.com/api/v1/runners"
        );
    }

    #[test]
    fn test_upload_retryability() {
        assert!(UploadResult::Failed.is_retryable());
        assert!(!UploadResult::Forbidden.is_retryable());
        assert!(!UploadResult::TooLarge.is_retryable());
        assert!(!UploadResult::Ok.is_retryable());
    }
}
