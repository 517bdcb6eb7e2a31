//! Runner registration endpoints

use async_trait::async_trait;

use gantry_core::domain::runner::RunnerConfig;
use gantry_core::dto::runner::{
    RegisterRunnerRequest, RegisterRunnerResponse, RunnerCredentials,
};

use crate::error::Result;
use crate::HttpCoordinator;

impl HttpCoordinator {
    pub(crate) async fn register_runner_impl(
        &self,
        url: &str,
        request: RegisterRunnerRequest,
    ) -> Result<Option<RegisterRunnerResponse>> {
        let url = Self::api_url(url, "runners");
        let response = self.http().post(&url).json(&request).send().await?;

        if response.status() == reqwest::StatusCode::FORBIDDEN {
            return Ok(None);
        }

        Ok(Some(Self::handle_response(response).await?))
    }

    pub(crate) async fn verify_runner_impl(&self, runner: &RunnerConfig) -> Result<bool> {
        let url = Self::api_url(&runner.url, "runners/verify");
        let body = RunnerCredentials {
            token: runner.token.clone(),
        };
        let response = self.http().post(&url).json(&body).send().await?;

        Ok(response.status().is_success())
    }

    pub(crate) async fn unregister_runner_impl(&self, runner: &RunnerConfig) -> Result<bool> {
        let url = Self::api_url(&runner.url, "runners");
        let body = RunnerCredentials {
            token: runner.token.clone(),
        };
        let response = self.http().delete(&url).json(&body).send().await?;

        Ok(response.status().is_success())
    }
}

#[async_trait]
impl crate::Coordinator for HttpCoordinator {
    async fn register_runner(
        &self,
        url: &str,
        request: RegisterRunnerRequest,
    ) -> Result<Option<RegisterRunnerResponse>> {
        self.register_runner_impl(url, request).await
    }

    async fn verify_runner(&self, runner: &RunnerConfig) -> Result<bool> {
        self.verify_runner_impl(runner).await
    }

    async fn unregister_runner(&self, runner: &RunnerConfig) -> Result<bool> {
        self.unregister_runner_impl(runner).await
    }

    async fn request_job(
        &self,
        runner: &RunnerConfig,
        session: Option<gantry_core::domain::job::SessionInfo>,
    ) -> Result<Option<gantry_core::domain::job::JobResponse>> {
        self.request_job_impl(runner, session).await
    }

    async fn patch_trace(
        &self,
        runner: &RunnerConfig,
        job: &gantry_core::domain::job::JobCredentials,
        patch: &[u8],
        offset: usize,
        checksum: &str,
    ) -> crate::PatchResult {
        self.patch_trace_impl(runner, job, patch, offset, checksum)
            .await
    }

    async fn update_job(
        &self,
        runner: &RunnerConfig,
        job: &gantry_core::domain::job::JobCredentials,
        update: crate::UpdateJobInfo,
    ) -> crate::UpdateResult {
        self.update_job_impl(runner, job, update).await
    }

    async fn upload_artifacts(
        &self,
        runner: &RunnerConfig,
        job: &gantry_core::domain::job::JobCredentials,
        archive: &std::path::Path,
        options: &gantry_core::domain::artifact::ArtifactOptions,
    ) -> crate::UploadResult {
        self.upload_artifacts_impl(runner, job, archive, options).await
    }

    async fn download_artifacts(
        &self,
        runner: &RunnerConfig,
        job: &gantry_core::domain::job::JobCredentials,
        dest: &std::path::Path,
        direct_download: bool,
    ) -> crate::DownloadResult {
        self.download_artifacts_impl(runner, job, dest, direct_download)
            .await
    }
}
