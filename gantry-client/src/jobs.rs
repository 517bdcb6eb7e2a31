//! Job lifecycle endpoints: request, trace patch, state update

use std::time::Duration;

use tracing::{debug, warn};

use gantry_core::domain::job::{JobCredentials, JobResponse, SessionInfo};
use gantry_core::domain::runner::RunnerConfig;
use gantry_core::dto::job::{RequestJobRequest, UpdateJobRequest};
use gantry_core::dto::runner::RunnerInfo;

use crate::error::Result;
use crate::{
    HttpCoordinator, PatchResult, UpdateJobInfo, UpdateResult, JOB_STATUS_HEADER,
    TRACE_INTERVAL_HEADER, TRACE_RANGE_HEADER,
};

impl HttpCoordinator {
    pub(crate) async fn request_job_impl(
        &self,
        runner: &RunnerConfig,
        session: Option<SessionInfo>,
    ) -> Result<Option<JobResponse>> {
        let url = Self::api_url(&runner.url, "jobs/request");
        let body = RequestJobRequest {
            token: runner.token.clone(),
            info: RunnerInfo {
                name: runner.display_name().to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                executor: runner.executor.clone(),
                shell: runner.shell.clone(),
            },
            session,
        };

        let response = self.http().post(&url).json(&body).send().await?;

        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }

        Ok(Some(Self::handle_response(response).await?))
    }

    pub(crate) async fn patch_trace_impl(
        &self,
        runner: &RunnerConfig,
        job: &JobCredentials,
        patch: &[u8],
        offset: usize,
        checksum: &str,
    ) -> PatchResult {
        let url = Self::api_url(&runner.url, &format!("jobs/{}/trace", job.id));
        let end = offset + patch.len();

        let response = self
            .http()
            .patch(&url)
            .header("JOB-TOKEN", &job.token)
            .header("Content-Type", "text/plain")
            .header("Content-Range", format!("{}-{}", offset, end))
            .header("X-Trace-Checksum", checksum)
            .body(patch.to_vec())
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                warn!(job_id = job.id, "trace patch request failed: {}", e);
                return PatchResult::Failed;
            }
        };

        let status = response.status();

        if job_status(&response) == Some("canceled") {
            return PatchResult::Canceled;
        }

        match status.as_u16() {
            200 | 202 => PatchResult::Accepted {
                update_interval: header_secs(&response, TRACE_INTERVAL_HEADER),
            },
            416 => {
                let offset = response
                    .headers()
                    .get(TRACE_RANGE_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                debug!(job_id = job.id, offset, "trace range mismatch, resyncing");
                PatchResult::RangeMismatch { offset }
            }
            403 | 404 => PatchResult::Aborted,
            _ => PatchResult::Failed,
        }
    }

    pub(crate) async fn update_job_impl(
        &self,
        runner: &RunnerConfig,
        job: &JobCredentials,
        update: UpdateJobInfo,
    ) -> UpdateResult {
        let url = Self::api_url(&runner.url, &format!("jobs/{}", job.id));
        let body = UpdateJobRequest {
            token: job.token.clone(),
            state: update.state,
            failure_reason: update.failure_reason,
            checksum: update.checksum,
        };

        let response = match self.http().put(&url).json(&body).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(job_id = job.id, "job update request failed: {}", e);
                return UpdateResult::Failed;
            }
        };

        if job_status(&response) == Some("canceled") {
            return UpdateResult::Canceled;
        }

        match response.status().as_u16() {
            200 | 202 => UpdateResult::Accepted,
            403 | 404 => UpdateResult::Aborted,
            _ => UpdateResult::Failed,
        }
    }
}

fn job_status(response: &reqwest::Response) -> Option<&str> {
    response
        .headers()
        .get(JOB_STATUS_HEADER)
        .and_then(|v| v.to_str().ok())
}

fn header_secs(response: &reqwest::Response, name: &str) -> Option<Duration> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
}
