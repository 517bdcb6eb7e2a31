//! Artifact transfer endpoints

use std::path::Path;

use tokio_util::io::ReaderStream;
use tracing::warn;

use gantry_core::domain::artifact::ArtifactOptions;
use gantry_core::domain::job::JobCredentials;
use gantry_core::domain::runner::RunnerConfig;

use crate::{DownloadResult, HttpCoordinator, UploadResult};

impl HttpCoordinator {
    pub(crate) async fn upload_artifacts_impl(
        &self,
        runner: &RunnerConfig,
        job: &JobCredentials,
        archive: &Path,
        options: &ArtifactOptions,
    ) -> UploadResult {
        let file = match tokio::fs::File::open(archive).await {
            Ok(f) => f,
            Err(e) => {
                warn!(job_id = job.id, "cannot open artifact archive: {}", e);
                return UploadResult::Failed;
            }
        };

        let url = Self::api_url(&runner.url, &format!("jobs/{}/artifacts", job.id));
        let mut request = self
            .http()
            .post(&url)
            .header("JOB-TOKEN", &job.token)
            .query(&[
                ("base_name", options.base_name.as_str()),
                ("format", options.format.file_extension()),
                ("type", options.artifact_type.as_str()),
            ])
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)));

        if let Some(expire_in) = &options.expire_in {
            request = request.query(&[("expire_in", expire_in.as_str())]);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(job_id = job.id, "artifact upload failed: {}", e);
                return UploadResult::Failed;
            }
        };

        match response.status().as_u16() {
            200 | 201 => UploadResult::Ok,
            401 | 403 => UploadResult::Forbidden,
            413 => UploadResult::TooLarge,
            _ => UploadResult::Failed,
        }
    }

    pub(crate) async fn download_artifacts_impl(
        &self,
        runner: &RunnerConfig,
        job: &JobCredentials,
        dest: &Path,
        direct_download: bool,
    ) -> DownloadResult {
        let url = Self::api_url(&runner.url, &format!("jobs/{}/artifacts", job.id));
        let response = self
            .http()
            .get(&url)
            .header("JOB-TOKEN", &job.token)
            .query(&[("direct_download", direct_download)])
            .send()
            .await;

        let mut response = match response {
            Ok(r) => r,
            Err(e) => {
                warn!(job_id = job.id, "artifact download failed: {}", e);
                return DownloadResult::Failed;
            }
        };

        match response.status().as_u16() {
            200 => {}
            401 | 403 => return DownloadResult::Forbidden,
            404 => return DownloadResult::NotFound,
            _ => return DownloadResult::Failed,
        }

        let mut file = match tokio::fs::File::create(dest).await {
            Ok(f) => f,
            Err(e) => {
                warn!(job_id = job.id, "cannot create artifact file: {}", e);
                return DownloadResult::Failed;
            }
        };

        use tokio::io::AsyncWriteExt;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    if let Err(e) = file.write_all(&chunk).await {
                        warn!(job_id = job.id, "artifact write failed: {}", e);
                        return DownloadResult::Failed;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(job_id = job.id, "artifact stream failed: {}", e);
                    return DownloadResult::Failed;
                }
            }
        }

        if let Err(e) = file.flush().await {
            warn!(job_id = job.id, "artifact flush failed: {}", e);
            return DownloadResult::Failed;
        }

        DownloadResult::Ok
    }
}
