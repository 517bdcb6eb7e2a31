//! Build stages
//!
//! The ordered pipeline every build moves through. User steps are named by
//! the job; the surrounding stages are fixed.

/// A named step in a build's pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStage {
    Prepare,
    GetSources,
    RestoreCache,
    DownloadArtifacts,
    /// A user-defined step from the job's step list.
    Step(String),
    ArchiveCache,
    ArchiveCacheOnFailure,
    UploadArtifactsOnSuccess,
    UploadArtifactsOnFailure,
    Cleanup,
}

impl BuildStage {
    /// Stable name used in section markers and logs.
    pub fn name(&self) -> String {
        match self {
            BuildStage::Prepare => "prepare_executor".to_string(),
            BuildStage::GetSources => "get_sources".to_string(),
            BuildStage::RestoreCache => "restore_cache".to_string(),
            BuildStage::DownloadArtifacts => "download_artifacts".to_string(),
            BuildStage::Step(name) => format!("step_{}", name),
            BuildStage::ArchiveCache => "archive_cache".to_string(),
            BuildStage::ArchiveCacheOnFailure => "archive_cache_on_failure".to_string(),
            BuildStage::UploadArtifactsOnSuccess => {
                "upload_artifacts_on_success".to_string()
            }
            BuildStage::UploadArtifactsOnFailure => {
                "upload_artifacts_on_failure".to_string()
            }
            BuildStage::Cleanup => "cleanup".to_string(),
        }
    }

    pub fn is_user_step(&self) -> bool {
        matches!(self, BuildStage::Step(_))
    }
}

impl std::fmt::Display for BuildStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}
