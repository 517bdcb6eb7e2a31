//! Artifact and cache directives
//!
//! Directives arrive on the job; options describe one concrete upload.

use serde::{Deserialize, Serialize};

/// Archive format for artifact/cache packaging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFormat {
    Zip,
    Gzip,
    Raw,
    Zstd,
}

impl Default for ArchiveFormat {
    fn default() -> Self {
        ArchiveFormat::Zip
    }
}

impl ArchiveFormat {
    /// Gzip and raw streams carry exactly one file.
    pub fn single_file_only(self) -> bool {
        matches!(self, ArchiveFormat::Gzip | ArchiveFormat::Raw)
    }

    pub fn file_extension(self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::Gzip => "gz",
            ArchiveFormat::Raw => "raw",
            ArchiveFormat::Zstd => "zst",
        }
    }
}

/// When an artifact directive applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactWhen {
    OnSuccess,
    OnFailure,
    Always,
}

impl Default for ArtifactWhen {
    fn default() -> Self {
        ArtifactWhen::OnSuccess
    }
}

impl ArtifactWhen {
    pub fn applies(self, success: bool) -> bool {
        match self {
            ArtifactWhen::OnSuccess => success,
            ArtifactWhen::OnFailure => !success,
            ArtifactWhen::Always => true,
        }
    }
}

/// Artifact upload directive from the job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactDirective {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub when: ArtifactWhen,
    #[serde(default)]
    pub expire_in: Option<String>,
    #[serde(default)]
    pub format: ArchiveFormat,
    #[serde(default = "default_artifact_type")]
    pub artifact_type: String,
}

fn default_artifact_type() -> String {
    "archive".to_string()
}

/// Cache restore/archive directive from the job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheDirective {
    pub key: String,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub policy: CachePolicy,
    /// Whether the archive half runs on the success or the failure path.
    #[serde(default)]
    pub when: ArtifactWhen,
}

/// Whether a cache entry is restored, archived, or both
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CachePolicy {
    Pull,
    Push,
    PullPush,
}

impl Default for CachePolicy {
    fn default() -> Self {
        CachePolicy::PullPush
    }
}

impl CachePolicy {
    pub fn restores(self) -> bool {
        matches!(self, CachePolicy::Pull | CachePolicy::PullPush)
    }

    pub fn archives(self) -> bool {
        matches!(self, CachePolicy::Push | CachePolicy::PullPush)
    }
}

/// Options for one artifact upload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactOptions {
    pub base_name: String,
    #[serde(default)]
    pub expire_in: Option<String>,
    #[serde(default)]
    pub format: ArchiveFormat,
    #[serde(default = "default_artifact_type")]
    pub artifact_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_when_applies() {
        assert!(ArtifactWhen::OnSuccess.applies(true));
        assert!(!ArtifactWhen::OnSuccess.applies(false));
        assert!(ArtifactWhen::OnFailure.applies(false));
        assert!(ArtifactWhen::Always.applies(true));
        assert!(ArtifactWhen::Always.applies(false));
    }

    #[test]
    fn test_single_file_formats() {
        assert!(ArchiveFormat::Gzip.single_file_only());
        assert!(ArchiveFormat::Raw.single_file_only());
        assert!(!ArchiveFormat::Zip.single_file_only());
        assert!(!ArchiveFormat::Zstd.single_file_only());
    }

    #[test]
    fn test_cache_policy() {
        assert!(CachePolicy::PullPush.restores());
        assert!(CachePolicy::PullPush.archives());
        assert!(!CachePolicy::Pull.archives());
        assert!(!CachePolicy::Push.restores());
    }

    #[test]
    fn test_cache_directive_defaults() {
        let d: CacheDirective = serde_json::from_str(r#"{"key": "build-deps"}"#).unwrap();
        assert_eq!(d.policy, CachePolicy::PullPush);
        assert_eq!(d.when, ArtifactWhen::OnSuccess);
        assert!(d.paths.is_empty());
    }

    #[test]
    fn test_directive_deserialize_defaults() {
        let d: ArtifactDirective =
            serde_json::from_str(r#"{"paths": ["target/release/app"]}"#).unwrap();
        assert_eq!(d.when, ArtifactWhen::OnSuccess);
        assert_eq!(d.format, ArchiveFormat::Zip);
        assert_eq!(d.artifact_type, "archive");
    }
}
