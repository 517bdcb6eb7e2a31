//! Runner configuration
//!
//! One configured runner identity. A `RunnerConfig` is an immutable snapshot:
//! configuration reload replaces whole snapshots, it never mutates one in
//! place.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::features;

/// Configuration of a single runner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default)]
    pub name: String,
    pub url: String,
    pub token: String,
    /// Numeric id assigned by the coordinator at registration.
    #[serde(default)]
    pub id: u64,
    pub executor: String,
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Maximum concurrent jobs for this runner. 0 means unlimited (still
    /// gated by the global limit).
    #[serde(default)]
    pub limit: usize,
    /// Concurrent job requests towards the coordinator.
    #[serde(default = "default_request_concurrency")]
    pub request_concurrency: usize,
    /// Per-job log limit in kilobytes.
    #[serde(default = "default_output_limit")]
    pub output_limit: usize,
    /// Per-runner poll interval override in seconds.
    #[serde(default)]
    pub check_interval: Option<u64>,
    /// Retries for artifact/cache upload stages.
    #[serde(default = "default_upload_retries")]
    pub upload_retries: u32,
    /// Executor prepare timeout override in seconds.
    #[serde(default)]
    pub prepare_timeout: Option<u64>,
    /// Default per-stage timeout override in seconds.
    #[serde(default)]
    pub stage_timeout: Option<u64>,
    /// Cleanup timeout override in seconds.
    #[serde(default)]
    pub cleanup_timeout: Option<u64>,
    /// Runner-declared variables as `KEY=value` entries.
    #[serde(default)]
    pub environment: Vec<String>,
    #[serde(default)]
    pub feature_flags: HashMap<String, bool>,
    /// Base directory for build workspaces.
    #[serde(default)]
    pub builds_dir: Option<PathBuf>,
    /// Local cache directory; cache stages are skipped when unset.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Executor-specific settings, passed through to the provider.
    #[serde(default)]
    pub executor_settings: BTreeMap<String, serde_json::Value>,
}

fn default_shell() -> String {
    "bash".to_string()
}

fn default_request_concurrency() -> usize {
    1
}

fn default_output_limit() -> usize {
    4096
}

fn default_upload_retries() -> u32 {
    2
}

impl RunnerConfig {
    /// Identity of this runner; reload restarts a worker only when this
    /// changes.
    pub fn identity(&self) -> (&str, &str) {
        (self.url.as_str(), self.token.as_str())
    }

    /// Short token fingerprint for logs. Never log the full token.
    pub fn short_token(&self) -> &str {
        let end = self
            .token
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.token.len());
        &self.token[..end]
    }

    /// Display name: configured name, or the short token.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            self.short_token()
        } else {
            &self.name
        }
    }

    /// Log limit in bytes.
    pub fn output_limit_bytes(&self) -> usize {
        self.output_limit * 1024
    }

    /// Effective poll interval, falling back to the global default.
    pub fn effective_check_interval(&self, global: Duration) -> Duration {
        self.check_interval
            .map(Duration::from_secs)
            .unwrap_or(global)
    }

    /// Resolve a feature flag against per-runner overrides and defaults.
    pub fn feature_flag_on(&self, name: &str) -> bool {
        features::is_on(&self.feature_flags, name)
    }

    /// Runner-declared variables parsed from the `environment` list.
    pub fn declared_variables(&self) -> Vec<(String, String)> {
        self.environment
            .iter()
            .map(|entry| match entry.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (entry.clone(), String::new()),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> RunnerConfig {
        serde_json::from_str(
            r#"{"url": "https://ci.example.com", "token": "tok_0123456789", "executor": "shell"}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_defaults() {
        let r = runner();
        assert_eq!(r.shell, "bash");
        assert_eq!(r.request_concurrency, 1);
        assert_eq!(r.output_limit, 4096);
        assert_eq!(r.output_limit_bytes(), 4096 * 1024);
        assert_eq!(r.upload_retries, 2);
    }

    #[test]
    fn test_short_token() {
        let r = runner();
        assert_eq!(r.short_token(), "tok_0123");
        assert_eq!(r.display_name(), "tok_0123");
    }

    #[test]
    fn test_identity() {
        let mut a = runner();
        let b = runner();
        assert_eq!(a.identity(), b.identity());
        a.token = "other".to_string();
        assert_ne!(a.identity(), b.identity());
    }

    #[test]
    fn test_declared_variables() {
        let mut r = runner();
        r.environment = vec!["CI=true".to_string(), "FLAGONLY".to_string()];
        assert_eq!(
            r.declared_variables(),
            vec![
                ("CI".to_string(), "true".to_string()),
                ("FLAGONLY".to_string(), String::new())
            ]
        );
    }

    #[test]
    fn test_check_interval_fallback() {
        let mut r = runner();
        assert_eq!(
            r.effective_check_interval(Duration::from_secs(3)),
            Duration::from_secs(3)
        );
        r.check_interval = Some(10);
        assert_eq!(
            r.effective_check_interval(Duration::from_secs(3)),
            Duration::from_secs(10)
        );
    }
}
