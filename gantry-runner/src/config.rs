//! Runner configuration
//!
//! Loaded from a TOML file (`CONFIG_FILE` or `--config` selects the path),
//! with same-named environment variables overriding the global fields.
//! Configuration is an immutable value: reload parses a whole new snapshot
//! and replaces the old one atomically; a snapshot that fails to parse or
//! validate leaves the previous one in place.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use gantry_core::domain::runner::RunnerConfig;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Global concurrent job limit across all runners.
    #[serde(default = "default_concurrent")]
    pub concurrent: usize,
    /// Default job poll interval in seconds.
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
    /// Grace period for running jobs on the first termination signal.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
    /// Metrics / debug server address. Parsed and validated; serving is
    /// left to the deployment.
    #[serde(default)]
    pub listen_address: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `text` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default)]
    pub session_server: Option<SessionServerConfig>,
    #[serde(default)]
    pub runners: Vec<RunnerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionServerConfig {
    #[serde(default)]
    pub listen_address: Option<String>,
    #[serde(default)]
    pub advertise_address: Option<String>,
    #[serde(default = "default_session_timeout")]
    pub session_timeout: u64,
}

fn default_concurrent() -> usize {
    1
}

fn default_check_interval() -> u64 {
    3
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_session_timeout() -> u64 {
    1800
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrent: default_concurrent(),
            check_interval: default_check_interval(),
            shutdown_timeout: default_shutdown_timeout(),
            listen_address: None,
            log_level: default_log_level(),
            log_format: default_log_format(),
            session_server: None,
            runners: Vec::new(),
        }
    }
}

impl Config {
    /// Load, apply environment overrides, and validate.
    pub fn load(path: &Path, known_executors: &[&str]) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let mut config: Config = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        config.apply_env_overrides();
        config.validate(known_executors)?;
        Ok(config)
    }

    /// A variable overrides its same-named config field when set.
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse::<usize>("CONCURRENT") {
            self.concurrent = v;
        }
        if let Some(v) = env_parse::<u64>("CHECK_INTERVAL") {
            self.check_interval = v;
        }
        if let Some(v) = env_parse::<u64>("SHUTDOWN_TIMEOUT") {
            self.shutdown_timeout = v;
        }
        if let Ok(v) = std::env::var("LISTEN_ADDRESS") {
            if !v.is_empty() {
                self.listen_address = Some(v);
            }
        }
        if let Ok(v) = std::env::var("LOG_LEVEL") {
            if !v.is_empty() {
                self.log_level = v;
            }
        }
        if let Ok(v) = std::env::var("LOG_FORMAT") {
            if !v.is_empty() {
                self.log_format = v;
            }
        }
    }

    pub fn validate(&self, known_executors: &[&str]) -> anyhow::Result<()> {
        if self.concurrent == 0 {
            bail!("concurrent must be greater than 0");
        }
        if self.check_interval == 0 {
            bail!("check_interval must be greater than 0");
        }
        if !matches!(self.log_format.as_str(), "text" | "json") {
            bail!("log_format must be \"text\" or \"json\"");
        }
        if let Some(addr) = &self.listen_address {
            if !addr.contains(':') {
                bail!("listen_address must be host:port, got {:?}", addr);
            }
        }

        for runner in &self.runners {
            if runner.url.is_empty() {
                bail!("runner {:?} has no url", runner.name);
            }
            if !runner.url.starts_with("http://") && !runner.url.starts_with("https://") {
                bail!(
                    "runner {:?} url must start with http:// or https://",
                    runner.name
                );
            }
            if runner.token.is_empty() {
                bail!("runner {:?} has no token", runner.name);
            }
            if !known_executors.contains(&runner.executor.as_str()) {
                bail!(
                    "runner {:?} uses unknown executor {:?} (known: {})",
                    runner.name,
                    runner.executor,
                    known_executors.join(", ")
                );
            }
            if runner.request_concurrency == 0 {
                bail!("runner {:?} request_concurrency must be at least 1", runner.name);
            }
        }

        Ok(())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }

    pub fn runner_by_identity(&self, identity: (&str, &str)) -> Option<&RunnerConfig> {
        self.runners.iter().find(|r| r.identity() == identity)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.parse().ok()
}

/// Config path resolution: CLI flag, then `CONFIG_FILE`, then the default.
pub fn config_path(cli: Option<PathBuf>) -> PathBuf {
    if let Some(path) = cli {
        return path;
    }
    if let Ok(path) = std::env::var("CONFIG_FILE") {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    PathBuf::from(DEFAULT_CONFIG_PATH)
}
