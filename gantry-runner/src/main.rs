//! Gantry Runner
//!
//! A long-lived agent that registers with a coordinator, polls it for CI
//! jobs, and drives each job through its build stages on a configured
//! executor while streaming masked, length-capped logs back upstream.
//!
//! Architecture:
//! - Configuration: TOML snapshot with env overrides, hot-reloaded on SIGHUP
//! - Supervisor: one worker per configured runner, global concurrency limit,
//!   two-phase signal shutdown
//! - Worker: polls for jobs, spawns one build task per job
//! - Build: the per-job state machine driving executor stages
//! - Trace: per-job log buffer with secret masking, patched upstream

mod artifacts;
mod build;
mod config;
mod executor;
mod secrets;
mod shells;
mod supervisor;
#[cfg(test)]
mod test_support;
mod trace;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gantry_client::{Coordinator, HttpCoordinator};

use crate::config::Config;
use crate::executor::ExecutorRegistry;
use crate::secrets::SecretResolverRegistry;
use crate::supervisor::Supervisor;

#[derive(Debug, Parser)]
#[command(name = "gantry-runner", version, about = "Gantry CI runner agent")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "CONFIG_FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let executors = Arc::new(ExecutorRegistry::builtin());
    let secrets = Arc::new(SecretResolverRegistry::builtin());

    let config_path = config::config_path(cli.config);
    let config = Config::load(&config_path, &executors.names())
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;

    init_logging(&config)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        runners = config.runners.len(),
        "starting gantry-runner"
    );
    if let Some(addr) = &config.listen_address {
        info!(listen_address = %addr, "metrics serving is handled by the deployment");
    }
    if let Some(session) = &config.session_server {
        info!(
            timeout = session.session_timeout,
            "session server configured"
        );
    }

    let coordinator: Arc<dyn Coordinator> = Arc::new(HttpCoordinator::new());

    verify_runners(&config, coordinator.as_ref()).await;

    let supervisor = Supervisor::new(config, config_path, coordinator, executors, secrets);
    let hard_stop = supervisor.run().await?;

    if hard_stop {
        // jobs were killed rather than drained
        std::process::exit(2);
    }
    Ok(())
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));

    let registry = tracing_subscriber::registry().with(filter);
    if config.log_format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    }
    .map_err(|e| anyhow::anyhow!("initializing logging: {}", e))
}

/// Best-effort startup check that each configured runner is still known
/// upstream. A failure is a warning, not a fatal error: the coordinator may
/// simply be temporarily unreachable.
async fn verify_runners(config: &Config, coordinator: &dyn Coordinator) {
    for runner in &config.runners {
        match coordinator.verify_runner(runner).await {
            Ok(true) => {
                info!(runner = %runner.display_name(), "runner verified")
            }
            Ok(false) => warn!(
                runner = %runner.display_name(),
                "runner token was rejected by the coordinator"
            ),
            Err(e) => warn!(
                runner = %runner.display_name(),
                "could not verify runner: {}", e
            ),
        }
    }
}
