//! Multi-runner supervisor
//!
//! Owns the config snapshot, one worker per configured runner, and the
//! global concurrency limit. Shutdown is two-phase: the first SIGINT/SIGTERM
//! stops job intake and gives running jobs `shutdown_timeout` to finish; the
//! second signal (or the timer) cancels their contexts. SIGHUP reloads the
//! config; a snapshot that fails to load leaves the previous one serving.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use gantry_client::Coordinator;

use crate::config::Config;
use crate::executor::ExecutorRegistry;
use crate::secrets::SecretResolverRegistry;
use crate::worker::Worker;

type RunnerIdentity = (String, String);

pub struct Supervisor {
    config_tx: watch::Sender<Arc<Config>>,
    config_path: PathBuf,
    coordinator: Arc<dyn Coordinator>,
    executors: Arc<ExecutorRegistry>,
    secrets: Arc<SecretResolverRegistry>,
    global_slots: Arc<Semaphore>,
    stop_intake: CancellationToken,
    cancel_jobs: CancellationToken,
    workers: HashMap<RunnerIdentity, JoinHandle<()>>,
}

impl Supervisor {
    pub fn new(
        config: Config,
        config_path: PathBuf,
        coordinator: Arc<dyn Coordinator>,
        executors: Arc<ExecutorRegistry>,
        secrets: Arc<SecretResolverRegistry>,
    ) -> Self {
        let global_slots = Arc::new(Semaphore::new(config.concurrent));
        let (config_tx, _) = watch::channel(Arc::new(config));

        Self {
            config_tx,
            config_path,
            coordinator,
            executors,
            secrets,
            global_slots,
            stop_intake: CancellationToken::new(),
            cancel_jobs: CancellationToken::new(),
            workers: HashMap::new(),
        }
    }

    /// Spawn workers for every configured runner.
    pub fn start(&mut self) {
        let config = self.config_tx.borrow().clone();
        info!(
            runners = config.runners.len(),
            concurrent = config.concurrent,
            "starting supervisor"
        );
        for runner in &config.runners {
            self.spawn_worker_for(runner.identity());
        }
    }

    fn spawn_worker_for(&mut self, identity: (&str, &str)) {
        let key = (identity.0.to_string(), identity.1.to_string());
        if self.workers.contains_key(&key) {
            return;
        }

        let config = self.config_tx.borrow().clone();
        let Some(runner) = config.runner_by_identity(identity) else {
            return;
        };

        let worker = Worker::new(
            runner,
            self.config_tx.subscribe(),
            Arc::clone(&self.coordinator),
            Arc::clone(&self.executors),
            Arc::clone(&self.secrets),
            Arc::clone(&self.global_slots),
            self.stop_intake.clone(),
            self.cancel_jobs.clone(),
        );
        self.workers.insert(key, tokio::spawn(worker.run()));
    }

    /// Replace the config snapshot and reconcile workers.
    ///
    /// Removed runners stop after their in-flight jobs terminate (their
    /// worker sees the removal on its next iteration). Added runners start
    /// immediately. A runner whose identity changed is both.
    pub fn apply_config(&mut self, new: Config) {
        let old = self.config_tx.borrow().clone();

        if new.concurrent > old.concurrent {
            self.global_slots.add_permits(new.concurrent - old.concurrent);
        } else if new.concurrent < old.concurrent {
            self.global_slots
                .forget_permits(old.concurrent - new.concurrent);
        }

        let new = Arc::new(new);
        self.config_tx.send_replace(Arc::clone(&new));

        // reap workers whose runner disappeared; they exit on their own
        let removed: Vec<RunnerIdentity> = self
            .workers
            .keys()
            .filter(|(url, token)| new.runner_by_identity((url, token)).is_none())
            .cloned()
            .collect();
        for key in removed {
            info!(url = %key.0, "runner removed, worker will stop after in-flight jobs");
            self.workers.remove(&key);
        }

        for runner in &new.runners {
            self.spawn_worker_for(runner.identity());
        }
    }

    /// Reload from disk; parse or validation errors keep the old snapshot.
    pub fn reload(&mut self) {
        info!(path = %self.config_path.display(), "reloading configuration");
        let names = self.executors.names();
        match Config::load(&self.config_path, &names) {
            Ok(config) => self.apply_config(config),
            Err(e) => {
                error!("config reload failed, keeping previous configuration: {:#}", e);
            }
        }
    }

    /// Phase one: no new jobs. Phase two after `shutdown_timeout` or the
    /// second signal: cancel running jobs. Returns true when jobs had to be
    /// canceled rather than drained.
    pub async fn graceful_shutdown(mut self, second_signal: CancellationToken) -> bool {
        let timeout = self.config_tx.borrow().shutdown_timeout();
        info!(?timeout, "shutting down, waiting for running jobs");
        self.stop_intake.cancel();

        let handles: Vec<JoinHandle<()>> = self.workers.drain().map(|(_, h)| h).collect();
        let drain = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!("worker task failed: {}", e);
                }
            }
        };
        tokio::pin!(drain);

        tokio::select! {
            _ = &mut drain => {
                info!("all jobs finished, shutdown complete");
                return false;
            }
            _ = tokio::time::sleep(timeout) => {
                warn!("shutdown timeout exceeded, canceling running jobs");
            }
            _ = second_signal.cancelled() => {
                warn!("second signal received, canceling running jobs");
            }
        }

        self.cancel_jobs.cancel();
        drain.await;
        info!("shutdown complete");
        true
    }

    /// Run until terminated. SIGHUP reloads; SIGINT/SIGTERM shut down.
    /// Returns true when shutdown had to cancel running jobs.
    pub async fn run(mut self) -> anyhow::Result<bool> {
        use tokio::signal::unix::{signal, SignalKind};

        self.start();

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = sigint.recv() => break,
                _ = sigterm.recv() => break,
                _ = sighup.recv() => self.reload(),
            }
        }

        let second_signal = CancellationToken::new();
        let trip = second_signal.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }
            trip.cancel();
        });

        let hard_stop = self.graceful_shutdown(second_signal).await;
        Ok(hard_stop)
    }
}
