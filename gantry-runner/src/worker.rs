//! Per-runner worker loop
//!
//! One worker per configured runner. Each iteration snapshots the current
//! config, waits for a global and a per-runner concurrency slot, asks the
//! coordinator for a job, and spawns a build task per job. Empty responses
//! grow the poll interval up to a cap; request errors back off exponentially.
//! Both delays are jittered to avoid synchronized polling across runners.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use gantry_client::Coordinator;
use gantry_core::domain::job::{JobResponse, SessionInfo};
use gantry_core::domain::runner::RunnerConfig;

use crate::build::Build;
use crate::config::Config;
use crate::executor::ExecutorRegistry;
use crate::secrets::SecretResolverRegistry;
use crate::trace::JobTrace;

/// Cap on the empty-poll interval, as a multiple of the base interval.
const POLL_INTERVAL_CAP_FACTOR: u32 = 8;
/// Error backoff bounds.
const ERROR_BACKOFF_MIN: Duration = Duration::from_secs(1);
const ERROR_BACKOFF_MAX: Duration = Duration::from_secs(60);
/// Per-runner slot count when the runner sets no limit.
const UNLIMITED_SLOTS: usize = 1024;

/// The per-runner intake loop
#[derive(Clone)]
pub struct Worker {
    /// Identity this worker serves; settings are re-read from the config
    /// snapshot each iteration, but identity never changes.
    identity: (String, String),
    config: watch::Receiver<Arc<Config>>,
    coordinator: Arc<dyn Coordinator>,
    executors: Arc<ExecutorRegistry>,
    secrets: Arc<SecretResolverRegistry>,
    global_slots: Arc<Semaphore>,
    /// Stop accepting new jobs (graceful shutdown or runner removal).
    stop_intake: CancellationToken,
    /// Hard-cancel for all jobs this worker spawned.
    cancel_jobs: CancellationToken,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runner: &RunnerConfig,
        config: watch::Receiver<Arc<Config>>,
        coordinator: Arc<dyn Coordinator>,
        executors: Arc<ExecutorRegistry>,
        secrets: Arc<SecretResolverRegistry>,
        global_slots: Arc<Semaphore>,
        stop_intake: CancellationToken,
        cancel_jobs: CancellationToken,
    ) -> Self {
        Self {
            identity: (runner.url.clone(), runner.token.clone()),
            config,
            coordinator,
            executors,
            secrets,
            global_slots,
            stop_intake,
            cancel_jobs,
        }
    }

    fn snapshot(&self) -> Option<Arc<RunnerConfig>> {
        let config = self.config.borrow().clone();
        config
            .runner_by_identity((&self.identity.0, &self.identity.1))
            .cloned()
            .map(Arc::new)
    }

    /// Run until intake stops or the runner disappears from the config.
    /// In-flight jobs are drained before returning.
    pub async fn run(self) {
        let Some(initial) = self.snapshot() else {
            return;
        };
        info!(runner = %initial.display_name(), "worker started");

        let limit = if initial.limit == 0 {
            UNLIMITED_SLOTS
        } else {
            initial.limit
        };
        let runner_slots = Arc::new(Semaphore::new(limit));

        let base_interval = {
            let config = self.config.borrow().clone();
            initial.effective_check_interval(config.check_interval())
        };

        // `request_concurrency` parallel intake loops share the same slots
        let request_concurrency = initial.request_concurrency.max(1);
        let mut intake = JoinSet::new();
        for _ in 0..request_concurrency {
            intake.spawn(
                self.clone()
                    .intake_loop(Arc::clone(&runner_slots), base_interval),
            );
        }
        while intake.join_next().await.is_some() {}

        info!(runner = %initial.display_name(), "worker stopped");
    }

    async fn intake_loop(self, runner_slots: Arc<Semaphore>, base_interval: Duration) {
        let mut poll_interval = base_interval;
        let mut error_backoff = ERROR_BACKOFF_MIN;

        let mut jobs = JoinSet::new();

        loop {
            if self.stop_intake.is_cancelled() {
                break;
            }
            // settings may have been reloaded; identity-preserving changes
            // apply here, removal ends the worker
            let Some(runner) = self.snapshot() else {
                debug!(url = %self.identity.0, "runner removed from config");
                break;
            };

            let global = tokio::select! {
                permit = Arc::clone(&self.global_slots).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
                _ = self.stop_intake.cancelled() => break,
            };
            let local = tokio::select! {
                permit = Arc::clone(&runner_slots).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
                _ = self.stop_intake.cancelled() => break,
            };

            let session = session_info(&self.config.borrow());
            match self.coordinator.request_job(&runner, session).await {
                Ok(Some(job)) => {
                    poll_interval = base_interval;
                    error_backoff = ERROR_BACKOFF_MIN;

                    let coordinator = Arc::clone(&self.coordinator);
                    let executors = Arc::clone(&self.executors);
                    let secrets = Arc::clone(&self.secrets);
                    let cancel = self.cancel_jobs.child_token();
                    jobs.spawn(async move {
                        run_job(runner, job, coordinator, executors, secrets, cancel).await;
                        drop(global);
                        drop(local);
                    });
                }
                Ok(None) => {
                    drop(global);
                    drop(local);
                    debug!(runner = %runner.display_name(), "no jobs available");
                    if self.sleep_cancellable(jittered(poll_interval)).await {
                        break;
                    }
                    poll_interval = next_poll_interval(poll_interval, base_interval);
                }
                Err(e) => {
                    drop(global);
                    drop(local);
                    warn!(
                        runner = %runner.display_name(),
                        "requesting job failed: {}", e
                    );
                    if self.sleep_cancellable(jittered(error_backoff)).await {
                        break;
                    }
                    error_backoff = (error_backoff * 2).min(ERROR_BACKOFF_MAX);
                }
            }

            // reap finished jobs without blocking intake
            while jobs.try_join_next().is_some() {}
        }

        // drain in-flight jobs; the supervisor decides when to hard-cancel
        while jobs.join_next().await.is_some() {}
    }

    /// Returns true when intake stopped during the sleep.
    async fn sleep_cancellable(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.stop_intake.cancelled() => true,
        }
    }
}

/// One job, from trace creation to the terminal update.
async fn run_job(
    runner: Arc<RunnerConfig>,
    job: JobResponse,
    coordinator: Arc<dyn Coordinator>,
    executors: Arc<ExecutorRegistry>,
    secrets: Arc<SecretResolverRegistry>,
    cancel: CancellationToken,
) {
    let job_id = job.id;
    let trace = match JobTrace::new(
        Arc::clone(&runner),
        job.credentials(),
        Arc::clone(&coordinator),
        cancel,
    ) {
        Ok(t) => Arc::new(t),
        Err(e) => {
            error!(job_id, "creating job trace failed: {}", e);
            return;
        }
    };

    let updater = tokio::spawn(Arc::clone(&trace).run_updater());

    let Some(provider) = executors.get(&runner.executor) else {
        trace.errorln(&format!(
            "ERROR: unknown executor {:?}",
            runner.executor
        ));
        trace
            .finalize(gantry_core::domain::failure::BuildStatus::SystemFailure)
            .await;
        updater.abort();
        return;
    };

    let mut build = match Build::new(job, runner, Arc::clone(&trace), coordinator) {
        Ok(b) => b,
        Err(e) => {
            error!(job_id, "creating build failed: {:#}", e);
            trace.errorln(&format!("ERROR: {:#}", e));
            trace
                .finalize(gantry_core::domain::failure::BuildStatus::SystemFailure)
                .await;
            updater.abort();
            return;
        }
    };

    let status = build.run(provider.create(), &secrets).await;
    trace.finalize(status).await;
    updater.abort();
}

/// Session endpoint advertised with each job request, when configured.
fn session_info(config: &Config) -> Option<SessionInfo> {
    let session = config.session_server.as_ref()?;
    let addr = session
        .advertise_address
        .clone()
        .or_else(|| session.listen_address.clone())?;
    Some(SessionInfo {
        url: Some(format!("https://{}", addr)),
        certificate: None,
        authorization: None,
    })
}

/// Empty responses stretch the interval by half, up to the cap.
fn next_poll_interval(current: Duration, base: Duration) -> Duration {
    let cap = base * POLL_INTERVAL_CAP_FACTOR;
    (current + current / 2).min(cap)
}

/// +/- 10% so a fleet of runners does not poll in lockstep.
fn jittered(duration: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.9..=1.1);
    duration.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{job_response, runner_config, MockCoordinator};
    use gantry_core::domain::failure::JobState;

    fn harness(
        coordinator: Arc<MockCoordinator>,
        runner: RunnerConfig,
        concurrent: usize,
    ) -> (Worker, CancellationToken, CancellationToken) {
        let mut config = crate::config::Config::default();
        config.concurrent = concurrent;
        config.runners = vec![runner.clone()];

        let (_tx, rx) = watch::channel(Arc::new(config));
        let stop = CancellationToken::new();
        let cancel = CancellationToken::new();
        let worker = Worker::new(
            &runner,
            rx,
            coordinator as Arc<dyn Coordinator>,
            Arc::new(ExecutorRegistry::builtin()),
            Arc::new(SecretResolverRegistry::builtin()),
            Arc::new(Semaphore::new(concurrent)),
            stop.clone(),
            cancel.clone(),
        );
        (worker, stop, cancel)
    }

    #[tokio::test]
    async fn test_worker_runs_queued_job_to_success() {
        let coordinator = Arc::new(MockCoordinator::new());
        coordinator.enqueue_job(job_response(21));

        let (worker, stop, _cancel) = harness(coordinator.clone(), runner_config(), 2);

        let handle = tokio::spawn(worker.run());
        // wait for the terminal update to land
        for _ in 0..100 {
            if coordinator
                .updates()
                .iter()
                .any(|u| u.state == JobState::Success)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        stop.cancel();
        handle.await.unwrap();

        let updates = coordinator.updates();
        assert!(updates.iter().any(|u| u.state == JobState::Success));
        assert!(coordinator.request_count() >= 1);
    }

    #[tokio::test]
    async fn test_worker_stops_on_intake_cancel() {
        let coordinator = Arc::new(MockCoordinator::new());
        let (worker, stop, _cancel) = harness(coordinator, runner_config(), 1);

        stop.cancel();
        // returns promptly with nothing queued
        tokio::time::timeout(Duration::from_secs(5), worker.run())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_worker_exits_when_runner_removed() {
        let coordinator = Arc::new(MockCoordinator::new());
        let runner = runner_config();

        let mut config = crate::config::Config::default();
        config.runners = vec![runner.clone()];
        let (tx, rx) = watch::channel(Arc::new(config.clone()));

        let worker = Worker::new(
            &runner,
            rx,
            coordinator as Arc<dyn Coordinator>,
            Arc::new(ExecutorRegistry::builtin()),
            Arc::new(SecretResolverRegistry::builtin()),
            Arc::new(Semaphore::new(1)),
            CancellationToken::new(),
            CancellationToken::new(),
        );

        let handle = tokio::spawn(worker.run());
        tokio::time::sleep(Duration::from_millis(50)).await;

        config.runners.clear();
        tx.send_replace(Arc::new(config));

        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("worker should exit after removal")
            .unwrap();
    }

    #[tokio::test]
    async fn test_worker_recovers_from_request_errors() {
        let coordinator = Arc::new(MockCoordinator::new());
        coordinator.fail_requests(2);
        coordinator.enqueue_job(job_response(22));

        let (worker, stop, _cancel) = harness(coordinator.clone(), runner_config(), 2);
        let handle = tokio::spawn(worker.run());

        // two failed polls back off, the third one lands the job
        for _ in 0..400 {
            if coordinator
                .updates()
                .iter()
                .any(|u| u.state == JobState::Success)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        stop.cancel();
        handle.await.unwrap();

        assert!(coordinator.request_count() >= 3);
        assert!(coordinator
            .updates()
            .iter()
            .any(|u| u.state == JobState::Success));
    }

    #[test]
    fn test_poll_interval_growth_and_cap() {
        let base = Duration::from_secs(3);
        let mut interval = base;
        for _ in 0..20 {
            interval = next_poll_interval(interval, base);
        }
        assert_eq!(interval, base * POLL_INTERVAL_CAP_FACTOR);

        assert_eq!(
            next_poll_interval(base, base),
            base + base / 2,
            "first empty poll grows by half"
        );
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let j = jittered(base);
            assert!(j >= base.mul_f64(0.9));
            assert!(j <= base.mul_f64(1.1));
        }
    }
}
