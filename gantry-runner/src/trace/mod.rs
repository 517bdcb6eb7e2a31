//! Per-job trace pipeline
//!
//! A [`JobTrace`] owns the job's log buffer and ships it upstream: a
//! background task periodically sends the unsent suffix as a patch and keeps
//! the coordinator informed of the job state. Cancellation flows the other
//! way: a `canceled` response on either stream trips the job's cancellation
//! token, which the build observes.

pub mod buffer;
pub mod mask;
pub mod url;

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use gantry_client::{Coordinator, PatchResult, UpdateJobInfo, UpdateResult};
use gantry_core::domain::failure::BuildStatus;
use gantry_core::domain::job::JobCredentials;
use gantry_core::domain::runner::RunnerConfig;

use crate::trace::buffer::Buffer;

pub const ANSI_BOLD_GREEN: &str = "\x1b[32;1m";
pub const ANSI_BOLD_RED: &str = "\x1b[31;1m";
pub const ANSI_BOLD_CYAN: &str = "\x1b[36;1m";
pub const ANSI_YELLOW: &str = "\x1b[0;33m";
pub const ANSI_RESET: &str = "\x1b[0;m";
pub const ANSI_CLEAR_LINE: &str = "\x1b[0K";

/// Default patch interval; the coordinator may suggest another.
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(3);
/// Patch interval ceiling under failure backoff.
const MAX_UPDATE_INTERVAL: Duration = Duration::from_secs(60);
/// Cadence of keep-alive state updates between transitions.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
/// Attempts for the final patch / state update.
const FINAL_SEND_RETRIES: u32 = 3;
const FINAL_SEND_RETRY_DELAY: Duration = Duration::from_secs(1);

struct UploadState {
    sent_offset: usize,
    interval: Duration,
    base_interval: Duration,
    last_update: Instant,
    aborted: bool,
}

/// The per-job upstream log channel
pub struct JobTrace {
    buffer: Buffer,
    coordinator: Arc<dyn Coordinator>,
    runner: Arc<RunnerConfig>,
    job: JobCredentials,
    /// Tripped on coordinator-side cancellation or supervisor shutdown.
    cancel: CancellationToken,
    /// Stops the background updater.
    done: CancellationToken,
    state: Mutex<UploadState>,
}

impl JobTrace {
    pub fn new(
        runner: Arc<RunnerConfig>,
        job: JobCredentials,
        coordinator: Arc<dyn Coordinator>,
        cancel: CancellationToken,
    ) -> std::io::Result<Self> {
        let buffer = Buffer::new()?;
        buffer.set_limit(runner.output_limit_bytes());

        Ok(Self {
            buffer,
            coordinator,
            runner,
            job,
            cancel,
            done: CancellationToken::new(),
            state: Mutex::new(UploadState {
                sent_offset: 0,
                interval: DEFAULT_UPDATE_INTERVAL,
                base_interval: DEFAULT_UPDATE_INTERVAL,
                last_update: Instant::now(),
                aborted: false,
            }),
        })
    }

    /// The token a build watches for cancellation.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// True when the coordinator told us the job is gone.
    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    pub fn set_masked(&self, values: &[String]) {
        self.buffer.set_masked(values);
    }

    pub fn checksum(&self) -> String {
        self.buffer.checksum()
    }

    pub fn size(&self) -> usize {
        self.buffer.size()
    }

    /// Raw output from the executor. Buffer errors are logged, not fatal:
    /// losing trace bytes must not kill the job.
    pub fn write(&self, p: &[u8]) {
        if let Err(e) = self.buffer.write(p) {
            warn!(job_id = self.job.id, "trace write failed: {}", e);
        }
    }

    pub fn writeln(&self, line: &str) {
        self.write(line.as_bytes());
        self.write(b"\n");
    }

    pub fn infoln(&self, line: &str) {
        self.writeln(&format!("{}{}{}", ANSI_BOLD_GREEN, line, ANSI_RESET));
    }

    pub fn noticeln(&self, line: &str) {
        self.writeln(&format!("{}{}{}", ANSI_BOLD_CYAN, line, ANSI_RESET));
    }

    pub fn warningln(&self, line: &str) {
        self.writeln(&format!("{}{}{}", ANSI_YELLOW, line, ANSI_RESET));
    }

    pub fn errorln(&self, line: &str) {
        self.writeln(&format!("{}{}{}", ANSI_BOLD_RED, line, ANSI_RESET));
    }

    pub fn section_start(&self, name: &str) {
        let ts = chrono::Utc::now().timestamp();
        self.write(format!("section_start:{}:{}\r{}", ts, name, ANSI_CLEAR_LINE).as_bytes());
    }

    pub fn section_end(&self, name: &str) {
        let ts = chrono::Utc::now().timestamp();
        self.write(format!("section_end:{}:{}\r{}", ts, name, ANSI_CLEAR_LINE).as_bytes());
    }

    /// Background updater: incremental patches plus keep-alive updates.
    /// Runs until [`JobTrace::finalize`] stops it.
    pub async fn run_updater(self: Arc<Self>) {
        // announce the job as running first
        self.send_update(UpdateJobInfo::running()).await;

        loop {
            let interval = self.state.lock().interval;
            tokio::select! {
                _ = self.done.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }

            self.send_patch().await;

            let keepalive_due = self.state.lock().last_update.elapsed() >= KEEPALIVE_INTERVAL;
            if keepalive_due {
                self.send_update(UpdateJobInfo::running()).await;
            }
        }
    }

    async fn send_patch(&self) {
        let offset = self.state.lock().sent_offset;
        let size = self.buffer.size();
        if size <= offset {
            return;
        }

        let patch = match self.buffer.bytes(offset, size - offset) {
            Ok(p) => p,
            Err(e) => {
                warn!(job_id = self.job.id, "reading trace patch failed: {}", e);
                return;
            }
        };
        if patch.is_empty() {
            return;
        }

        let checksum = self.buffer.checksum();
        let result = self
            .coordinator
            .patch_trace(&self.runner, &self.job, &patch, offset, &checksum)
            .await;

        let mut state = self.state.lock();
        match result {
            PatchResult::Accepted { update_interval } => {
                state.sent_offset = offset + patch.len();
                state.interval = update_interval.unwrap_or(state.base_interval);
            }
            PatchResult::RangeMismatch { offset } => {
                debug!(job_id = self.job.id, offset, "resyncing trace offset");
                state.sent_offset = offset;
                state.interval = state.base_interval;
            }
            PatchResult::Canceled => {
                drop(state);
                self.cancel.cancel();
            }
            PatchResult::Aborted => {
                state.aborted = true;
                drop(state);
                self.cancel.cancel();
            }
            PatchResult::Failed => {
                state.interval = (state.interval * 2).min(MAX_UPDATE_INTERVAL);
            }
        }
    }

    async fn send_update(&self, update: UpdateJobInfo) {
        let result = self
            .coordinator
            .update_job(&self.runner, &self.job, update)
            .await;
        let mut state = self.state.lock();
        state.last_update = Instant::now();

        match result {
            UpdateResult::Accepted | UpdateResult::Failed => {}
            UpdateResult::Canceled => {
                drop(state);
                self.cancel.cancel();
            }
            UpdateResult::Aborted => {
                state.aborted = true;
                drop(state);
                self.cancel.cancel();
            }
        }
    }

    /// Flush the remaining trace and report the terminal state.
    pub async fn finalize(&self, status: BuildStatus) {
        self.done.cancel();
        self.buffer.finish();

        if self.is_aborted() {
            return;
        }

        for attempt in 0..FINAL_SEND_RETRIES {
            self.send_patch().await;
            let state = self.state.lock();
            if state.aborted || state.sent_offset >= self.buffer.size() {
                break;
            }
            drop(state);
            if attempt + 1 < FINAL_SEND_RETRIES {
                tokio::time::sleep(FINAL_SEND_RETRY_DELAY).await;
            }
        }

        let (state, failure_reason) = status.upstream();
        let update = UpdateJobInfo {
            state,
            failure_reason,
            checksum: Some(self.checksum()),
        };

        for attempt in 0..FINAL_SEND_RETRIES {
            let result = self
                .coordinator
                .update_job(&self.runner, &self.job, update.clone())
                .await;
            match result {
                UpdateResult::Failed if attempt + 1 < FINAL_SEND_RETRIES => {
                    tokio::time::sleep(FINAL_SEND_RETRY_DELAY).await;
                }
                _ => break,
            }
        }

        debug!(
            job_id = self.job.id,
            state = %state,
            trace_bytes = self.size(),
            "job finalized"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockCoordinator;
    use gantry_core::domain::failure::JobState;

    fn runner() -> Arc<RunnerConfig> {
        Arc::new(crate::test_support::runner_config())
    }

    fn creds() -> JobCredentials {
        JobCredentials {
            id: 1,
            token: "job-token".to_string(),
        }
    }

    #[tokio::test]
    async fn test_patch_advances_offset() {
        let coordinator = Arc::new(MockCoordinator::new());
        let trace = JobTrace::new(
            runner(),
            creds(),
            coordinator.clone(),
            CancellationToken::new(),
        )
        .unwrap();

        trace.write(b"hello world\n");
        trace.send_patch().await;

        assert_eq!(trace.state.lock().sent_offset, trace.size());
        assert_eq!(coordinator.patched_bytes(), b"hello world\n");

        // nothing new: no second patch goes out
        trace.send_patch().await;
        assert_eq!(coordinator.patch_count(), 1);
    }

    #[tokio::test]
    async fn test_range_mismatch_resyncs() {
        let coordinator = Arc::new(MockCoordinator::new());
        coordinator.respond_to_patch(PatchResult::RangeMismatch { offset: 0 });

        let trace = JobTrace::new(
            runner(),
            creds(),
            coordinator.clone(),
            CancellationToken::new(),
        )
        .unwrap();

        trace.write(b"some output");
        trace.send_patch().await;
        assert_eq!(trace.state.lock().sent_offset, 0);

        // after resync the full range is resent and accepted
        coordinator.respond_to_patch(PatchResult::Accepted {
            update_interval: None,
        });
        trace.send_patch().await;
        assert_eq!(trace.state.lock().sent_offset, trace.size());
    }

    #[tokio::test]
    async fn test_cancellation_from_patch_response() {
        let coordinator = Arc::new(MockCoordinator::new());
        coordinator.respond_to_patch(PatchResult::Canceled);

        let trace = JobTrace::new(
            runner(),
            creds(),
            coordinator.clone(),
            CancellationToken::new(),
        )
        .unwrap();
        let token = trace.cancel_token();

        trace.write(b"about to be canceled");
        trace.send_patch().await;

        assert!(token.is_cancelled());
        assert!(!trace.is_aborted());
    }

    #[tokio::test]
    async fn test_failure_backs_off() {
        let coordinator = Arc::new(MockCoordinator::new());
        coordinator.respond_to_patch(PatchResult::Failed);

        let trace = JobTrace::new(
            runner(),
            creds(),
            coordinator.clone(),
            CancellationToken::new(),
        )
        .unwrap();

        trace.write(b"x");
        trace.send_patch().await;
        assert_eq!(trace.state.lock().interval, DEFAULT_UPDATE_INTERVAL * 2);
        trace.write(b"y");
        trace.send_patch().await;
        assert_eq!(trace.state.lock().interval, DEFAULT_UPDATE_INTERVAL * 4);
    }

    #[tokio::test]
    async fn test_finalize_reports_terminal_state() {
        let coordinator = Arc::new(MockCoordinator::new());
        let trace = JobTrace::new(
            runner(),
            creds(),
            coordinator.clone(),
            CancellationToken::new(),
        )
        .unwrap();

        trace.writeln("job output");
        trace.finalize(BuildStatus::ScriptFailure).await;

        let updates = coordinator.updates();
        let last = updates.last().unwrap();
        assert_eq!(last.state, JobState::Failed);
        assert_eq!(
            last.failure_reason,
            Some(gantry_core::domain::failure::FailureReason::ScriptFailure)
        );
        assert_eq!(last.checksum.as_deref(), Some(trace.checksum().as_str()));
        // the full trace reached the coordinator before the final update
        assert_eq!(coordinator.patched_bytes().len(), trace.size());
    }

    #[tokio::test]
    async fn test_update_idempotent_when_state_unchanged() {
        let coordinator = Arc::new(MockCoordinator::new());
        let trace = JobTrace::new(
            runner(),
            creds(),
            coordinator.clone(),
            CancellationToken::new(),
        )
        .unwrap();

        trace.send_update(UpdateJobInfo::running()).await;
        trace.send_update(UpdateJobInfo::running()).await;

        let updates = coordinator.updates();
        assert_eq!(updates.len(), 2);
        assert!(updates.iter().all(|u| u.state == JobState::Running));
        assert!(!trace.cancel_token().is_cancelled());
    }
}
