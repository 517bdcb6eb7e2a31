//! Terminal build statuses and failure classification
//!
//! A build ends in exactly one terminal status. When several failure events
//! occur, the one with the highest severity wins; a status can only ever be
//! upgraded, never downgraded.

use serde::{Deserialize, Serialize};

/// Job state reported upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Success => "success",
            JobState::Failed => "failed",
            JobState::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// Structured failure reason reported upstream alongside a failed state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ScriptFailure,
    RunnerSystemFailure,
    JobExecutionTimeout,
    JobCanceled,
}

/// Terminal status of a build
///
/// Severity ordering (higher wins): canceled > timed-out > system-failure >
/// script-failure > success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Success,
    ScriptFailure,
    SystemFailure,
    TimedOut,
    Canceled,
}

impl BuildStatus {
    pub fn severity(self) -> u8 {
        match self {
            BuildStatus::Success => 0,
            BuildStatus::ScriptFailure => 1,
            BuildStatus::SystemFailure => 2,
            BuildStatus::TimedOut => 3,
            BuildStatus::Canceled => 4,
        }
    }

    /// Combine two observed statuses, keeping the more severe one.
    pub fn combine(self, other: BuildStatus) -> BuildStatus {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    pub fn is_success(self) -> bool {
        self == BuildStatus::Success
    }

    /// Upstream (state, failure reason) pair for this terminal status.
    pub fn upstream(self) -> (JobState, Option<FailureReason>) {
        match self {
            BuildStatus::Success => (JobState::Success, None),
            BuildStatus::ScriptFailure => {
                (JobState::Failed, Some(FailureReason::ScriptFailure))
            }
            BuildStatus::SystemFailure => {
                (JobState::Failed, Some(FailureReason::RunnerSystemFailure))
            }
            BuildStatus::TimedOut => {
                (JobState::Failed, Some(FailureReason::JobExecutionTimeout))
            }
            BuildStatus::Canceled => (JobState::Canceled, Some(FailureReason::JobCanceled)),
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BuildStatus::Success => "success",
            BuildStatus::ScriptFailure => "script failure",
            BuildStatus::SystemFailure => "system failure",
            BuildStatus::TimedOut => "timed out",
            BuildStatus::Canceled => "canceled",
        };
        f.write_str(s)
    }
}
