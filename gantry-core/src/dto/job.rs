//! Job lifecycle DTOs

use serde::{Deserialize, Serialize};

use crate::domain::failure::{FailureReason, JobState};
use crate::domain::job::SessionInfo;
use crate::dto::runner::RunnerInfo;

/// Job request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestJobRequest {
    pub token: String,
    pub info: RunnerInfo,
    #[serde(default)]
    pub session: Option<SessionInfo>,
}

/// Job state update body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateJobRequest {
    pub token: String,
    pub state: JobState,
    #[serde(default)]
    pub failure_reason: Option<FailureReason>,
    /// Checksum of the full trace, sent with terminal updates.
    #[serde(default)]
    pub checksum: Option<String>,
}
