//! Runner registration DTOs

use serde::{Deserialize, Serialize};

/// Runner identification sent with registration and job requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerInfo {
    pub name: String,
    pub version: String,
    pub executor: String,
    pub shell: String,
}

/// Registration request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRunnerRequest {
    pub token: String,
    #[serde(default)]
    pub description: Option<String>,
    pub info: RunnerInfo,
}

/// Registration response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRunnerResponse {
    pub id: u64,
    pub token: String,
}

/// Token-only body used by verify/unregister
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerCredentials {
    pub token: String,
}
