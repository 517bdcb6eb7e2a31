//! Error types for the coordinator client

use thiserror::Error;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur when talking to the coordinator
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// Coordinator returned an error status code
    #[error("coordinator error (status {status}): {message}")]
    ApiError {
        /// HTTP status code
        status: u16,
        /// Error message from the coordinator
        message: String,
    },

    /// Failed to parse a response body
    #[error("failed to parse response: {0}")]
    ParseError(String),

    /// Local I/O while streaming a body
    #[error("artifact I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        ClientError::ApiError {
            status,
            message: message.into(),
        }
    }
}
