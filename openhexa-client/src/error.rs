//! Error types for OpenHexa metadata requests

use reqwest::StatusCode;
use thiserror::Error;

/// Errors returned by the OpenHexa GraphQL client
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport failure: connection refused/reset, request timeout, TLS
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// Upstream answered with a non-success status code
    #[error("upstream returned status {status}: {body}")]
    Status { status: StatusCode, body: String },

    /// Upstream answered 200 but reported GraphQL errors
    #[error("GraphQL errors: {}", .0.join("; "))]
    GraphQl(Vec<String>),

    /// Upstream reported the object missing or hidden from this credential
    #[error("not found or not accessible: {}", .0.join("; "))]
    NotAccessible(Vec<String>),

    /// Response body did not match the expected shape
    #[error("malformed response: {0}")]
    Decode(String),

    /// Client could not be built from its configuration
    #[error("invalid client configuration: {0}")]
    InvalidConfig(String),
}

impl ClientError {
    /// Whether the failure is transient and the request may be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ClientError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            ClientError::GraphQl(_)
            | ClientError::NotAccessible(_)
            | ClientError::Decode(_)
            | ClientError::InvalidConfig(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
