use datafusion::arrow::error::ArrowError;
use datafusion::error::DataFusionError;
use openhexa_client::ClientError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Upstream metadata request failed after retries
    #[error("OpenHexa client error: {0}")]
    Client(#[from] ClientError),

    /// Failure shared by every waiter of one single-flight load
    #[error("{0}")]
    Shared(#[from] Arc<Error>),

    #[error("DataFusion error: {0}")]
    DataFusion(#[from] DataFusionError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),

    /// Engine session could not be opened for an identity
    #[error("failed to create session for '{identity}': {source}")]
    SessionCreation {
        identity: String,
        #[source]
        source: Box<Error>,
    },

    #[error("session for '{0}' is closed")]
    SessionClosed(String),

    #[error("session registry is shut down")]
    ShuttingDown,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<Error> for DataFusionError {
    fn from(err: Error) -> Self {
        match err {
            Error::DataFusion(e) => e,
            other => DataFusionError::External(Box::new(other)),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
