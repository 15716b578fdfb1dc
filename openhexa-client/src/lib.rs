//! Typed client for the OpenHexa metadata service
//!
//! Lists dataset files and resolves signed download URLs through the
//! OpenHexa GraphQL API, with bounded timeouts and retries.

pub mod client;
pub mod config;
pub mod error;
pub mod records;

pub use client::OpenHexaClient;
pub use config::{ClientConfig, DEFAULT_GRAPHQL_URL};
pub use error::{ClientError, Result};
pub use records::DatasetFileRecord;
