// DataFusion integration for OpenHexa dataset files

pub mod cache;
pub mod config;
pub mod error;
pub mod exec;
pub mod functions;
pub mod gateway;
pub mod identity;
pub mod metadata_provider;
pub mod registry;
pub mod schema;
pub mod session;

pub use cache::{CacheStats, Fingerprint, MetadataCache, ResponseCache};
pub use config::{
    CacheConfig, FunctionConfig, GatewayConfig, ListingScope, OpenHexaConfig, SessionConfig,
};
pub use error::{Error, Result};
pub use functions::{register_functions, ListFilesFunction, ResolveUrlUdf};
pub use gateway::ConnectionGateway;
pub use identity::CallerIdentity;
pub use metadata_provider::MetadataProvider;
pub use registry::SessionRegistry;
pub use session::{DataFusionEngineFactory, EngineFactory, QueryDeadline, Session, SessionState};
