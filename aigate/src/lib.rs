pub mod auth;
pub mod batch;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod mapper;
pub mod providers;
pub mod scheduler;
pub mod sse;
pub mod store;
pub mod translate;
pub mod types;
pub mod usage;

// Re-exports for convenience
pub use auth::registry::CredentialStore;
pub use auth::tokens::TokenManager;
pub use auth::{CredentialRecord, CredentialSecret, OAuthTokens, ProxyMetadata};
pub use batch::{BatchAggregator, BatchConfig};
pub use dispatch::{deadline_after, Dispatcher};
pub use engine::{Engine, EngineConfig, ProviderRuntime};
pub use error::GatewayError;
pub use mapper::{join_model_id, split_model_id};
pub use providers::{AdapterRegistry, ProviderAdapter, RotationMode};
pub use scheduler::CredentialScheduler;
pub use store::{ResilientWriter, StatePaths};
pub use types::*;
pub use usage::{AttemptOutcome, UsageManager};
