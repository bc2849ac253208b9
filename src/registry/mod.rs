//! Durable configuration: service definitions, API keys, settings.

pub mod models;
pub mod store;

pub use models::{ApiKeyRecord, DesiredStatus, ServiceDefinition, ServiceSpec};
pub use store::{hash_secret, Registry};
