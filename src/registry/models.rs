use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Persisted intent for a service: should the gateway keep it running?
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredStatus {
    Running,
    Stopped,
}

impl DesiredStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DesiredStatus::Running => "running",
            DesiredStatus::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(DesiredStatus::Running),
            "stopped" => Some(DesiredStatus::Stopped),
            _ => None,
        }
    }
}

/// Durable definition of one proxied service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDefinition {
    /// Opaque unique identifier, assigned at creation.
    pub id: String,
    /// Human label; duplicates allowed.
    pub name: String,
    /// Executable or script, relative to `working_dir` unless absolute.
    pub entry_point: String,
    /// Absolute directory; must exist when starting.
    pub working_dir: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Overlaid on the gateway's own environment at spawn time.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Unique URL path prefix under which clients address the service.
    pub proxy_path: String,
    /// Requests per window.
    #[serde(default = "defaults::rate_limit")]
    pub rate_limit: u32,
    /// Cache TTL in seconds; 0 disables caching.
    #[serde(default)]
    pub cache_ttl: u64,
    /// Per-service opt-out for the response cache.
    #[serde(default = "defaults::cache_enabled")]
    pub cache_enabled: bool,
    /// Per-request deadline in milliseconds.
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub auto_restart: bool,
    #[serde(default = "defaults::max_restarts")]
    pub max_restarts: u32,
    /// Liveness probe interval in seconds.
    #[serde(default = "defaults::health_check_interval")]
    pub health_check_interval: u64,
    #[serde(default = "defaults::desired_status")]
    pub desired_status: DesiredStatus,
}

mod defaults {
    use super::DesiredStatus;

    pub fn rate_limit() -> u32 {
        100
    }
    pub fn cache_enabled() -> bool {
        true
    }
    pub fn timeout_ms() -> u64 {
        30_000
    }
    pub fn max_restarts() -> u32 {
        3
    }
    pub fn health_check_interval() -> u64 {
        30
    }
    pub fn desired_status() -> DesiredStatus {
        DesiredStatus::Stopped
    }
}

/// Client-supplied service payload, before an id is assigned.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    pub name: String,
    pub entry_point: String,
    pub working_dir: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub proxy_path: String,
    #[serde(default = "defaults::rate_limit")]
    pub rate_limit: u32,
    #[serde(default)]
    pub cache_ttl: u64,
    #[serde(default = "defaults::cache_enabled")]
    pub cache_enabled: bool,
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub auto_restart: bool,
    #[serde(default = "defaults::max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "defaults::health_check_interval")]
    pub health_check_interval: u64,
    #[serde(default = "defaults::desired_status")]
    pub desired_status: DesiredStatus,
}

impl ServiceDefinition {
    pub fn from_spec(id: impl Into<String>, spec: ServiceSpec) -> Self {
        Self {
            id: id.into(),
            name: spec.name,
            entry_point: spec.entry_point,
            working_dir: spec.working_dir,
            args: spec.args,
            env: spec.env,
            proxy_path: spec.proxy_path,
            rate_limit: spec.rate_limit,
            cache_ttl: spec.cache_ttl,
            cache_enabled: spec.cache_enabled,
            timeout_ms: spec.timeout_ms,
            auto_restart: spec.auto_restart,
            max_restarts: spec.max_restarts,
            health_check_interval: spec.health_check_interval,
            desired_status: spec.desired_status,
        }
    }

    /// Field-level validation applied on create and update.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.name.trim().is_empty() {
            return Err(GatewayError::InvalidParams("name must not be empty".into()));
        }
        if self.entry_point.trim().is_empty() {
            return Err(GatewayError::InvalidParams(
                "entryPoint must not be empty".into(),
            ));
        }
        if self.working_dir.trim().is_empty() {
            return Err(GatewayError::InvalidParams(
                "workingDir must not be empty".into(),
            ));
        }
        if !self.proxy_path.starts_with('/') || self.proxy_path.len() < 2 {
            return Err(GatewayError::InvalidParams(
                "proxyPath must be a non-root absolute URL path".into(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(GatewayError::InvalidParams("timeout must be > 0".into()));
        }
        Ok(())
    }
}

/// A management API key. Only the SHA-256 of the secret is retained.
#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyRecord {
    pub hash: String,
    pub name: String,
    pub active: bool,
    pub created_at: String,
    pub last_used: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ServiceSpec {
        serde_json::from_value(serde_json::json!({
            "name": "echo",
            "entryPoint": "echo.js",
            "workingDir": "/srv/echo",
            "proxyPath": "/mcp/echo",
        }))
        .unwrap()
    }

    #[test]
    fn spec_defaults_applied() {
        let def = ServiceDefinition::from_spec("svc-1", spec());
        assert_eq!(def.rate_limit, 100);
        assert_eq!(def.timeout_ms, 30_000);
        assert!(def.cache_enabled);
        assert_eq!(def.desired_status, DesiredStatus::Stopped);
        assert!(def.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_timeout() {
        let mut def = ServiceDefinition::from_spec("svc-1", spec());
        def.timeout_ms = 0;
        assert!(def.validate().is_err());
    }

    #[test]
    fn validate_rejects_relative_proxy_path() {
        let mut def = ServiceDefinition::from_spec("svc-1", spec());
        def.proxy_path = "mcp/echo".into();
        assert!(def.validate().is_err());
    }

    #[test]
    fn desired_status_roundtrip() {
        assert_eq!(DesiredStatus::parse("running"), Some(DesiredStatus::Running));
        assert_eq!(DesiredStatus::parse("stopped"), Some(DesiredStatus::Stopped));
        assert_eq!(DesiredStatus::parse("paused"), None);
        assert_eq!(DesiredStatus::Running.as_str(), "running");
    }
}
