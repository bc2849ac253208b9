//! The proxied request path: longest-prefix routing, rate limiting, cache
//! lookup, dispatch to the supervisor, and error translation.

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::debug;

use super::rate_limit::{client_key, RateLimitDecision};
use crate::error::GatewayError;
use crate::registry::ServiceDefinition;
use crate::rpc;
use crate::state::AppState;

/// Upper bound on proxied request bodies.
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Liveness endpoint for the gateway itself.
pub async fn gateway_health(State(state): State<AppState>) -> Json<Value> {
    let counts = state.manager.counts().await;
    Json(json!({
        "status": "healthy",
        "services": {
            "total": counts.total,
            "running": counts.running,
            "stopped": counts.stopped,
        },
    }))
}

/// Catch-all handler behind the fixed routes: everything here is addressed
/// to some service's `proxy_path`.
pub async fn proxy_fallback(State(state): State<AppState>, req: Request) -> Response {
    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    match dispatch(state, remote, req).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn dispatch(
    state: AppState,
    remote: Option<SocketAddr>,
    req: Request,
) -> Result<Response, GatewayError> {
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();

    if parts.method == Method::GET {
        if let Some(prefix) = path.strip_suffix("/health") {
            if let Some(def) = resolve_exact(&state, prefix)? {
                return service_health(&state, &def).await;
            }
        }
        return Err(GatewayError::NotFound);
    }
    if parts.method != Method::POST {
        return Err(GatewayError::NotFound);
    }

    let def = resolve_longest_prefix(&state, &path)?.ok_or(GatewayError::NotFound)?;

    let key = client_key(&parts.headers, remote);
    let decision = state.limiter.check(&def.id, &key, def.rate_limit)?;

    // Past the limiter, every outcome carries the window headers.
    let result = forward(&state, &def, body).await;
    let mut response = match result {
        Ok(response) => response,
        Err(e) => e.into_response(),
    };
    apply_rate_headers(&mut response, &decision);
    Ok(response)
}

async fn forward(
    state: &AppState,
    def: &ServiceDefinition,
    body: Body,
) -> Result<Response, GatewayError> {
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| GatewayError::InvalidRequest(format!("unreadable body: {e}")))?;
    let value: Value = serde_json::from_slice(&bytes)
        .map_err(|e| GatewayError::InvalidRequest(format!("body is not JSON: {e}")))?;
    let request = rpc::validate_envelope(&value).map_err(GatewayError::InvalidRequest)?;

    let cacheable = def.cache_ttl > 0 && def.cache_enabled;
    let fingerprint = cacheable.then(|| rpc::fingerprint(&def.id, &value));

    if let Some(fp) = &fingerprint {
        if let Some(cached) = state.cache.get(&def.id, fp) {
            debug!(service = %def.id, "cache hit");
            return Ok(rpc_body(cached, "HIT"));
        }
    }

    let supervisor =
        state
            .manager
            .get(&def.id)
            .await
            .ok_or_else(|| GatewayError::IllegalState {
                status: "stopped".to_string(),
                last_error: None,
            })?;

    let response = supervisor.send_request(request).await?;
    let body = serde_json::to_vec(&response)?;

    if let Some(fp) = &fingerprint {
        if response.error.is_none() {
            state
                .cache
                .put(&def.id, fp, body.clone(), Duration::from_secs(def.cache_ttl));
        }
    }

    Ok(rpc_body(body, "MISS"))
}

async fn service_health(
    state: &AppState,
    def: &ServiceDefinition,
) -> Result<Response, GatewayError> {
    let status = match state.manager.get(&def.id).await {
        Some(sup) => sup.status(),
        None => {
            return Ok(Json(json!({
                "status": "stopped",
                "metrics": {},
                "lastError": null,
            }))
            .into_response())
        }
    };
    Ok(Json(json!({
        "status": status.state.as_str(),
        "metrics": {
            "uptimeSecs": status.uptime_secs,
            "pid": status.pid,
            "restartCount": status.restart_count,
            "droppedNotifications": status.dropped_notifications,
        },
        "lastError": status.last_error,
    }))
    .into_response())
}

/// Longest-prefix match of a request path against the registered
/// `proxy_path`es.
fn resolve_longest_prefix(
    state: &AppState,
    path: &str,
) -> Result<Option<ServiceDefinition>, GatewayError> {
    let mut best: Option<ServiceDefinition> = None;
    for def in state.registry.list_services()? {
        let prefix = def.proxy_path.trim_end_matches('/');
        let matches = path == prefix || path.starts_with(&format!("{prefix}/"));
        if matches
            && best
                .as_ref()
                .map_or(true, |b| prefix.len() > b.proxy_path.trim_end_matches('/').len())
        {
            best = Some(def);
        }
    }
    Ok(best)
}

fn resolve_exact(state: &AppState, path: &str) -> Result<Option<ServiceDefinition>, GatewayError> {
    let path = path.trim_end_matches('/');
    Ok(state
        .registry
        .list_services()?
        .into_iter()
        .find(|def| def.proxy_path.trim_end_matches('/') == path))
}

fn rpc_body(bytes: Vec<u8>, cache_state: &str) -> Response {
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    if let Ok(v) = cache_state.parse() {
        response.headers_mut().insert("X-Cache", v);
    }
    response
}

fn apply_rate_headers(response: &mut Response, decision: &RateLimitDecision) {
    let headers = response.headers_mut();
    if let Ok(v) = decision.limit.to_string().parse() {
        headers.insert("X-RateLimit-Limit", v);
    }
    if let Ok(v) = decision.remaining.to_string().parse() {
        headers.insert("X-RateLimit-Remaining", v);
    }
    if let Ok(v) = decision.reset_ms.to_string().parse() {
        headers.insert("X-RateLimit-Reset", v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Registry, ServiceDefinition, ServiceSpec};
    use std::sync::Arc;

    fn state_with(paths: &[(&str, &str)]) -> AppState {
        let registry = Arc::new(Registry::open_in_memory().unwrap());
        for (id, path) in paths {
            let spec: ServiceSpec = serde_json::from_value(json!({
                "name": id,
                "entryPoint": "/bin/true",
                "workingDir": "/tmp",
                "proxyPath": path,
            }))
            .unwrap();
            registry
                .insert_service(&ServiceDefinition::from_spec(*id, spec))
                .unwrap();
        }
        AppState::new(registry)
    }

    #[test]
    fn longest_prefix_wins() {
        let state = state_with(&[("a", "/mcp"), ("b", "/mcp/deep")]);
        let def = resolve_longest_prefix(&state, "/mcp/deep/tools").unwrap().unwrap();
        assert_eq!(def.id, "b");
        let def = resolve_longest_prefix(&state, "/mcp/other").unwrap().unwrap();
        assert_eq!(def.id, "a");
        assert!(resolve_longest_prefix(&state, "/elsewhere").unwrap().is_none());
    }

    #[test]
    fn prefix_match_respects_path_boundaries() {
        let state = state_with(&[("a", "/mcp/a")]);
        // "/mcp/ab" shares the string prefix but not the path prefix.
        assert!(resolve_longest_prefix(&state, "/mcp/ab").unwrap().is_none());
        assert!(resolve_longest_prefix(&state, "/mcp/a").unwrap().is_some());
        assert!(resolve_longest_prefix(&state, "/mcp/a/").unwrap().is_some());
    }

    #[test]
    fn exact_resolution_ignores_deeper_paths() {
        let state = state_with(&[("a", "/mcp/a")]);
        assert!(resolve_exact(&state, "/mcp/a").unwrap().is_some());
        assert!(resolve_exact(&state, "/mcp/a/sub").unwrap().is_none());
    }
}
