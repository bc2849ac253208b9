//! API-key authentication for the management surface.
//!
//! Keys arrive in the `X-API-Key` header or, for WebSocket clients that
//! cannot set headers, the `api_key` query parameter. Only the SHA-256 of
//! the presented secret ever reaches the store.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use crate::error::GatewayError;
use crate::registry::hash_secret;
use crate::state::AppState;

pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let presented = extract_key(&request);
    let authorized = match presented {
        Some(secret) => state
            .registry
            .verify_api_key(&hash_secret(&secret))
            .unwrap_or(false),
        None => false,
    };

    if authorized {
        next.run(request).await
    } else {
        debug!(path = %request.uri().path(), "rejected management request");
        GatewayError::Unauthorized.into_response()
    }
}

fn extract_key(request: &Request) -> Option<String> {
    if let Some(header) = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
    {
        return Some(header.to_string());
    }
    let query = request.uri().query()?;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        if parts.next() == Some("api_key") {
            return parts.next().map(str::to_string);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;

    fn request(uri: &str, header: Option<&str>) -> Request {
        let mut builder = HttpRequest::builder().uri(uri);
        if let Some(key) = header {
            builder = builder.header("x-api-key", key);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn header_takes_precedence_over_query() {
        let req = request("/api/services?api_key=from-query", Some("from-header"));
        assert_eq!(extract_key(&req).as_deref(), Some("from-header"));
    }

    #[test]
    fn query_fallback_parses_api_key() {
        let req = request("/api/services?limit=5&api_key=secret", None);
        assert_eq!(extract_key(&req).as_deref(), Some("secret"));
    }

    #[test]
    fn absent_key_is_none() {
        let req = request("/api/services", None);
        assert_eq!(extract_key(&req), None);
    }
}
