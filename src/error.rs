use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::rpc::error_codes;

/// Error taxonomy surfaced at the HTTP boundary.
///
/// Each variant maps to exactly one HTTP status and, where the wire
/// contract calls for it, a JSON-RPC error envelope.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("no such service or route")]
    NotFound,

    #[error("service unavailable (status: {status})")]
    IllegalState {
        status: String,
        last_error: Option<String>,
    },

    #[error("rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimited {
        retry_after_secs: u64,
        limit: u32,
        reset_ms: u128,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("child transport closed: {0}")]
    TransportClosed(String),

    #[error("missing or invalid API key")]
    Unauthorized,

    #[error("{0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::NotFound => StatusCode::NOT_FOUND,
            GatewayError::IllegalState { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::InvalidRequest(_) | GatewayError::InvalidParams(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::TransportClosed(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::Conflict(_) => StatusCode::CONFLICT,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON-RPC error code for variants that answer proxied RPC traffic.
    pub fn jsonrpc_code(&self) -> Option<i64> {
        match self {
            GatewayError::InvalidRequest(_) => Some(error_codes::INVALID_REQUEST),
            GatewayError::InvalidParams(_) => Some(error_codes::INVALID_PARAMS),
            GatewayError::Timeout(_)
            | GatewayError::TransportClosed(_)
            | GatewayError::Internal(_) => Some(error_codes::INTERNAL_ERROR),
            _ => None,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();

        let body = match &self {
            GatewayError::IllegalState {
                status: svc_status,
                last_error,
            } => json!({
                "error": self.to_string(),
                "status": svc_status,
                "lastError": last_error,
            }),
            _ => match self.jsonrpc_code() {
                Some(code) => json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": { "code": code, "message": self.to_string() },
                }),
                None => json!({ "error": self.to_string() }),
            },
        };

        let mut response = (status, Json(body)).into_response();

        if let GatewayError::RateLimited {
            retry_after_secs,
            limit,
            reset_ms,
        } = &self
        {
            let headers = response.headers_mut();
            if let Ok(v) = retry_after_secs.to_string().parse() {
                headers.insert(header::RETRY_AFTER, v);
            }
            if let Ok(v) = limit.to_string().parse() {
                headers.insert("X-RateLimit-Limit", v);
            }
            if let Ok(v) = "0".parse() {
                headers.insert("X-RateLimit-Remaining", v);
            }
            if let Ok(v) = reset_ms.to_string().parse() {
                headers.insert("X-RateLimit-Reset", v);
            }
        }

        response
    }
}

impl From<rusqlite::Error> for GatewayError {
    fn from(e: rusqlite::Error) -> Self {
        GatewayError::Internal(format!("store error: {e}"))
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Internal(format!("serialization error: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
