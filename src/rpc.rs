//! JSON-RPC 2.0 envelope types and wire helpers.
//!
//! Children speak one JSON object per line over stdio; remote clients send
//! single JSON objects over HTTP or WebSocket text frames. Both sides share
//! these types. Classification is deliberately forgiving: anything that is
//! not a well-formed message becomes [`RpcMessage::Invalid`] and is routed
//! to the log sink rather than torn down.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

pub const JSONRPC_VERSION: &str = "2.0";

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// A request id: string or number per the JSON-RPC 2.0 grammar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Num(i64),
    Str(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RpcId>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn new(id: Option<RpcId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Option<RpcId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Build an error response envelope with the given code and message.
pub fn error_response(id: Option<RpcId>, code: i64, message: impl Into<String>) -> RpcResponse {
    RpcResponse {
        jsonrpc: JSONRPC_VERSION.to_string(),
        id,
        result: None,
        error: Some(RpcError {
            code,
            message: message.into(),
            data: None,
        }),
    }
}

/// One parsed line from a child's stdout.
#[derive(Debug, Clone)]
pub enum RpcMessage {
    /// Has an `id` and exactly one of `result` / `error`.
    Response(RpcResponse),
    /// Server-initiated request (has `method` and `id`); delivered
    /// out-of-band like a notification.
    Request(RpcRequest),
    /// Has `method` but no `id`.
    Notification(RpcRequest),
    /// Not a JSON-RPC message; the raw text is forwarded to the log sink.
    Invalid(String),
}

/// Classify one line of child output.
pub fn classify(line: &str) -> RpcMessage {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => return RpcMessage::Invalid(line.to_string()),
    };

    let obj = match value.as_object() {
        Some(o) => o,
        None => return RpcMessage::Invalid(line.to_string()),
    };

    let has_id = obj.get("id").map(|v| !v.is_null()).unwrap_or(false);
    let has_method = obj.contains_key("method");
    let has_result = obj.contains_key("result");
    let has_error = obj.contains_key("error");

    if has_id && !has_method && (has_result ^ has_error) {
        return match serde_json::from_value::<RpcResponse>(value) {
            Ok(resp) => RpcMessage::Response(resp),
            Err(_) => RpcMessage::Invalid(line.to_string()),
        };
    }

    if has_method {
        return match serde_json::from_value::<RpcRequest>(value) {
            Ok(req) if has_id => RpcMessage::Request(req),
            Ok(req) => RpcMessage::Notification(req),
            Err(_) => RpcMessage::Invalid(line.to_string()),
        };
    }

    RpcMessage::Invalid(line.to_string())
}

/// Validate an inbound client envelope against the JSON-RPC 2.0 grammar.
///
/// `jsonrpc` must be the string `"2.0"`, `method` a non-empty string, `id`
/// a string, a number, or absent. `params` is unconstrained.
pub fn validate_envelope(value: &Value) -> std::result::Result<RpcRequest, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| "request body must be a JSON object".to_string())?;

    match obj.get("jsonrpc").and_then(Value::as_str) {
        Some(JSONRPC_VERSION) => {}
        _ => return Err("jsonrpc must be the string \"2.0\"".to_string()),
    }

    let method = match obj.get("method").and_then(Value::as_str) {
        Some(m) if !m.is_empty() => m.to_string(),
        Some(_) => return Err("method must be a non-empty string".to_string()),
        None => return Err("method must be a string".to_string()),
    };

    let id = match obj.get("id") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(RpcId::Str(s.clone())),
        Some(Value::Number(n)) => match n.as_i64() {
            Some(i) => Some(RpcId::Num(i)),
            None => return Err("id must be an integer or a string".to_string()),
        },
        Some(_) => return Err("id must be a string or a number".to_string()),
    };

    Ok(RpcRequest {
        jsonrpc: JSONRPC_VERSION.to_string(),
        id,
        method,
        params: obj.get("params").cloned(),
    })
}

/// Canonical JSON: object keys sorted recursively, no insignificant
/// whitespace. Semantically equal bodies canonicalize to identical bytes.
pub fn canonicalize(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut sorted = Map::new();
                for k in keys {
                    sorted.insert(k.clone(), sort(&map[k]));
                }
                Value::Object(sorted)
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

/// Cache fingerprint: SHA-256 over the service id and the canonicalised
/// request body.
pub fn fingerprint(service_id: &str, body: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(service_id.as_bytes());
    hasher.update(canonicalize(body).as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serialization_omits_absent_fields() {
        let req = RpcRequest::new(Some(RpcId::Num(1)), "initialize", None);
        let out = serde_json::to_string(&req).unwrap();
        assert!(out.contains("\"jsonrpc\":\"2.0\""));
        assert!(out.contains("\"id\":1"));
        assert!(!out.contains("params"));
    }

    #[test]
    fn classify_response() {
        let msg = classify(r#"{"jsonrpc":"2.0","id":3,"result":{"ok":true}}"#);
        match msg {
            RpcMessage::Response(resp) => {
                assert_eq!(resp.id, Some(RpcId::Num(3)));
                assert!(resp.error.is_none());
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn classify_notification() {
        let msg = classify(r#"{"jsonrpc":"2.0","method":"progress","params":{"pct":50}}"#);
        assert!(matches!(msg, RpcMessage::Notification(_)));
    }

    #[test]
    fn classify_server_initiated_request() {
        let msg = classify(r#"{"jsonrpc":"2.0","id":9,"method":"sampling/create"}"#);
        assert!(matches!(msg, RpcMessage::Request(_)));
    }

    #[test]
    fn classify_rejects_result_and_error_together() {
        let msg = classify(r#"{"jsonrpc":"2.0","id":1,"result":1,"error":{"code":0,"message":""}}"#);
        assert!(matches!(msg, RpcMessage::Invalid(_)));
    }

    #[test]
    fn classify_non_json_is_invalid() {
        assert!(matches!(classify("npm WARN deprecated"), RpcMessage::Invalid(_)));
    }

    #[test]
    fn validate_rejects_wrong_version() {
        let err = validate_envelope(&json!({"jsonrpc":"1.0","method":"x"})).unwrap_err();
        assert!(err.contains("2.0"));
    }

    #[test]
    fn validate_rejects_empty_method() {
        assert!(validate_envelope(&json!({"jsonrpc":"2.0","method":""})).is_err());
    }

    #[test]
    fn validate_rejects_object_id() {
        assert!(validate_envelope(&json!({"jsonrpc":"2.0","method":"m","id":{}})).is_err());
    }

    #[test]
    fn validate_accepts_string_and_numeric_ids() {
        let req = validate_envelope(&json!({"jsonrpc":"2.0","method":"m","id":"abc"})).unwrap();
        assert_eq!(req.id, Some(RpcId::Str("abc".into())));
        let req = validate_envelope(&json!({"jsonrpc":"2.0","method":"m","id":7})).unwrap();
        assert_eq!(req.id, Some(RpcId::Num(7)));
    }

    #[test]
    fn canonicalize_sorts_keys_recursively() {
        let a = json!({"b":{"z":1,"a":2},"a":[{"y":1,"x":2}]});
        let b = json!({"a":[{"x":2,"y":1}],"b":{"a":2,"z":1}});
        assert_eq!(canonicalize(&a), canonicalize(&b));
        assert_eq!(canonicalize(&a), r#"{"a":[{"x":2,"y":1}],"b":{"a":2,"z":1}}"#);
    }

    #[test]
    fn fingerprint_is_whitespace_insensitive() {
        let a: Value = serde_json::from_str(r#"{ "method": "ping" , "jsonrpc": "2.0" }"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"jsonrpc":"2.0","method":"ping"}"#).unwrap();
        assert_eq!(fingerprint("svc", &a), fingerprint("svc", &b));
        assert_ne!(fingerprint("svc", &a), fingerprint("other", &a));
    }
}
