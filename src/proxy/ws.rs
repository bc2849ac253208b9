//! WebSocket bridge: bidirectional JSON-RPC per connection, plus
//! notification fan-out from the child.
//!
//! Rate limiting and response caching do not apply on this path.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::rpc::{self, error_codes, RpcRequest};
use crate::state::AppState;
use crate::supervisor::Supervisor;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub service: String,
}

/// Upgrade handler. The service is resolved and must be running before the
/// upgrade completes; failures surface as plain HTTP errors.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let supervisor = match resolve(&state, &query.service).await {
        Ok(sup) => sup,
        Err(e) => return e.into_response(),
    };
    let notifications = match supervisor.subscribe_notifications() {
        Ok(rx) => rx,
        Err(e) => return e.into_response(),
    };
    let service_id = query.service.clone();
    ws.on_upgrade(move |socket| async move {
        bridge(socket, supervisor, notifications, service_id).await;
    })
}

async fn resolve(state: &AppState, service_id: &str) -> Result<Arc<Supervisor>, GatewayError> {
    if state.registry.get_service(service_id)?.is_none() {
        return Err(GatewayError::NotFound);
    }
    let supervisor = state
        .manager
        .get(service_id)
        .await
        .ok_or_else(|| GatewayError::IllegalState {
            status: "stopped".to_string(),
            last_error: None,
        })?;
    let status = supervisor.status();
    if !status.state.is_running() {
        return Err(GatewayError::IllegalState {
            status: status.state.as_str().to_string(),
            last_error: status.last_error,
        });
    }
    Ok(supervisor)
}

async fn bridge(
    socket: WebSocket,
    supervisor: Arc<Supervisor>,
    mut notifications: broadcast::Receiver<RpcRequest>,
    service_id: String,
) {
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            note = notifications.recv() => match note {
                Ok(note) => {
                    let Ok(text) = serde_json::to_string(&note) else { continue };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(service = %service_id, skipped, "socket lagged behind notifications");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let reply = answer_frame(&supervisor, text.as_str()).await;
                    let Ok(reply_text) = serde_json::to_string(&reply) else { continue };
                    if sink.send(Message::Text(reply_text.into())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(service = %service_id, "socket receive error: {e}");
                    break;
                }
            },
        }
    }

    // Dropping the notification receiver unsubscribes; any request still in
    // flight loses its waiter and its response is logged as an orphan.
    debug!(service = %service_id, "socket closed");
}

/// Parse one inbound text frame and produce the reply envelope. Invalid
/// frames answer with `-32600` and keep the connection open.
async fn answer_frame(supervisor: &Arc<Supervisor>, text: &str) -> rpc::RpcResponse {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => {
            return rpc::error_response(None, error_codes::INVALID_REQUEST, "frame is not JSON")
        }
    };
    let request = match rpc::validate_envelope(&value) {
        Ok(req) => req,
        Err(reason) => return rpc::error_response(None, error_codes::INVALID_REQUEST, reason),
    };
    let original_id = request.id.clone();

    match supervisor.send_request(request).await {
        Ok(response) => response,
        Err(e) => {
            let code = e.jsonrpc_code().unwrap_or(error_codes::INTERNAL_ERROR);
            rpc::error_response(original_id, code, e.to_string())
        }
    }
}
