//! CRUD over services, lifecycle actions, and log retrieval.
//!
//! This layer owns the authoritative write path for `desired_status`:
//! user intent is persisted before the supervisor acts, and
//! supervisor-internal transitions never write the registry.

use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::registry::{DesiredStatus, ServiceDefinition, ServiceSpec};
use crate::state::AppState;
use crate::supervisor::{LogLine, ServiceStatus};

/// A definition plus, when a supervisor exists, its runtime snapshot.
#[derive(Debug, Serialize)]
pub struct ServiceView {
    #[serde(flatten)]
    pub definition: ServiceDefinition,
    pub status: Option<ServiceStatus>,
}

async fn view(state: &AppState, definition: ServiceDefinition) -> ServiceView {
    let status = match state.manager.get(&definition.id).await {
        Some(sup) => Some(sup.status()),
        None => None,
    };
    ServiceView { definition, status }
}

pub async fn list_services(
    State(state): State<AppState>,
) -> Result<Json<Vec<ServiceView>>, GatewayError> {
    let mut views = Vec::new();
    for def in state.registry.list_services()? {
        views.push(view(&state, def).await);
    }
    Ok(Json(views))
}

pub async fn create_service(
    State(state): State<AppState>,
    Json(spec): Json<ServiceSpec>,
) -> Result<Response, GatewayError> {
    let def = ServiceDefinition::from_spec(uuid::Uuid::new_v4().to_string(), spec);
    state.registry.insert_service(&def)?;
    let sup = state.manager.add(def.clone()).await?;
    info!(service = %def.id, proxy_path = %def.proxy_path, "service created");

    if def.desired_status == DesiredStatus::Running {
        if let Err(e) = sup.start().await {
            warn!(service = %def.id, "created but failed to start: {e}");
        }
    }

    let body = Json(view(&state, def).await);
    Ok((StatusCode::CREATED, body).into_response())
}

pub async fn get_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ServiceView>, GatewayError> {
    let def = state.registry.get_service(&id)?.ok_or(GatewayError::NotFound)?;
    Ok(Json(view(&state, def).await))
}

pub async fn update_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(spec): Json<ServiceSpec>,
) -> Result<Json<ServiceView>, GatewayError> {
    state.registry.get_service(&id)?.ok_or(GatewayError::NotFound)?;
    let def = ServiceDefinition::from_spec(id.clone(), spec);
    state.registry.update_service(&def)?;

    // The running child keeps its old spawn parameters until the next
    // start; request-path settings (timeout, limits, cache) apply now.
    if let Some(sup) = state.manager.get(&id).await {
        sup.update_definition(def.clone());
    }
    state.cache.invalidate_service(&id);
    info!(service = %id, "service updated");
    Ok(Json(view(&state, def).await))
}

pub async fn delete_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, GatewayError> {
    if state.manager.get(&id).await.is_some() {
        state.manager.remove(&id).await?;
    }
    if !state.registry.delete_service(&id)? {
        return Err(GatewayError::NotFound);
    }
    state.cache.invalidate_service(&id);
    info!(service = %id, "service deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn start_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ServiceStatus>, GatewayError> {
    let sup = state.manager.get(&id).await.ok_or(GatewayError::NotFound)?;
    state.registry.set_desired_status(&id, DesiredStatus::Running)?;
    sup.start().await?;
    Ok(Json(sup.status()))
}

pub async fn stop_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ServiceStatus>, GatewayError> {
    let sup = state.manager.get(&id).await.ok_or(GatewayError::NotFound)?;
    state.registry.set_desired_status(&id, DesiredStatus::Stopped)?;
    sup.stop().await?;
    Ok(Json(sup.status()))
}

pub async fn restart_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ServiceStatus>, GatewayError> {
    let sup = state.manager.get(&id).await.ok_or(GatewayError::NotFound)?;
    state.registry.set_desired_status(&id, DesiredStatus::Running)?;
    sup.restart().await?;
    Ok(Json(sup.status()))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
}

pub async fn get_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<LogLine>>, GatewayError> {
    state.registry.get_service(&id)?.ok_or(GatewayError::NotFound)?;
    let limit = query.limit.unwrap_or(100);
    Ok(Json(state.logs().tail(&id, limit)))
}

/// Server-push stream of log lines as they are captured.
pub async fn stream_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, GatewayError> {
    state.registry.get_service(&id)?.ok_or(GatewayError::NotFound)?;
    let mut rx = state.logs().subscribe(&id);
    Ok(ws.on_upgrade(move |socket| async move {
        let (mut sink, mut stream) = socket.split();
        loop {
            tokio::select! {
                line = rx.recv() => match line {
                    Ok(line) => {
                        let Ok(text) = serde_json::to_string(&line) else { continue };
                        if futures::SinkExt::send(&mut sink, Message::Text(text.into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                frame = stream.next() => match frame {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                },
            }
        }
    }))
}
