//! Authenticated management surface: service CRUD, lifecycle, logs.

pub mod auth;
pub mod routes;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

/// Build the `/api` router. Every route requires an active API key.
pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route(
            "/services",
            get(routes::list_services).post(routes::create_service),
        )
        .route(
            "/services/{id}",
            get(routes::get_service)
                .put(routes::update_service)
                .delete(routes::delete_service),
        )
        .route("/services/{id}/start", post(routes::start_service))
        .route("/services/{id}/stop", post(routes::stop_service))
        .route("/services/{id}/restart", post(routes::restart_service))
        .route("/services/{id}/logs", get(routes::get_logs))
        .route("/services/{id}/logs/stream", get(routes::stream_logs))
        .route_layer(middleware::from_fn_with_state(
            state,
            auth::require_api_key,
        ))
}
