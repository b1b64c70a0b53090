pub mod commands;
pub mod deliveries;
pub mod drones;
pub mod planner;
pub mod ws;

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use axum::Router;
use serde::Serialize;
use tower_http::cors::CorsLayer;

use crate::models::event::ConnectionState;
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(commands::router())
        .merge(drones::router())
        .merge(deliveries::router())
        .merge(planner::router())
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    drones: usize,
    connected_drones: usize,
    queue_length: usize,
    active_commands: usize,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let queue = state.dispatcher.get_queue_status();
    let connected_drones = state
        .hub
        .connections()
        .iter()
        .filter(|info| info.state == ConnectionState::Connected)
        .count();

    Json(HealthResponse {
        status: "ok",
        drones: state.registry.len(),
        connected_drones,
        queue_length: queue.queue_length,
        active_commands: queue.active_commands,
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err).into_response(),
    }
}
