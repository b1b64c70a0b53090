use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::dispatch::DEFAULT_HISTORY_QUERY_LIMIT;
use crate::error::{AppError, DispatchError};
use crate::models::command::{Command, CommandRequest, QueueStatus, SubmitReceipt};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/commands", post(submit_command))
        .route("/commands/active", get(active_commands))
        .route("/commands/history", get(command_history))
        .route("/commands/queue", get(queue_status))
        .route("/commands/:id", get(get_command).delete(cancel_command))
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub drone_id: Option<String>,
    pub limit: Option<usize>,
}

async fn submit_command(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CommandRequest>,
) -> Result<(StatusCode, Json<SubmitReceipt>), AppError> {
    let receipt = state.dispatcher.submit(payload)?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

async fn get_command(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Command>, AppError> {
    state
        .dispatcher
        .get_command(id)
        .map(Json)
        .ok_or_else(|| DispatchError::UnknownCommand(id.to_string()).into())
}

async fn cancel_command(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Command>, AppError> {
    Ok(Json(state.dispatcher.cancel(id)?))
}

async fn active_commands(State(state): State<Arc<AppState>>) -> Json<Vec<Command>> {
    Json(state.dispatcher.get_active_commands())
}

async fn command_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Json<Vec<Command>> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_QUERY_LIMIT);
    Json(
        state
            .dispatcher
            .get_command_history(query.drone_id.as_deref(), limit),
    )
}

async fn queue_status(State(state): State<Arc<AppState>>) -> Json<QueueStatus> {
    Json(state.dispatcher.get_queue_status())
}
