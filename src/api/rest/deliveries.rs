use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::post;
use axum::Json;
use axum::Router;
use serde::Deserialize;

use crate::engine::dispatch::CancellationReceipt;
use crate::error::AppError;
use crate::geo::GeoPoint;
use crate::models::delivery::{DeliveryToken, VerificationReceipt, VerificationRequest};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/deliveries/verify", post(verify_delivery))
        .route("/deliveries/:order_id/token", post(issue_token))
        .route("/deliveries/:order_id/cancel", post(cancel_delivery))
}

#[derive(Deserialize)]
pub struct IssueTokenRequest {
    pub drone_id: String,
    pub delivery_location: GeoPoint,
    pub recipient_phone: String,
}

#[derive(Deserialize)]
pub struct VerifyDeliveryRequest {
    pub token: String,
    pub current_location: GeoPoint,
    pub recipient_phone: String,
    pub drone_id: Option<String>,
}

async fn issue_token(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<String>,
    Json(payload): Json<IssueTokenRequest>,
) -> Result<Json<DeliveryToken>, AppError> {
    if payload.recipient_phone.trim().is_empty() {
        return Err(AppError::BadRequest("recipient_phone cannot be empty".to_string()));
    }

    let token = state
        .verifier
        .issue(
            &order_id,
            &payload.drone_id,
            payload.delivery_location,
            &payload.recipient_phone,
        )
        .await?;
    Ok(Json(token))
}

async fn verify_delivery(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<VerifyDeliveryRequest>,
) -> Result<Json<VerificationReceipt>, AppError> {
    let request = VerificationRequest {
        current_location: payload.current_location,
        recipient_phone: payload.recipient_phone,
    };
    let receipt = state
        .verifier
        .verify(&payload.token, payload.drone_id.as_deref(), &request)
        .await?;
    Ok(Json(receipt))
}

async fn cancel_delivery(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<String>,
) -> Result<Json<CancellationReceipt>, AppError> {
    Ok(Json(state.dispatcher.cancel_delivery(&order_id).await?))
}
