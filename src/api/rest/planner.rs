use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::geo::GeoPoint;
use crate::models::path::{FlightPath, Obstacle};
use crate::models::weather::WeatherConditions;
use crate::planner::{eta_seconds, plan, NOMINAL_AIRSPEED_MS};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/planner/plan", post(plan_route))
}

#[derive(Deserialize)]
pub struct PlanRequest {
    pub start: GeoPoint,
    pub end: GeoPoint,
    #[serde(default)]
    pub obstacles: Vec<Obstacle>,
    pub weather: Option<WeatherConditions>,
}

#[derive(Serialize)]
pub struct PlanResponse {
    pub path: FlightPath,
    pub eta_seconds: f64,
}

async fn plan_route(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<PlanRequest>,
) -> Result<Json<PlanResponse>, AppError> {
    let weather = match payload.weather {
        Some(weather) => weather,
        None => state
            .gate
            .current_conditions(payload.start)
            .await
            .map_err(|err| AppError::Internal(err.to_string()))?,
    };

    let path = plan(payload.start, payload.end, &payload.obstacles, &weather)?;
    if path.avoidance == crate::models::path::Avoidance::Fallback {
        state.metrics.planning_fallbacks_total.inc();
    }

    Ok(Json(PlanResponse {
        eta_seconds: eta_seconds(&path.waypoints, NOMINAL_AIRSPEED_MS),
        path,
    }))
}
