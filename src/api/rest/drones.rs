use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{delete, get, post};
use axum::Json;
use axum::Router;
use serde::Deserialize;

use crate::error::AppError;
use crate::fleet::hub::ConnectionInfo;
use crate::geo::GeoPoint;
use crate::models::drone::{Drone, DroneStatus};
use crate::notify::EmergencyContact;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/drones", post(register_drone).get(list_drones))
        .route("/drones/:id", get(get_drone))
        .route("/drones/:id/connection", get(get_connection))
        .route("/drones/:id/connection/reset", post(reset_connection))
        .route("/drones/:id/emergency-contacts", post(add_emergency_contact))
        .route(
            "/drones/:id/emergency-contacts/:name",
            delete(remove_emergency_contact),
        )
}

#[derive(Deserialize)]
pub struct RegisterDroneRequest {
    pub id: String,
    pub base_location: GeoPoint,
    pub battery: Option<f64>,
    pub status: Option<DroneStatus>,
    pub max_payload_kg: Option<f64>,
    pub max_range_m: Option<f64>,
}

async fn register_drone(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RegisterDroneRequest>,
) -> Result<Json<Drone>, AppError> {
    let id = payload.id.trim();
    if id.is_empty() {
        return Err(AppError::BadRequest("id cannot be empty".to_string()));
    }
    if state.registry.contains(id) {
        return Err(AppError::Conflict(format!("drone {id} already registered")));
    }

    let mut drone = Drone::new(id, payload.base_location);
    if let Some(battery) = payload.battery {
        drone.set_battery(battery);
    }
    if let Some(status) = payload.status {
        drone.status = status;
    }
    if let Some(max_payload_kg) = payload.max_payload_kg {
        drone.max_payload_kg = max_payload_kg.max(0.0);
    }
    if let Some(max_range_m) = payload.max_range_m {
        drone.max_range_m = max_range_m.max(0.0);
    }

    let drone = state.registry.register(drone).await?;
    state.hub.ensure_connected(&drone.id);

    Ok(Json(drone))
}

async fn list_drones(State(state): State<Arc<AppState>>) -> Json<Vec<Drone>> {
    Json(state.registry.list())
}

async fn get_drone(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Drone>, AppError> {
    state
        .registry
        .get(&id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("drone {id} not found")))
}

async fn get_connection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ConnectionInfo>, AppError> {
    state
        .hub
        .connection(&id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("no telemetry connection for drone {id}")))
}

async fn reset_connection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ConnectionInfo>, AppError> {
    if !state.hub.reset_connection(&id) {
        return Err(AppError::Conflict(format!(
            "telemetry connection for drone {id} is not in an error state"
        )));
    }
    state
        .hub
        .connection(&id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("no telemetry connection for drone {id}")))
}

async fn add_emergency_contact(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(contact): Json<EmergencyContact>,
) -> Result<Json<Vec<EmergencyContact>>, AppError> {
    if contact.name.trim().is_empty() {
        return Err(AppError::BadRequest("contact name cannot be empty".to_string()));
    }
    if contact.phone.is_none() && contact.email.is_none() {
        return Err(AppError::BadRequest(
            "contact needs a phone number or an email".to_string(),
        ));
    }
    if !state.registry.contains(&id) {
        return Err(AppError::NotFound(format!("drone {id} not found")));
    }

    Ok(Json(state.dispatcher.add_emergency_contact(&id, contact)?))
}

async fn remove_emergency_contact(
    State(state): State<Arc<AppState>>,
    Path((id, name)): Path<(String, String)>,
) -> Result<Json<Vec<EmergencyContact>>, AppError> {
    if !state.dispatcher.remove_emergency_contact(&id, &name) {
        return Err(AppError::NotFound(format!(
            "no emergency contact {name} for drone {id}"
        )));
    }
    Ok(Json(state.notifier.contacts(&id)))
}
