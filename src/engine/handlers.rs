use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::error::HandlerError;
use crate::fleet::link::CommandTransport;
use crate::fleet::registry::DroneRegistry;
use crate::gate::FlightGate;
use crate::geo::{haversine_m, translate, GeoPoint, Vector2};
use crate::models::command::{Command, CommandParams, CommandType};
use crate::models::delivery::{DeliveryOrder, OrderStatus, VerificationRequest};
use crate::models::drone::{Drone, DroneStatus, LandingZone, SafetyRating};
use crate::models::event::FleetEvent;
use crate::models::path::FlightPath;
use crate::notify::{EmergencyNotice, EmergencyNotifier};
use crate::planner::path::MAX_ALTITUDE_M;
use crate::planner::{eta_seconds, simplify, FlightPlanner, NOMINAL_AIRSPEED_MS};
use crate::verification::DeliveryVerifier;

pub const TAKEOFF_MIN_BATTERY: f64 = 30.0;
pub const DEFAULT_TAKEOFF_ALTITUDE_M: f64 = 50.0;
pub const BATTERY_PCT_PER_KM: f64 = 5.0;
const BATTERY_RESERVE_FACTOR: f64 = 1.2;
const LANDING_ZONE_OFFSET_M: f64 = 100.0;
const DISPLAY_WAYPOINTS: usize = 20;

/// Everything a command handler may touch.
#[derive(Clone)]
pub struct HandlerContext {
    pub registry: Arc<DroneRegistry>,
    pub gate: Arc<FlightGate>,
    pub planner: Arc<FlightPlanner>,
    pub verifier: Arc<DeliveryVerifier>,
    pub transport: Arc<dyn CommandTransport>,
    pub notifier: Arc<EmergencyNotifier>,
    pub events_tx: broadcast::Sender<FleetEvent>,
}

#[derive(Debug, Clone)]
pub struct Handled {
    pub result: Value,
    /// Set when the outcome demands an emergency landing.
    pub escalate: Option<String>,
}

impl Handled {
    fn done(result: Value) -> Self {
        Self {
            result,
            escalate: None,
        }
    }
}

pub async fn execute(ctx: &HandlerContext, command: &Command) -> Result<Handled, HandlerError> {
    let drone = ctx
        .registry
        .get(&command.drone_id)
        .ok_or_else(|| HandlerError::Transient(format!("drone {} not found", command.drone_id)))?;

    match command.command_type {
        CommandType::Takeoff => takeoff(ctx, &drone, &command.params).await,
        CommandType::Land => land(ctx, &drone, &command.params).await,
        CommandType::Goto => goto(ctx, &drone, &command.params).await,
        CommandType::ReturnToBase => return_to_base(ctx, &drone, &command.params).await,
        CommandType::Hover => hover(ctx, &drone, &command.params).await,
        CommandType::EmergencyLand => emergency_land(ctx, &drone, &command.params).await,
        CommandType::UpdateFlightPlan => update_flight_plan(ctx, &drone, &command.params).await,
        CommandType::ScanQrCode => scan_qr_code(ctx, &drone, &command.params).await,
        CommandType::DeliverPackage => deliver_package(ctx, &drone, &command.params).await,
        CommandType::MonitorWeather => monitor_weather(ctx, &drone).await,
    }
}

async fn takeoff(
    ctx: &HandlerContext,
    drone: &Drone,
    params: &CommandParams,
) -> Result<Handled, HandlerError> {
    if drone.battery <= TAKEOFF_MIN_BATTERY {
        return Err(HandlerError::Rejected(format!(
            "pre-flight check failed: battery {:.0}% must exceed {TAKEOFF_MIN_BATTERY}%",
            drone.battery
        )));
    }

    let altitude = params.altitude.unwrap_or(DEFAULT_TAKEOFF_ALTITUDE_M);
    if !(altitude > 0.0 && altitude <= MAX_ALTITUDE_M) {
        return Err(HandlerError::Rejected(format!(
            "takeoff altitude {altitude} m outside 0-{MAX_ALTITUDE_M} m"
        )));
    }

    let ack = ctx
        .transport
        .send(&drone.id, CommandType::Takeoff, params)
        .await?;

    ctx.registry
        .update(&drone.id, |drone| {
            drone.status = DroneStatus::InFlight;
            drone.armed = true;
            drone.in_air = true;
            drone.location.altitude = altitude;
        })
        .await?;

    Ok(Handled::done(json!({
        "status": DroneStatus::InFlight,
        "altitude": altitude,
        "ack": ack,
    })))
}

async fn land(
    ctx: &HandlerContext,
    drone: &Drone,
    params: &CommandParams,
) -> Result<Handled, HandlerError> {
    let ack = ctx.transport.send(&drone.id, CommandType::Land, params).await?;

    ctx.registry
        .update(&drone.id, |drone| {
            drone.status = DroneStatus::Landed;
            drone.armed = false;
            drone.in_air = false;
            drone.location.altitude = 0.0;
            drone.location.speed = 0.0;
        })
        .await?;
    ctx.planner.discard(&drone.id).await;

    Ok(Handled::done(json!({
        "status": DroneStatus::Landed,
        "location": drone.location.point(),
        "ack": ack,
    })))
}

async fn goto(
    ctx: &HandlerContext,
    drone: &Drone,
    params: &CommandParams,
) -> Result<Handled, HandlerError> {
    let destination = params
        .destination
        .or(params.location)
        .ok_or_else(|| HandlerError::Rejected("GOTO requires a destination".to_string()))?;

    let path = route(ctx, drone, destination, params).await?;
    let ack = send_with_path(ctx, drone, CommandType::Goto, params, &path).await?;

    ctx.registry
        .update(&drone.id, |drone| {
            if drone.status != DroneStatus::Delivering {
                drone.status = DroneStatus::InFlight;
            }
            drone.in_air = true;
            drone.armed = true;
        })
        .await?;

    Ok(Handled::done(route_summary(&path, ack)))
}

async fn return_to_base(
    ctx: &HandlerContext,
    drone: &Drone,
    params: &CommandParams,
) -> Result<Handled, HandlerError> {
    let path = route(ctx, drone, drone.base_location, params).await?;
    let ack = send_with_path(ctx, drone, CommandType::ReturnToBase, params, &path).await?;

    ctx.registry
        .update(&drone.id, |drone| {
            drone.status = DroneStatus::Returning;
            drone.assignment = None;
        })
        .await?;

    Ok(Handled::done(route_summary(&path, ack)))
}

async fn hover(
    ctx: &HandlerContext,
    drone: &Drone,
    params: &CommandParams,
) -> Result<Handled, HandlerError> {
    if !(drone.in_air || drone.status.is_airborne()) {
        return Err(HandlerError::Rejected(format!(
            "drone {} is not airborne",
            drone.id
        )));
    }

    let ack = ctx.transport.send(&drone.id, CommandType::Hover, params).await?;
    ctx.registry
        .update(&drone.id, |drone| drone.location.speed = 0.0)
        .await?;

    Ok(Handled::done(json!({
        "holding": drone.location,
        "ack": ack,
    })))
}

async fn emergency_land(
    ctx: &HandlerContext,
    drone: &Drone,
    params: &CommandParams,
) -> Result<Handled, HandlerError> {
    let zone = nearest_landing_zone(drone);
    let mut outbound = params.clone();
    outbound.location = Some(zone.location);

    let ack = ctx
        .transport
        .send(&drone.id, CommandType::EmergencyLand, &outbound)
        .await?;

    let landing_zone = zone.clone();
    ctx.registry
        .update(&drone.id, move |drone| {
            drone.status = DroneStatus::Emergency;
            drone.landing_zone = Some(landing_zone);
        })
        .await?;
    ctx.planner.discard(&drone.id).await;

    let reason = params
        .emergency_type
        .clone()
        .unwrap_or_else(|| "emergency landing".to_string());
    warn!(drone_id = %drone.id, reason = %reason, "emergency landing");

    ctx.notifier.notify(EmergencyNotice {
        drone_id: drone.id.clone(),
        reason: reason.clone(),
        location: drone.location.point(),
        landing_zone: Some(zone.clone()),
        at: Utc::now(),
    });
    let _ = ctx.events_tx.send(FleetEvent::Emergency {
        drone_id: drone.id.clone(),
        reason,
    });

    Ok(Handled::done(json!({
        "status": DroneStatus::Emergency,
        "landing_zone": zone,
        "ack": ack,
    })))
}

async fn update_flight_plan(
    ctx: &HandlerContext,
    drone: &Drone,
    params: &CommandParams,
) -> Result<Handled, HandlerError> {
    let waypoints = params
        .flight_plan
        .clone()
        .ok_or_else(|| HandlerError::Rejected("UPDATE_FLIGHT_PLAN requires a flight plan".to_string()))?;

    let weather = drone.last_weather.unwrap_or_default();
    let path = ctx.planner.set_manual(&drone.id, waypoints, &weather).await?;
    let ack = ctx
        .transport
        .send(&drone.id, CommandType::UpdateFlightPlan, params)
        .await?;

    publish_path(ctx, &drone.id, &path);
    Ok(Handled::done(route_summary(&path, ack)))
}

async fn scan_qr_code(
    ctx: &HandlerContext,
    drone: &Drone,
    params: &CommandParams,
) -> Result<Handled, HandlerError> {
    let ack = ctx
        .transport
        .send(&drone.id, CommandType::ScanQrCode, params)
        .await?;

    let (Some(qr_data), Some(recipient_phone)) = (&params.qr_data, &params.recipient_phone) else {
        return Ok(Handled::done(json!({
            "scanned": true,
            "data": params.qr_data,
            "ack": ack,
        })));
    };

    let request = VerificationRequest {
        current_location: drone.location.point(),
        recipient_phone: recipient_phone.clone(),
    };
    let receipt = ctx.verifier.verify(qr_data, Some(drone.id.as_str()), &request).await?;

    ctx.registry
        .update(&drone.id, |drone| drone.assignment = None)
        .await?;

    Ok(Handled::done(json!({
        "scanned": true,
        "verified": receipt,
        "ack": ack,
    })))
}

async fn deliver_package(
    ctx: &HandlerContext,
    drone: &Drone,
    params: &CommandParams,
) -> Result<Handled, HandlerError> {
    let order_id = params
        .order_id
        .clone()
        .ok_or_else(|| HandlerError::Rejected("DELIVER_PACKAGE requires an order id".to_string()))?;
    let drop_off = params
        .delivery_location
        .or(params.destination)
        .ok_or_else(|| {
            HandlerError::Rejected("DELIVER_PACKAGE requires a delivery location".to_string())
        })?;

    check_feasibility(drone, drop_off, params)?;

    let path = route(ctx, drone, drop_off, params).await?;
    let ack = send_with_path(ctx, drone, CommandType::DeliverPackage, params, &path).await?;

    let store = ctx.registry.store();
    let mut order = store.get_order(&order_id).await?.unwrap_or_else(|| {
        DeliveryOrder::new(
            order_id.clone(),
            drop_off,
            params.recipient_phone.clone().unwrap_or_default(),
        )
    });
    order.drone_id = Some(drone.id.clone());
    order.status = OrderStatus::InTransit;
    order.delivery_location = drop_off;
    if let Some(phone) = &params.recipient_phone {
        order.recipient_phone = phone.clone();
    }
    order.updated_at = Utc::now();
    store.put_order(&order).await?;

    let assignment = order_id.clone();
    ctx.registry
        .update(&drone.id, move |drone| {
            drone.status = DroneStatus::Delivering;
            drone.assignment = Some(assignment);
            drone.in_air = true;
            drone.armed = true;
        })
        .await?;

    let token = match &params.recipient_phone {
        Some(phone) => Some(ctx.verifier.issue(&order_id, &drone.id, drop_off, phone).await?),
        None => None,
    };

    info!(drone_id = %drone.id, order_id = %order_id, "delivery dispatched");

    let mut result = route_summary(&path, ack);
    result["order_id"] = json!(order_id);
    result["token"] = json!(token);
    Ok(Handled::done(result))
}

async fn monitor_weather(ctx: &HandlerContext, drone: &Drone) -> Result<Handled, HandlerError> {
    let conditions = ctx.gate.current_conditions(drone.location.point()).await?;

    ctx.registry
        .update(&drone.id, |drone| drone.last_weather = Some(conditions))
        .await?;

    let reason = conditions.unsafe_reason();
    let airborne = drone.in_air || drone.status.is_airborne();
    let escalate = match (&reason, airborne) {
        (Some(reason), true) => Some(format!("weather turned unsafe in flight: {reason}")),
        _ => None,
    };

    Ok(Handled {
        result: json!({
            "conditions": conditions,
            "safe": reason.is_none(),
            "reason": reason,
        }),
        escalate,
    })
}

fn check_feasibility(
    drone: &Drone,
    drop_off: GeoPoint,
    params: &CommandParams,
) -> Result<(), HandlerError> {
    if let Some(package) = &params.package {
        if package.weight_kg > drone.max_payload_kg {
            return Err(HandlerError::Rejected(format!(
                "package {:.1} kg exceeds payload limit {:.1} kg",
                package.weight_kg, drone.max_payload_kg
            )));
        }
    }

    let round_trip_m = haversine_m(&drone.location.point(), &drop_off)
        + haversine_m(&drop_off, &drone.base_location);
    if round_trip_m > drone.max_range_m {
        return Err(HandlerError::Rejected(format!(
            "round trip {:.0} m exceeds range {:.0} m",
            round_trip_m, drone.max_range_m
        )));
    }

    let required = round_trip_m / 1000.0 * BATTERY_PCT_PER_KM * BATTERY_RESERVE_FACTOR;
    if drone.battery < required {
        return Err(HandlerError::Rejected(format!(
            "battery {:.0}% below the {:.0}% this delivery needs",
            drone.battery, required
        )));
    }

    Ok(())
}

/// A point `LANDING_ZONE_OFFSET_M` away from the drone, rated by how far it
/// is from the drone's base.
pub fn nearest_landing_zone(drone: &Drone) -> LandingZone {
    let here = drone.location.point();
    let offset = LANDING_ZONE_OFFSET_M / std::f64::consts::SQRT_2;
    let location = translate(
        &here,
        Vector2 {
            east: offset,
            north: offset,
        },
    );

    let from_base = haversine_m(&location, &drone.base_location);
    let safety = if from_base <= 1_000.0 {
        SafetyRating::High
    } else if from_base <= 5_000.0 {
        SafetyRating::Medium
    } else {
        SafetyRating::Low
    };

    LandingZone {
        location,
        safety,
        distance_m: haversine_m(&here, &location),
    }
}

async fn route(
    ctx: &HandlerContext,
    drone: &Drone,
    destination: GeoPoint,
    params: &CommandParams,
) -> Result<FlightPath, HandlerError> {
    let start = drone.location.point();
    let weather = ctx
        .gate
        .current_conditions(start)
        .await
        .map_err(|err| HandlerError::UnsafeWeather(format!("weather unavailable: {err}")))?;
    let path = ctx
        .planner
        .route_for(&drone.id, start, destination, &params.obstacles, &weather)
        .await?;
    publish_path(ctx, &drone.id, &path);
    Ok(path)
}

async fn send_with_path(
    ctx: &HandlerContext,
    drone: &Drone,
    command_type: CommandType,
    params: &CommandParams,
    path: &FlightPath,
) -> Result<Value, HandlerError> {
    let mut outbound = params.clone();
    outbound.flight_plan = Some(path.waypoints.clone());
    Ok(ctx.transport.send(&drone.id, command_type, &outbound).await?)
}

fn publish_path(ctx: &HandlerContext, drone_id: &str, path: &FlightPath) {
    let _ = ctx.events_tx.send(FleetEvent::PathUpdated {
        drone_id: drone_id.to_string(),
        waypoints: path.waypoints.len(),
        avoidance: path.avoidance,
    });
}

fn route_summary(path: &FlightPath, ack: Value) -> Value {
    json!({
        "distance_m": path.distance_m,
        "eta_seconds": eta_seconds(&path.waypoints, NOMINAL_AIRSPEED_MS),
        "avoidance": path.avoidance,
        "waypoints": simplify(&path.waypoints, DISPLAY_WAYPOINTS),
        "ack": ack,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn landing_zone_is_offset_and_rated() {
        let base = GeoPoint::new(52.52, 13.405);
        let drone = Drone::new("d1", base);

        let zone = nearest_landing_zone(&drone);

        assert!((zone.distance_m - LANDING_ZONE_OFFSET_M).abs() < 1.0);
        assert_eq!(zone.safety, SafetyRating::High);
    }

    #[test]
    fn feasibility_rejects_heavy_or_distant_deliveries() {
        let base = GeoPoint::new(0.0, 0.0);
        let drone = Drone::new("d1", base);

        let heavy = CommandParams {
            package: Some(crate::models::command::PackageDetails {
                weight_kg: 5.0,
                description: None,
            }),
            ..CommandParams::default()
        };
        assert!(check_feasibility(&drone, GeoPoint::new(0.0, 0.01), &heavy).is_err());

        let far = GeoPoint::new(0.0, 0.1);
        assert!(check_feasibility(&drone, far, &CommandParams::default()).is_err());

        let near = GeoPoint::new(0.0, 0.01);
        assert!(check_feasibility(&drone, near, &CommandParams::default()).is_ok());

        let mut tired = drone.clone();
        tired.battery = 5.0;
        let mid = GeoPoint::new(0.0, 0.03);
        assert!(check_feasibility(&tired, mid, &CommandParams::default()).is_err());
    }
}
