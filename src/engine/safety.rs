use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::engine::dispatch::Dispatcher;
use crate::error::PlanningError;
use crate::fleet::hub::{SafetyAlert, SafetyAlertKind};
use crate::models::command::{CommandParams, CommandType};
use crate::models::event::FleetEvent;

pub async fn run_safety_monitor(
    dispatcher: Arc<Dispatcher>,
    mut alerts: mpsc::UnboundedReceiver<SafetyAlert>,
) {
    info!("safety monitor started");

    while let Some(alert) = alerts.recv().await {
        handle_alert(&dispatcher, alert).await;
    }

    warn!("safety monitor stopped: alert channel closed");
}

pub async fn handle_alert(dispatcher: &Dispatcher, alert: SafetyAlert) {
    match alert.kind {
        SafetyAlertKind::CriticalBattery { battery } => {
            let reason = format!("critical battery {battery:.0}%");
            if let Err(err) = dispatcher.force_emergency_land(&alert.drone_id, &reason) {
                error!(drone_id = %alert.drone_id, error = %err, "emergency landing not queued");
            }
        }
        SafetyAlertKind::ObstaclesDetected { obstacles } => {
            let ctx = dispatcher.context();
            let weather = match ctx.gate.current_conditions(alert.position).await {
                Ok(weather) => weather,
                Err(err) => {
                    warn!(drone_id = %alert.drone_id, error = %err, "no weather for replanning");
                    return;
                }
            };

            match ctx
                .planner
                .replan_for(&alert.drone_id, alert.position, &obstacles, &weather)
                .await
            {
                Ok(Some(path)) => {
                    let params = CommandParams {
                        flight_plan: Some(path.waypoints.clone()),
                        ..CommandParams::default()
                    };
                    if let Err(err) = ctx
                        .transport
                        .send(&alert.drone_id, CommandType::UpdateFlightPlan, &params)
                        .await
                    {
                        error!(drone_id = %alert.drone_id, error = %err, "replanned path not delivered to drone");
                        return;
                    }

                    let _ = ctx.events_tx.send(FleetEvent::PathUpdated {
                        drone_id: alert.drone_id.clone(),
                        waypoints: path.waypoints.len(),
                        avoidance: path.avoidance,
                    });
                }
                Ok(None) => {
                    debug!(drone_id = %alert.drone_id, "active path unaffected by sensed obstacles");
                }
                Err(PlanningError::UnsafeWeather(reason)) => {
                    let reason = format!("weather unsafe during replanning: {reason}");
                    if let Err(err) = dispatcher.force_emergency_land(&alert.drone_id, &reason) {
                        error!(drone_id = %alert.drone_id, error = %err, "emergency landing not queued");
                    }
                }
                Err(err) => {
                    warn!(drone_id = %alert.drone_id, error = %err, "replanning failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use tokio::time::timeout;

    use super::*;
    use crate::config::Config;
    use crate::fleet::link::SimulatedLink;
    use crate::gate::weather::StaticWeather;
    use crate::geo::GeoPoint;
    use crate::models::command::CommandRequest;
    use crate::models::drone::Drone;
    use crate::models::event::TelemetryFrame;
    use crate::models::path::Obstacle;
    use crate::planner::path::path_clears;
    use crate::state::{AppState, Collaborators, Receivers};

    const DESTINATION: GeoPoint = GeoPoint { lat: 0.0, lng: 0.02 };

    async fn fleet() -> (AppState, Receivers, Arc<SimulatedLink>) {
        let link = Arc::new(SimulatedLink::new());
        let weather = Arc::new(StaticWeather::calm());
        let (state, receivers) =
            AppState::new(Config::default(), Collaborators::simulated(link.clone(), weather));

        state
            .registry
            .register(Drone::new("d1", GeoPoint::new(0.0, 0.0)))
            .await
            .unwrap();
        state.hub.ensure_connected("d1");
        for _ in 0..200 {
            if link.is_streaming("d1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(link.is_streaming("d1"));

        (state, receivers, link)
    }

    fn frame_at(point: GeoPoint, in_air: bool, obstacles: Vec<Obstacle>) -> TelemetryFrame {
        TelemetryFrame {
            drone_id: "d1".to_string(),
            lat: point.lat,
            lng: point.lng,
            alt: if in_air { 60.0 } else { 0.0 },
            battery: 80.0,
            heading: 90.0,
            speed: if in_air { 12.0 } else { 0.0 },
            armed: in_air,
            in_air,
            obstacles,
            timestamp: Utc::now(),
        }
    }

    async fn next_alert(receivers: &mut Receivers) -> SafetyAlert {
        timeout(Duration::from_secs(1), receivers.alerts.recv())
            .await
            .expect("no safety alert raised")
            .expect("alert channel closed")
    }

    async fn goto(state: &AppState) {
        state
            .dispatcher
            .submit(CommandRequest {
                drone_id: "d1".to_string(),
                command_type: "GOTO".to_string(),
                params: CommandParams {
                    destination: Some(DESTINATION),
                    ..CommandParams::default()
                },
            })
            .unwrap();
        state.dispatcher.process_queue().await;
    }

    #[tokio::test]
    async fn obstacle_sensed_on_the_ground_shapes_the_next_route() {
        let (state, mut receivers, link) = fleet().await;
        let tower = Obstacle {
            lat: 0.0,
            lng: 0.01,
            radius: 40.0,
        };

        link.push_frame(frame_at(GeoPoint::new(0.0, 0.0), false, vec![tower]));
        let alert = next_alert(&mut receivers).await;
        handle_alert(&state.dispatcher, alert).await;
        assert!(state.planner.active_path("d1").await.is_none());

        goto(&state).await;

        let path = state.planner.active_path("d1").await.unwrap();
        assert!(path.obstacles.contains(&tower));
        assert!(path_clears(&path.waypoints, &[tower]));

        let sent = link.sent_to("d1");
        let flown = sent.last().unwrap();
        assert_eq!(flown.command_type, CommandType::Goto);
        assert_eq!(flown.params.flight_plan.as_ref(), Some(&path.waypoints));
    }

    #[tokio::test]
    async fn obstacle_ahead_in_flight_is_replanned_and_sent_to_the_drone() {
        let (state, mut receivers, link) = fleet().await;
        goto(&state).await;
        let original = state.planner.active_path("d1").await.unwrap();
        let mut events = state.events_tx.subscribe();

        let ahead = Obstacle {
            lat: original.waypoints[15].lat,
            lng: original.waypoints[15].lng,
            radius: 30.0,
        };
        link.push_frame(frame_at(original.waypoints[5].point(), true, vec![ahead]));
        let alert = next_alert(&mut receivers).await;
        handle_alert(&state.dispatcher, alert).await;

        let replanned = state.planner.active_path("d1").await.unwrap();
        assert_ne!(replanned.waypoints, original.waypoints);
        assert!(path_clears(&replanned.waypoints[5..], &[ahead]));

        let sent = link.sent_to("d1");
        let update = sent.last().unwrap();
        assert_eq!(update.command_type, CommandType::UpdateFlightPlan);
        assert_eq!(update.params.flight_plan.as_ref(), Some(&replanned.waypoints));

        let announced = loop {
            match events.try_recv() {
                Ok(FleetEvent::PathUpdated { waypoints, .. }) => break waypoints,
                Ok(_) => continue,
                Err(err) => panic!("no path update published: {err:?}"),
            }
        };
        assert_eq!(announced, replanned.waypoints.len());
    }

    #[tokio::test]
    async fn obstacle_off_the_route_sends_nothing() {
        let (state, mut receivers, link) = fleet().await;
        goto(&state).await;
        let original = state.planner.active_path("d1").await.unwrap();
        let sent_before = link.sent_to("d1").len();

        let far = Obstacle {
            lat: 0.01,
            lng: 0.01,
            radius: 20.0,
        };
        link.push_frame(frame_at(original.waypoints[5].point(), true, vec![far]));
        let alert = next_alert(&mut receivers).await;
        handle_alert(&state.dispatcher, alert).await;

        assert_eq!(link.sent_to("d1").len(), sent_before);
        let current = state.planner.active_path("d1").await.unwrap();
        assert_eq!(current.waypoints, original.waypoints);
    }
}
