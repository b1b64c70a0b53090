use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::LinkError;
use crate::fleet::link::TelemetryLink;
use crate::fleet::registry::DroneRegistry;
use crate::geo::GeoPoint;
use crate::models::drone::{Drone, CRITICAL_BATTERY};
use crate::models::event::{ConnectionState, FleetEvent, TelemetryFrame};
use crate::models::path::Obstacle;
use crate::observability::metrics::Metrics;
use crate::planner::FlightPlanner;

/// Receives every frame of one drone. Errors are logged and do not stop the
/// connection.
pub trait TelemetrySubscriber: Send + Sync {
    fn on_frame(&self, frame: &TelemetryFrame) -> Result<(), String>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum SafetyAlertKind {
    CriticalBattery { battery: f64 },
    ObstaclesDetected { obstacles: Vec<Obstacle> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SafetyAlert {
    pub drone_id: String,
    pub position: GeoPoint,
    pub kind: SafetyAlertKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub drone_id: String,
    pub state: ConnectionState,
    pub error: Option<String>,
    pub since: DateTime<Utc>,
}

pub struct TelemetryHub {
    registry: Arc<DroneRegistry>,
    link: Arc<dyn TelemetryLink>,
    connections: DashMap<String, ConnectionInfo>,
    subscribers: DashMap<String, Vec<Arc<dyn TelemetrySubscriber>>>,
    planner: Arc<FlightPlanner>,
    battery_alerted: DashSet<String>,
    events_tx: broadcast::Sender<FleetEvent>,
    alerts_tx: mpsc::UnboundedSender<SafetyAlert>,
    reconnect_delay: Duration,
    metrics: Metrics,
}

impl TelemetryHub {
    pub fn new(
        registry: Arc<DroneRegistry>,
        link: Arc<dyn TelemetryLink>,
        planner: Arc<FlightPlanner>,
        events_tx: broadcast::Sender<FleetEvent>,
        alerts_tx: mpsc::UnboundedSender<SafetyAlert>,
        reconnect_delay: Duration,
        metrics: Metrics,
    ) -> Self {
        Self {
            registry,
            link,
            connections: DashMap::new(),
            subscribers: DashMap::new(),
            planner,
            battery_alerted: DashSet::new(),
            events_tx,
            alerts_tx,
            reconnect_delay,
            metrics,
        }
    }

    pub fn subscribe(&self, drone_id: &str, subscriber: Arc<dyn TelemetrySubscriber>) {
        self.subscribers
            .entry(drone_id.to_string())
            .or_default()
            .push(subscriber);
    }

    pub fn connection(&self, drone_id: &str) -> Option<ConnectionInfo> {
        self.connections.get(drone_id).map(|entry| entry.value().clone())
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut all: Vec<ConnectionInfo> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| a.drone_id.cmp(&b.drone_id));
        all
    }

    /// Starts a connection task for `drone_id` unless one is already tracked.
    /// Returns whether a new task was spawned.
    pub fn ensure_connected(self: &Arc<Self>, drone_id: &str) -> bool {
        match self.connections.entry(drone_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(ConnectionInfo {
                    drone_id: drone_id.to_string(),
                    state: ConnectionState::Connecting,
                    error: None,
                    since: Utc::now(),
                });
                self.metrics
                    .telemetry_connections
                    .with_label_values(&[ConnectionState::Connecting.as_str()])
                    .inc();

                let hub = self.clone();
                let drone_id = drone_id.to_string();
                tokio::spawn(async move { hub.run_connection(drone_id).await });
                true
            }
        }
    }

    /// Clears an `ERROR` connection and starts over. Other states are left alone.
    pub fn reset_connection(self: &Arc<Self>, drone_id: &str) -> bool {
        let removed = self
            .connections
            .remove_if(drone_id, |_, info| info.state == ConnectionState::Error);

        match removed {
            Some(_) => {
                self.metrics
                    .telemetry_connections
                    .with_label_values(&[ConnectionState::Error.as_str()])
                    .dec();
                info!(drone_id = %drone_id, "telemetry connection reset");
                self.ensure_connected(drone_id)
            }
            None => false,
        }
    }

    /// Registers drones found in the store and connects every untracked one.
    pub async fn discover(self: &Arc<Self>) -> usize {
        match self.registry.sync_from_store().await {
            Ok(loaded) if !loaded.is_empty() => {
                info!(count = loaded.len(), "discovered drones from store");
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "drone discovery could not read the store"),
        }

        self.registry
            .ids()
            .iter()
            .filter(|id| self.ensure_connected(id))
            .count()
    }

    async fn run_connection(self: Arc<Self>, drone_id: String) {
        loop {
            self.transition(&drone_id, ConnectionState::Connecting, None);

            let mut frames = match self.link.connect(&drone_id).await {
                Ok(frames) => frames,
                Err(err) => {
                    error!(drone_id = %drone_id, error = %err, "telemetry connection failed");
                    self.transition(&drone_id, ConnectionState::Error, Some(err.to_string()));
                    return;
                }
            };

            self.transition(&drone_id, ConnectionState::Connected, None);
            info!(drone_id = %drone_id, "telemetry connected");

            let outcome: Result<(), LinkError> = loop {
                match frames.next().await {
                    Some(Ok(frame)) => self.handle_frame(&drone_id, frame).await,
                    Some(Err(LinkError::Malformed(reason))) => {
                        warn!(drone_id = %drone_id, reason = %reason, "dropping malformed telemetry frame");
                    }
                    Some(Err(err)) => break Err(err),
                    None => break Ok(()),
                }
            };

            match outcome {
                Ok(()) => {
                    warn!(
                        drone_id = %drone_id,
                        delay_secs = self.reconnect_delay.as_secs_f64(),
                        "telemetry stream closed; reconnecting"
                    );
                    self.transition(&drone_id, ConnectionState::Disconnected, None);
                    sleep(self.reconnect_delay).await;
                    if !self.connections.contains_key(&drone_id) {
                        return;
                    }
                }
                Err(err) => {
                    error!(drone_id = %drone_id, error = %err, "telemetry stream failed");
                    self.transition(&drone_id, ConnectionState::Error, Some(err.to_string()));
                    return;
                }
            }
        }
    }

    async fn handle_frame(&self, drone_id: &str, frame: TelemetryFrame) {
        if frame.drone_id != drone_id {
            warn!(
                drone_id = %drone_id,
                frame_drone_id = %frame.drone_id,
                "ignoring telemetry frame for another drone"
            );
            return;
        }

        let drone = match self.registry.apply_telemetry(&frame).await {
            Ok(drone) => drone,
            Err(err) => {
                warn!(drone_id = %drone_id, error = %err, "failed to persist telemetry");
                self.registry.get(drone_id)
            }
        };

        let _ = self.events_tx.send(FleetEvent::Telemetry {
            frame: frame.clone(),
        });

        let subscribers = self
            .subscribers
            .get(drone_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        for subscriber in subscribers {
            if let Err(err) = subscriber.on_frame(&frame) {
                warn!(drone_id = %drone_id, error = %err, "telemetry subscriber failed");
            }
        }

        if let Some(drone) = drone {
            self.raise_alerts(&drone, &frame);
        }
    }

    fn raise_alerts(&self, drone: &Drone, frame: &TelemetryFrame) {
        let position = drone.location.point();
        let airborne = frame.in_air || drone.status.is_airborne();

        if drone.battery < CRITICAL_BATTERY && airborne && !drone.status.is_sink() {
            if self.battery_alerted.insert(drone.id.clone()) {
                warn!(drone_id = %drone.id, battery = drone.battery, "critical battery in flight");
                self.alert(SafetyAlert {
                    drone_id: drone.id.clone(),
                    position,
                    kind: SafetyAlertKind::CriticalBattery {
                        battery: drone.battery,
                    },
                });
            }
        } else if drone.battery >= CRITICAL_BATTERY {
            self.battery_alerted.remove(&drone.id);
        }

        if frame.obstacles.is_empty() {
            return;
        }

        let fresh = self.planner.note_obstacles(&drone.id, &frame.obstacles);
        if !fresh.is_empty() {
            debug!(drone_id = %drone.id, count = fresh.len(), "new obstacles sensed");
            self.alert(SafetyAlert {
                drone_id: drone.id.clone(),
                position,
                kind: SafetyAlertKind::ObstaclesDetected { obstacles: fresh },
            });
        }
    }

    fn alert(&self, alert: SafetyAlert) {
        if self.alerts_tx.send(alert).is_err() {
            warn!("safety alert dropped: monitor is not running");
        }
    }

    fn transition(&self, drone_id: &str, state: ConnectionState, error: Option<String>) {
        let previous = {
            let Some(mut info) = self.connections.get_mut(drone_id) else {
                return;
            };
            let previous = info.state;
            info.state = state;
            info.error = error.clone();
            info.since = Utc::now();
            previous
        };

        if previous != state {
            self.metrics
                .telemetry_connections
                .with_label_values(&[previous.as_str()])
                .dec();
            self.metrics
                .telemetry_connections
                .with_label_values(&[state.as_str()])
                .inc();
        }

        debug!(drone_id = %drone_id, state = state.as_str(), "telemetry connection state");
        let _ = self.events_tx.send(FleetEvent::Connection {
            drone_id: drone_id.to_string(),
            state,
            error,
        });
    }
}

pub async fn run_discovery_loop(hub: Arc<TelemetryHub>, every: Duration) {
    info!(interval_secs = every.as_secs(), "drone discovery started");

    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let started = hub.discover().await;
        if started > 0 {
            info!(started, "telemetry connections opened");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::fleet::link::SimulatedLink;
    use crate::models::drone::DroneStatus;
    use crate::store::MemoryStore;

    struct Harness {
        hub: Arc<TelemetryHub>,
        link: Arc<SimulatedLink>,
        registry: Arc<DroneRegistry>,
        alerts: mpsc::UnboundedReceiver<SafetyAlert>,
    }

    async fn harness(drones: &[&str]) -> Harness {
        let registry = Arc::new(DroneRegistry::new(Arc::new(MemoryStore::new()), Metrics::new()));
        for id in drones {
            registry
                .register(Drone::new(*id, GeoPoint::new(0.0, 0.0)))
                .await
                .unwrap();
        }
        let link = Arc::new(SimulatedLink::new());
        let (events_tx, _) = broadcast::channel(64);
        let (alerts_tx, alerts) = mpsc::unbounded_channel();
        let hub = Arc::new(TelemetryHub::new(
            registry.clone(),
            link.clone(),
            Arc::new(FlightPlanner::new(Metrics::new())),
            events_tx,
            alerts_tx,
            Duration::from_secs(3),
            Metrics::new(),
        ));
        Harness {
            hub,
            link,
            registry,
            alerts,
        }
    }

    fn frame(drone_id: &str, battery: f64) -> TelemetryFrame {
        TelemetryFrame {
            drone_id: drone_id.to_string(),
            lat: 0.001,
            lng: 0.002,
            alt: 60.0,
            battery,
            heading: 10.0,
            speed: 8.0,
            armed: true,
            in_air: true,
            obstacles: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    async fn wait_for_state(hub: &TelemetryHub, drone_id: &str, state: ConnectionState) {
        for _ in 0..200 {
            if hub.connection(drone_id).map(|info| info.state) == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{drone_id} never reached {state:?}");
    }

    struct Recorder(Mutex<Vec<f64>>);

    impl TelemetrySubscriber for Recorder {
        fn on_frame(&self, frame: &TelemetryFrame) -> Result<(), String> {
            self.0.lock().unwrap().push(frame.battery);
            Ok(())
        }
    }

    struct Broken;

    impl TelemetrySubscriber for Broken {
        fn on_frame(&self, _frame: &TelemetryFrame) -> Result<(), String> {
            Err("subscriber exploded".to_string())
        }
    }

    #[tokio::test]
    async fn ensure_connected_is_idempotent() {
        let h = harness(&["d1"]).await;

        assert!(h.hub.ensure_connected("d1"));
        assert!(!h.hub.ensure_connected("d1"));
        wait_for_state(&h.hub, "d1", ConnectionState::Connected).await;
        assert_eq!(h.hub.discover().await, 0);
        assert_eq!(h.link.connect_count("d1"), 1);
    }

    #[tokio::test]
    async fn frames_update_projection_and_reach_subscribers() {
        let h = harness(&["d1"]).await;
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        h.hub.subscribe("d1", Arc::new(Broken));
        h.hub.subscribe("d1", recorder.clone());
        h.hub.ensure_connected("d1");
        wait_for_state(&h.hub, "d1", ConnectionState::Connected).await;

        h.link.push_frame(frame("d1", 64.0));
        h.link.push_frame(frame("d1", 63.0));
        settle().await;

        assert_eq!(*recorder.0.lock().unwrap(), vec![64.0, 63.0]);
        let drone = h.registry.get("d1").unwrap();
        assert_eq!(drone.battery, 63.0);
        assert_eq!(drone.location.altitude, 60.0);
        assert_eq!(h.hub.connection("d1").unwrap().state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn transport_error_isolated_to_one_drone() {
        let h = harness(&["d1", "d2"]).await;
        assert_eq!(h.hub.discover().await, 2);
        wait_for_state(&h.hub, "d1", ConnectionState::Connected).await;
        wait_for_state(&h.hub, "d2", ConnectionState::Connected).await;

        h.link.break_stream("d2", "socket reset");
        wait_for_state(&h.hub, "d2", ConnectionState::Error).await;

        h.link.push_frame(frame("d1", 77.0));
        settle().await;
        assert_eq!(h.registry.get("d1").unwrap().battery, 77.0);
        assert_eq!(h.hub.connection("d1").unwrap().state, ConnectionState::Connected);
        assert!(h.hub.connection("d2").unwrap().error.unwrap().contains("socket reset"));

        assert!(!h.hub.ensure_connected("d2"));
        assert!(h.hub.reset_connection("d2"));
        wait_for_state(&h.hub, "d2", ConnectionState::Connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn closed_stream_reconnects_after_delay() {
        let h = harness(&["d1"]).await;
        h.hub.ensure_connected("d1");
        wait_for_state(&h.hub, "d1", ConnectionState::Connected).await;

        h.link.close("d1");
        wait_for_state(&h.hub, "d1", ConnectionState::Disconnected).await;
        assert_eq!(h.link.connect_count("d1"), 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        wait_for_state(&h.hub, "d1", ConnectionState::Connected).await;
        assert_eq!(h.link.connect_count("d1"), 2);
    }

    #[tokio::test]
    async fn handshake_failure_is_reported_as_error() {
        let h = harness(&["d1"]).await;
        h.link.fail_connects("d1", 1);

        h.hub.ensure_connected("d1");
        wait_for_state(&h.hub, "d1", ConnectionState::Error).await;
        assert_eq!(h.link.connect_count("d1"), 1);
    }

    #[tokio::test]
    async fn critical_battery_and_new_obstacles_raise_alerts_once() {
        let mut h = harness(&["d1"]).await;
        h.registry
            .update("d1", |drone| drone.status = DroneStatus::InFlight)
            .await
            .unwrap();
        h.hub.ensure_connected("d1");
        wait_for_state(&h.hub, "d1", ConnectionState::Connected).await;

        let obstacle = Obstacle {
            lat: 0.002,
            lng: 0.002,
            radius: 15.0,
        };
        let mut sensed = frame("d1", 8.0);
        sensed.obstacles = vec![obstacle];
        h.link.push_frame(sensed.clone());
        h.link.push_frame(sensed);
        settle().await;

        let first = h.alerts.try_recv().unwrap();
        assert!(matches!(first.kind, SafetyAlertKind::CriticalBattery { .. }));
        let second = h.alerts.try_recv().unwrap();
        assert_eq!(
            second.kind,
            SafetyAlertKind::ObstaclesDetected {
                obstacles: vec![obstacle]
            }
        );
        assert!(h.alerts.try_recv().is_err());
    }
}
