use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::error::StoreError;
use crate::models::drone::{clamp_battery, normalize_heading, Drone};
use crate::models::event::TelemetryFrame;
use crate::observability::metrics::Metrics;
use crate::store::Store;

/// In-memory projection of the fleet, written through to the store.
///
/// Mutations happen inside a single DashMap entry guard which is dropped
/// before the store write is awaited.
pub struct DroneRegistry {
    drones: DashMap<String, Drone>,
    store: Arc<dyn Store>,
    metrics: Metrics,
}

impl DroneRegistry {
    pub fn new(store: Arc<dyn Store>, metrics: Metrics) -> Self {
        Self {
            drones: DashMap::new(),
            store,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub async fn register(&self, mut drone: Drone) -> Result<Drone, StoreError> {
        drone.set_battery(drone.battery);
        drone.set_heading(drone.location.heading);
        drone.touch();

        self.store.put_drone(&drone).await?;
        self.observe_battery(&drone);
        self.drones.insert(drone.id.clone(), drone.clone());

        debug!(drone_id = %drone.id, "drone registered");
        Ok(drone)
    }

    pub fn get(&self, id: &str) -> Option<Drone> {
        self.drones.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.drones.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.drones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drones.is_empty()
    }

    pub fn list(&self) -> Vec<Drone> {
        let mut drones: Vec<Drone> = self.drones.iter().map(|entry| entry.value().clone()).collect();
        drones.sort_by(|a, b| a.id.cmp(&b.id));
        drones
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.drones.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Applies `mutate` to the projected drone and persists the result.
    pub async fn update<F, R>(&self, id: &str, mutate: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Drone) -> R,
    {
        let (output, snapshot) = {
            let mut entry = self
                .drones
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(format!("drone {id}")))?;
            let drone = entry.value_mut();
            let output = mutate(drone);
            drone.set_battery(drone.battery);
            drone.set_heading(drone.location.heading);
            drone.touch();
            (output, drone.clone())
        };

        self.store.put_drone(&snapshot).await?;
        self.observe_battery(&snapshot);
        Ok(output)
    }

    /// Folds a telemetry frame into the projection. Unknown drones are ignored.
    pub async fn apply_telemetry(&self, frame: &TelemetryFrame) -> Result<Option<Drone>, StoreError> {
        let snapshot = {
            let Some(mut entry) = self.drones.get_mut(&frame.drone_id) else {
                return Ok(None);
            };
            let drone = entry.value_mut();
            drone.location.lat = frame.lat;
            drone.location.lng = frame.lng;
            drone.location.altitude = frame.alt.max(0.0);
            drone.location.speed = frame.speed.max(0.0);
            drone.location.heading = normalize_heading(frame.heading);
            drone.battery = clamp_battery(frame.battery);
            drone.armed = frame.armed;
            drone.in_air = frame.in_air;
            drone.touch();
            drone.clone()
        };

        self.store.put_drone(&snapshot).await?;
        self.observe_battery(&snapshot);
        Ok(Some(snapshot))
    }

    /// Pulls drones known to the store but missing from the projection.
    pub async fn sync_from_store(&self) -> Result<Vec<String>, StoreError> {
        let mut loaded = Vec::new();
        for id in self.store.list_drone_ids().await? {
            if self.drones.contains_key(&id) {
                continue;
            }
            if let Some(drone) = self.store.get_drone(&id).await? {
                self.observe_battery(&drone);
                self.drones.entry(id.clone()).or_insert(drone);
                loaded.push(id);
            }
        }
        Ok(loaded)
    }

    fn observe_battery(&self, drone: &Drone) {
        self.metrics
            .drone_battery_percent
            .with_label_values(&[drone.id.as_str()])
            .set(drone.battery);
    }
}
