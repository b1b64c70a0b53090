pub mod path;

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::PlanningError;
use crate::geo::GeoPoint;
use crate::models::path::{Avoidance, FlightPath, Obstacle, Waypoint};
use crate::models::weather::WeatherConditions;
use crate::observability::metrics::Metrics;

pub use path::{
    direct_path, eta_seconds, path_length_m, plan, replan, simplify, validate_flight_plan,
    NOMINAL_AIRSPEED_MS,
};

type PathSlot = Arc<Mutex<Option<FlightPath>>>;

/// Owns the active flight path of every drone. Each drone has its own async
/// mutex, so a telemetry-triggered replan and a command handler never
/// interleave for the same drone while other drones proceed.
///
/// Obstacles reported by a drone's sensors are remembered until its path is
/// discarded and are folded into every route planned for it meanwhile.
pub struct FlightPlanner {
    active: DashMap<String, PathSlot>,
    sensed: DashMap<String, Vec<Obstacle>>,
    metrics: Metrics,
}

impl FlightPlanner {
    pub fn new(metrics: Metrics) -> Self {
        Self {
            active: DashMap::new(),
            sensed: DashMap::new(),
            metrics,
        }
    }

    fn slot(&self, drone_id: &str) -> PathSlot {
        self.active
            .entry(drone_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    pub async fn route_for(
        &self,
        drone_id: &str,
        start: GeoPoint,
        end: GeoPoint,
        obstacles: &[Obstacle],
        weather: &WeatherConditions,
    ) -> Result<FlightPath, PlanningError> {
        let slot = self.slot(drone_id);
        let mut active = slot.lock().await;

        let mut known = obstacles.to_vec();
        for obstacle in self.sensed_obstacles(drone_id) {
            if !known.contains(&obstacle) {
                known.push(obstacle);
            }
        }

        let path = plan(start, end, &known, weather)?;
        self.record_outcome(drone_id, &path);

        *active = Some(path.clone());
        Ok(path)
    }

    /// Returns `Ok(None)` when the drone has no active path or the path
    /// already clears the new obstacles.
    pub async fn replan_for(
        &self,
        drone_id: &str,
        position: GeoPoint,
        new_obstacles: &[Obstacle],
        weather: &WeatherConditions,
    ) -> Result<Option<FlightPath>, PlanningError> {
        let slot = self.slot(drone_id);
        let mut active = slot.lock().await;

        let Some(current) = active.as_ref() else {
            return Ok(None);
        };

        let updated = replan(current, position, new_obstacles, weather)?;
        if updated.waypoints == current.waypoints && updated.obstacles == current.obstacles {
            return Ok(None);
        }

        self.record_outcome(drone_id, &updated);
        info!(
            drone_id = %drone_id,
            waypoints = updated.waypoints.len(),
            "flight path replanned around new obstacles"
        );

        *active = Some(updated.clone());
        Ok(Some(updated))
    }

    pub async fn set_manual(
        &self,
        drone_id: &str,
        waypoints: Vec<Waypoint>,
        weather: &WeatherConditions,
    ) -> Result<FlightPath, PlanningError> {
        validate_flight_plan(&waypoints)?;

        let slot = self.slot(drone_id);
        let mut active = slot.lock().await;

        let path = FlightPath {
            distance_m: path_length_m(&waypoints),
            waypoints,
            obstacles: Vec::new(),
            weather: *weather,
            avoidance: Avoidance::Manual,
            computed_at: Utc::now(),
        };

        *active = Some(path.clone());
        Ok(path)
    }

    pub async fn active_path(&self, drone_id: &str) -> Option<FlightPath> {
        let slot = self.active.get(drone_id)?.value().clone();
        let active = slot.lock().await;
        active.clone()
    }

    /// Remembers sensed obstacles and returns the ones not seen before.
    pub fn note_obstacles(&self, drone_id: &str, obstacles: &[Obstacle]) -> Vec<Obstacle> {
        let mut known = self.sensed.entry(drone_id.to_string()).or_default();
        let fresh: Vec<Obstacle> = obstacles
            .iter()
            .filter(|obstacle| !known.contains(obstacle))
            .copied()
            .collect();
        known.extend(fresh.iter().copied());
        fresh
    }

    pub fn sensed_obstacles(&self, drone_id: &str) -> Vec<Obstacle> {
        self.sensed
            .get(drone_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub async fn discard(&self, drone_id: &str) {
        self.sensed.remove(drone_id);
        let Some(slot) = self.active.get(drone_id).map(|entry| entry.value().clone()) else {
            return;
        };
        slot.lock().await.take();
    }

    fn record_outcome(&self, drone_id: &str, path: &FlightPath) {
        if path.avoidance == Avoidance::Fallback {
            self.metrics.planning_fallbacks_total.inc();
            info!(drone_id = %drone_id, "planner returned direct fallback path");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planner() -> FlightPlanner {
        FlightPlanner::new(Metrics::new())
    }

    #[tokio::test]
    async fn route_is_kept_as_active_path() {
        let planner = planner();
        let weather = WeatherConditions::calm();

        let path = planner
            .route_for(
                "d1",
                GeoPoint::new(0.0, 0.0),
                GeoPoint::new(0.0, 0.01),
                &[],
                &weather,
            )
            .await
            .unwrap();

        let active = planner.active_path("d1").await.unwrap();
        assert_eq!(active.waypoints, path.waypoints);
        assert!(planner.active_path("d2").await.is_none());
    }

    #[tokio::test]
    async fn replan_without_active_path_is_noop() {
        let planner = planner();
        let result = planner
            .replan_for("d1", GeoPoint::new(0.0, 0.0), &[], &WeatherConditions::calm())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn sensed_obstacles_shape_later_routes_until_discarded() {
        let planner = planner();
        let weather = WeatherConditions::calm();
        let start = GeoPoint::new(0.0, 0.0);
        let end = GeoPoint::new(0.0, 0.02);
        let tower = Obstacle {
            lat: 0.0,
            lng: 0.01,
            radius: 40.0,
        };

        assert_eq!(planner.note_obstacles("d1", &[tower]), vec![tower]);
        assert!(planner.note_obstacles("d1", &[tower]).is_empty());
        assert!(planner.sensed_obstacles("d2").is_empty());

        let path = planner.route_for("d1", start, end, &[], &weather).await.unwrap();
        assert!(path.obstacles.contains(&tower));
        assert_eq!(path.avoidance, Avoidance::Avoided);
        assert!(path::path_clears(&path.waypoints, &[tower]));

        planner.discard("d1").await;
        assert!(planner.sensed_obstacles("d1").is_empty());
        assert_eq!(planner.note_obstacles("d1", &[tower]), vec![tower]);
    }

    #[tokio::test]
    async fn replan_reports_only_changed_paths() {
        let planner = planner();
        let weather = WeatherConditions::calm();
        let start = GeoPoint::new(0.0, 0.0);
        let end = GeoPoint::new(0.0, 0.02);
        let path = planner.route_for("d1", start, end, &[], &weather).await.unwrap();
        let position = path.waypoints[5].point();

        let behind = Obstacle {
            lat: path.waypoints[2].lat,
            lng: path.waypoints[2].lng,
            radius: 10.0,
        };
        let unchanged = planner
            .replan_for("d1", position, &[behind], &weather)
            .await
            .unwrap();
        assert!(unchanged.is_none());

        let ahead = Obstacle {
            lat: path.waypoints[15].lat,
            lng: path.waypoints[15].lng,
            radius: 30.0,
        };
        let updated = planner
            .replan_for("d1", position, &[ahead], &weather)
            .await
            .unwrap()
            .unwrap();
        assert!(path::path_clears(&updated.waypoints[5..], &[ahead]));
        assert_eq!(
            planner.active_path("d1").await.unwrap().waypoints,
            updated.waypoints
        );
    }

    #[tokio::test]
    async fn fallback_is_counted() {
        let planner = planner();
        let start = GeoPoint::new(0.0, 0.0);
        let inside = Obstacle {
            lat: 0.0,
            lng: 0.0,
            radius: 20.0,
        };

        let path = planner
            .route_for("d1", start, GeoPoint::new(0.0, 0.01), &[inside], &WeatherConditions::calm())
            .await
            .unwrap();

        assert_eq!(path.avoidance, Avoidance::Fallback);
        assert_eq!(planner.metrics.planning_fallbacks_total.get(), 1);
    }

    #[tokio::test]
    async fn manual_plan_is_validated_and_discardable() {
        let planner = planner();
        let weather = WeatherConditions::calm();
        let bad = vec![Waypoint {
            lat: 0.0,
            lng: 0.0,
            altitude: 50.0,
        }];
        assert!(matches!(
            planner.set_manual("d1", bad, &weather).await,
            Err(PlanningError::InvalidPlan(_))
        ));

        let good = vec![
            Waypoint { lat: 0.0, lng: 0.0, altitude: 40.0 },
            Waypoint { lat: 0.0, lng: 0.002, altitude: 60.0 },
        ];
        let path = planner.set_manual("d1", good, &weather).await.unwrap();
        assert_eq!(path.avoidance, Avoidance::Manual);

        planner.discard("d1").await;
        assert!(planner.active_path("d1").await.is_none());
    }
}
