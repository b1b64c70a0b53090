use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geo::GeoPoint;
use crate::models::weather::WeatherConditions;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Waypoint {
    pub lat: f64,
    pub lng: f64,
    pub altitude: f64,
}

impl Waypoint {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lng)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Obstacle {
    pub lat: f64,
    pub lng: f64,
    pub radius: f64,
}

impl Obstacle {
    pub fn center(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lng)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Avoidance {
    /// No obstacle touched the straight line.
    Clear,
    /// Waypoints were displaced and the result validated.
    Avoided,
    /// Avoidance could not be validated; the direct path was returned.
    Fallback,
    /// Supplied by an operator through UPDATE_FLIGHT_PLAN.
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlightPath {
    pub waypoints: Vec<Waypoint>,
    pub obstacles: Vec<Obstacle>,
    pub weather: WeatherConditions,
    pub avoidance: Avoidance,
    pub distance_m: f64,
    pub computed_at: DateTime<Utc>,
}

impl FlightPath {
    pub fn destination(&self) -> Option<GeoPoint> {
        self.waypoints.last().map(Waypoint::point)
    }
}
