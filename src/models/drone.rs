use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geo::GeoPoint;
use crate::models::weather::WeatherConditions;

pub const MIN_OPERATING_BATTERY: f64 = 20.0;
pub const CRITICAL_BATTERY: f64 = 10.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DroneStatus {
    Idle,
    Assigned,
    InFlight,
    Delivering,
    Returning,
    Landed,
    Maintenance,
    Emergency,
    Stopped,
}

impl DroneStatus {
    /// The engine never moves a drone out of these states.
    pub fn is_sink(&self) -> bool {
        matches!(self, DroneStatus::Maintenance | DroneStatus::Emergency)
    }

    pub fn is_airborne(&self) -> bool {
        matches!(
            self,
            DroneStatus::InFlight | DroneStatus::Delivering | DroneStatus::Returning
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DroneLocation {
    pub lat: f64,
    pub lng: f64,
    pub altitude: f64,
    pub heading: f64,
    pub speed: f64,
}

impl DroneLocation {
    pub fn at(point: GeoPoint) -> Self {
        Self {
            lat: point.lat,
            lng: point.lng,
            altitude: 0.0,
            heading: 0.0,
            speed: 0.0,
        }
    }

    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lng)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SafetyRating {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LandingZone {
    pub location: GeoPoint,
    pub safety: SafetyRating,
    pub distance_m: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Drone {
    pub id: String,
    pub status: DroneStatus,
    pub location: DroneLocation,
    pub base_location: GeoPoint,
    pub battery: f64,
    pub armed: bool,
    pub in_air: bool,
    pub assignment: Option<String>,
    pub max_payload_kg: f64,
    pub max_range_m: f64,
    pub last_weather: Option<WeatherConditions>,
    pub landing_zone: Option<LandingZone>,
    pub updated_at: DateTime<Utc>,
}

impl Drone {
    pub fn new(id: impl Into<String>, base_location: GeoPoint) -> Self {
        Self {
            id: id.into(),
            status: DroneStatus::Idle,
            location: DroneLocation::at(base_location),
            base_location,
            battery: 100.0,
            armed: false,
            in_air: false,
            assignment: None,
            max_payload_kg: 2.5,
            max_range_m: 10_000.0,
            last_weather: None,
            landing_zone: None,
            updated_at: Utc::now(),
        }
    }

    pub fn set_battery(&mut self, battery: f64) {
        self.battery = clamp_battery(battery);
    }

    pub fn set_heading(&mut self, heading: f64) {
        self.location.heading = normalize_heading(heading);
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

pub fn clamp_battery(battery: f64) -> f64 {
    if battery.is_nan() {
        return 0.0;
    }
    battery.clamp(0.0, 100.0)
}

pub fn normalize_heading(heading: f64) -> f64 {
    if !heading.is_finite() {
        return 0.0;
    }
    let normalized = heading.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360.0 for tiny negative inputs
    if normalized >= 360.0 { 0.0 } else { normalized }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn battery_is_clamped() {
        assert_eq!(clamp_battery(140.0), 100.0);
        assert_eq!(clamp_battery(-3.0), 0.0);
        assert_eq!(clamp_battery(f64::NAN), 0.0);
        assert_eq!(clamp_battery(42.5), 42.5);
    }

    #[test]
    fn heading_wraps_into_range() {
        assert_eq!(normalize_heading(370.0), 10.0);
        assert_eq!(normalize_heading(-90.0), 270.0);
        assert_eq!(normalize_heading(360.0), 0.0);
        assert_eq!(normalize_heading(f64::INFINITY), 0.0);
    }

    #[test]
    fn sink_states() {
        assert!(DroneStatus::Maintenance.is_sink());
        assert!(DroneStatus::Emergency.is_sink());
        assert!(!DroneStatus::Landed.is_sink());
    }
}
