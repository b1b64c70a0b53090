pub mod weather;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::LinkError;
use crate::fleet::registry::DroneRegistry;
use crate::geo::GeoPoint;
use crate::models::drone::MIN_OPERATING_BATTERY;
use crate::models::weather::WeatherConditions;

use self::weather::WeatherProvider;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GateDecision {
    pub safe: bool,
    pub reason: Option<String>,
}

impl GateDecision {
    fn safe() -> Self {
        Self {
            safe: true,
            reason: None,
        }
    }

    fn unsafe_because(reason: impl Into<String>) -> Self {
        Self {
            safe: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Availability {
    pub available: bool,
    pub reason: Option<String>,
}

impl Availability {
    fn available() -> Self {
        Self {
            available: true,
            reason: None,
        }
    }

    fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            reason: Some(reason.into()),
        }
    }
}

pub struct FlightGate {
    registry: Arc<DroneRegistry>,
    provider: Arc<dyn WeatherProvider>,
    fail_open: bool,
    lookup_timeout: Duration,
}

impl FlightGate {
    pub fn new(
        registry: Arc<DroneRegistry>,
        provider: Arc<dyn WeatherProvider>,
        fail_open: bool,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            provider,
            fail_open,
            lookup_timeout,
        }
    }

    async fn lookup(&self, location: GeoPoint) -> Result<WeatherConditions, LinkError> {
        match timeout(
            self.lookup_timeout,
            self.provider.conditions(location.lat, location.lng),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(LinkError::Transport(format!(
                "weather lookup timed out after {:?}",
                self.lookup_timeout
            ))),
        }
    }

    pub async fn check_flight(&self, drone_id: &str, location: GeoPoint) -> GateDecision {
        match self.lookup(location).await {
            Ok(conditions) => match conditions.unsafe_reason() {
                Some(reason) => {
                    debug!(drone_id = %drone_id, reason = %reason, "flight gate closed");
                    GateDecision::unsafe_because(reason)
                }
                None => GateDecision::safe(),
            },
            Err(err) if self.fail_open => {
                warn!(
                    drone_id = %drone_id,
                    error = %err,
                    "weather check failed; allowing flight (fail-open)"
                );
                GateDecision::safe()
            }
            Err(err) => {
                warn!(drone_id = %drone_id, error = %err, "weather check failed; blocking flight");
                GateDecision::unsafe_because(format!("weather unavailable: {err}"))
            }
        }
    }

    /// Conditions to plan against. Under fail-open a provider failure yields
    /// calm defaults.
    pub async fn current_conditions(
        &self,
        location: GeoPoint,
    ) -> Result<WeatherConditions, LinkError> {
        match self.lookup(location).await {
            Ok(conditions) => Ok(conditions),
            Err(err) if self.fail_open => {
                warn!(error = %err, "weather lookup failed; planning with calm defaults");
                Ok(WeatherConditions::calm())
            }
            Err(err) => Err(err),
        }
    }

    pub fn check_availability(&self, drone_id: &str) -> Availability {
        let Some(drone) = self.registry.get(drone_id) else {
            return Availability::unavailable(format!("drone {drone_id} not found"));
        };

        if drone.status.is_sink() {
            return Availability::unavailable(format!(
                "drone {drone_id} is in {:?} state",
                drone.status
            ));
        }

        if drone.battery < MIN_OPERATING_BATTERY {
            return Availability::unavailable(format!(
                "drone {drone_id} battery {:.0}% is below {MIN_OPERATING_BATTERY}%",
                drone.battery
            ));
        }

        Availability::available()
    }

    /// Emergency landings ignore the battery floor but still respect sink states.
    pub fn check_emergency_availability(&self, drone_id: &str) -> Availability {
        match self.registry.get(drone_id) {
            None => Availability::unavailable(format!("drone {drone_id} not found")),
            Some(drone) if drone.status.is_sink() => Availability::unavailable(format!(
                "drone {drone_id} is in {:?} state",
                drone.status
            )),
            Some(_) => Availability::available(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::weather::StaticWeather;
    use crate::models::drone::{Drone, DroneStatus};
    use crate::observability::metrics::Metrics;
    use crate::store::MemoryStore;

    async fn gate_with(
        provider: Arc<StaticWeather>,
        fail_open: bool,
    ) -> (FlightGate, Arc<DroneRegistry>) {
        let registry = Arc::new(DroneRegistry::new(Arc::new(MemoryStore::new()), Metrics::new()));
        registry
            .register(Drone::new("d1", GeoPoint::new(0.0, 0.0)))
            .await
            .unwrap();
        let gate = FlightGate::new(registry.clone(), provider, fail_open, Duration::from_secs(1));
        (gate, registry)
    }

    #[tokio::test]
    async fn windy_conditions_close_the_gate() {
        let provider = Arc::new(StaticWeather::new(WeatherConditions {
            wind_speed: 20.0,
            ..WeatherConditions::calm()
        }));
        let (gate, _) = gate_with(provider, true).await;

        let decision = gate.check_flight("d1", GeoPoint::new(0.0, 0.0)).await;

        assert!(!decision.safe);
        assert!(decision.reason.unwrap().contains("wind"));
    }

    #[tokio::test]
    async fn provider_failure_respects_fail_open_flag() {
        let provider = Arc::new(StaticWeather::unavailable());
        let (open, _) = gate_with(provider.clone(), true).await;
        let (closed, _) = gate_with(provider, false).await;

        assert!(open.check_flight("d1", GeoPoint::new(0.0, 0.0)).await.safe);
        assert!(!closed.check_flight("d1", GeoPoint::new(0.0, 0.0)).await.safe);
        assert_eq!(
            open.current_conditions(GeoPoint::new(0.0, 0.0)).await.unwrap(),
            WeatherConditions::calm()
        );
        assert!(closed.current_conditions(GeoPoint::new(0.0, 0.0)).await.is_err());
    }

    #[tokio::test]
    async fn availability_checks_battery_and_sink_states() {
        let (gate, registry) = gate_with(Arc::new(StaticWeather::calm()), true).await;
        assert!(gate.check_availability("d1").available);
        assert!(!gate.check_availability("ghost").available);

        registry.update("d1", |drone| drone.set_battery(10.0)).await.unwrap();
        let low = gate.check_availability("d1");
        assert!(!low.available);
        assert!(low.reason.unwrap().contains("battery"));
        assert!(gate.check_emergency_availability("d1").available);

        registry
            .update("d1", |drone| drone.status = DroneStatus::Maintenance)
            .await
            .unwrap();
        assert!(!gate.check_emergency_availability("d1").available);
    }
}
