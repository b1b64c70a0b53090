use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use crate::config::Config;
use crate::engine::dispatch::{DispatchSettings, Dispatcher};
use crate::engine::handlers::HandlerContext;
use crate::fleet::hub::{SafetyAlert, TelemetryHub};
use crate::fleet::link::{
    CommandTransport, HttpBridgeTransport, SimulatedLink, TelemetryLink, WsTelemetryLink,
};
use crate::fleet::registry::DroneRegistry;
use crate::gate::weather::{HttpWeatherProvider, StaticWeather, WeatherProvider};
use crate::gate::FlightGate;
use crate::models::event::FleetEvent;
use crate::notify::{EmergencyNotice, EmergencyNotifier};
use crate::observability::metrics::Metrics;
use crate::planner::FlightPlanner;
use crate::store::{MemoryStore, Store};
use crate::verification::DeliveryVerifier;

/// External systems the core talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub weather: Arc<dyn WeatherProvider>,
    pub transport: Arc<dyn CommandTransport>,
    pub telemetry: Arc<dyn TelemetryLink>,
}

impl Collaborators {
    /// HTTP/websocket clients where URLs are configured, in-process stand-ins otherwise.
    pub fn from_config(config: &Config) -> Self {
        let simulated = Arc::new(SimulatedLink::new());

        let weather: Arc<dyn WeatherProvider> = match &config.weather_provider_url {
            Some(url) => Arc::new(HttpWeatherProvider::new(url.clone(), config.command_timeout)),
            None => Arc::new(StaticWeather::calm()),
        };
        let transport: Arc<dyn CommandTransport> = match &config.drone_bridge_url {
            Some(url) => Arc::new(HttpBridgeTransport::new(url.clone(), config.command_timeout)),
            None => simulated.clone(),
        };
        let telemetry: Arc<dyn TelemetryLink> = match &config.drone_telemetry_ws_url {
            Some(url) => Arc::new(WsTelemetryLink::new(url.clone())),
            None => simulated,
        };

        Self {
            store: Arc::new(MemoryStore::new()),
            weather,
            transport,
            telemetry,
        }
    }

    pub fn simulated(link: Arc<SimulatedLink>, weather: Arc<StaticWeather>) -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            weather,
            transport: link.clone(),
            telemetry: link,
        }
    }
}

pub struct Receivers {
    pub alerts: mpsc::UnboundedReceiver<SafetyAlert>,
    pub notices: mpsc::UnboundedReceiver<EmergencyNotice>,
}

pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub registry: Arc<DroneRegistry>,
    pub gate: Arc<FlightGate>,
    pub planner: Arc<FlightPlanner>,
    pub verifier: Arc<DeliveryVerifier>,
    pub notifier: Arc<EmergencyNotifier>,
    pub hub: Arc<TelemetryHub>,
    pub dispatcher: Arc<Dispatcher>,
    pub events_tx: broadcast::Sender<FleetEvent>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(config: Config, collaborators: Collaborators) -> (Self, Receivers) {
        let metrics = Metrics::new();
        let (events_tx, _unused_rx) = broadcast::channel(config.event_buffer_size.max(1));
        let (alerts_tx, alerts) = mpsc::unbounded_channel();
        let (notifier, notices) = EmergencyNotifier::new();
        let notifier = Arc::new(notifier);

        let store = collaborators.store;
        let registry = Arc::new(DroneRegistry::new(store.clone(), metrics.clone()));
        let gate = Arc::new(FlightGate::new(
            registry.clone(),
            collaborators.weather,
            config.weather_fail_open,
            config.command_timeout,
        ));
        let planner = Arc::new(FlightPlanner::new(metrics.clone()));
        let verifier = Arc::new(DeliveryVerifier::new(
            store.clone(),
            &config.delivery_token_secret,
            config.delivery_token_ttl,
        ));
        let hub = Arc::new(TelemetryHub::new(
            registry.clone(),
            collaborators.telemetry,
            planner.clone(),
            events_tx.clone(),
            alerts_tx,
            config.reconnect_delay,
            metrics.clone(),
        ));

        let ctx = HandlerContext {
            registry: registry.clone(),
            gate: gate.clone(),
            planner: planner.clone(),
            verifier: verifier.clone(),
            transport: collaborators.transport,
            notifier: notifier.clone(),
            events_tx: events_tx.clone(),
        };
        let dispatcher = Arc::new(Dispatcher::new(
            ctx,
            DispatchSettings::from(&config),
            metrics.clone(),
        ));

        (
            Self {
                config,
                store,
                registry,
                gate,
                planner,
                verifier,
                notifier,
                hub,
                dispatcher,
                events_tx,
                metrics,
            },
            Receivers { alerts, notices },
        )
    }
}
