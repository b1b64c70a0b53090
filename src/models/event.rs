use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::command::{CommandStatus, CommandType};
use crate::models::path::{Avoidance, Obstacle};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Error => "ERROR",
        }
    }
}

/// One telemetry sample as sent by the drone bridge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryFrame {
    pub drone_id: String,
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub alt: f64,
    pub battery: f64,
    #[serde(default)]
    pub heading: f64,
    #[serde(default)]
    pub speed: f64,
    #[serde(default)]
    pub armed: bool,
    #[serde(default)]
    pub in_air: bool,
    #[serde(default)]
    pub obstacles: Vec<Obstacle>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FleetEvent {
    Telemetry {
        frame: TelemetryFrame,
    },
    Connection {
        drone_id: String,
        state: ConnectionState,
        error: Option<String>,
    },
    Command {
        command_id: Uuid,
        drone_id: String,
        command_type: CommandType,
        status: CommandStatus,
        retries: u32,
        error: Option<String>,
    },
    PathUpdated {
        drone_id: String,
        waypoints: usize,
        avoidance: Avoidance,
    },
    Emergency {
        drone_id: String,
        reason: String,
    },
}

impl FleetEvent {
    pub fn drone_id(&self) -> &str {
        match self {
            FleetEvent::Telemetry { frame } => &frame.drone_id,
            FleetEvent::Connection { drone_id, .. }
            | FleetEvent::Command { drone_id, .. }
            | FleetEvent::PathUpdated { drone_id, .. }
            | FleetEvent::Emergency { drone_id, .. } => drone_id,
        }
    }
}
