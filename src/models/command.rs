use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::GeoPoint;
use crate::models::path::{Obstacle, Waypoint};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    Takeoff,
    Land,
    Goto,
    ReturnToBase,
    Hover,
    EmergencyLand,
    UpdateFlightPlan,
    ScanQrCode,
    DeliverPackage,
    MonitorWeather,
}

impl CommandType {
    pub const ALL: [CommandType; 10] = [
        CommandType::Takeoff,
        CommandType::Land,
        CommandType::Goto,
        CommandType::ReturnToBase,
        CommandType::Hover,
        CommandType::EmergencyLand,
        CommandType::UpdateFlightPlan,
        CommandType::ScanQrCode,
        CommandType::DeliverPackage,
        CommandType::MonitorWeather,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Takeoff => "TAKEOFF",
            CommandType::Land => "LAND",
            CommandType::Goto => "GOTO",
            CommandType::ReturnToBase => "RETURN_TO_BASE",
            CommandType::Hover => "HOVER",
            CommandType::EmergencyLand => "EMERGENCY_LAND",
            CommandType::UpdateFlightPlan => "UPDATE_FLIGHT_PLAN",
            CommandType::ScanQrCode => "SCAN_QR_CODE",
            CommandType::DeliverPackage => "DELIVER_PACKAGE",
            CommandType::MonitorWeather => "MONITOR_WEATHER",
        }
    }

    /// Commands that put the drone in the air and therefore pass the weather gate.
    pub fn is_flight(&self) -> bool {
        matches!(
            self,
            CommandType::Takeoff
                | CommandType::Goto
                | CommandType::ReturnToBase
                | CommandType::DeliverPackage
        )
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandType {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        CommandType::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == raw)
            .ok_or_else(|| format!("unknown command type: {raw}"))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Queued,
    Executing,
    Retrying,
    Executed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CommandOrigin {
    #[default]
    Operator,
    Safety,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UnavailableDrone,
    UnsafeWeather,
    Rejected,
    HandlerFailure,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PackageDetails {
    pub weight_kg: f64,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CommandParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<GeoPoint>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub obstacles: Vec<Obstacle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flight_plan: Option<Vec<Waypoint>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emergency_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_location: Option<GeoPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<PackageDetails>,
}

/// Raw submission; the command type stays a string until validated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub drone_id: String,
    pub command_type: String,
    #[serde(default)]
    pub params: CommandParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: Uuid,
    pub drone_id: String,
    pub command_type: CommandType,
    pub params: CommandParams,
    pub origin: CommandOrigin,
    pub enqueued_at: DateTime<Utc>,
    pub status: CommandStatus,
    pub retries: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_kind: Option<FailureKind>,
    pub executed_at: Option<DateTime<Utc>>,
}

impl Command {
    pub fn new(
        drone_id: String,
        command_type: CommandType,
        params: CommandParams,
        origin: CommandOrigin,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            drone_id,
            command_type,
            params,
            origin,
            enqueued_at: Utc::now(),
            status: CommandStatus::Queued,
            retries: 0,
            result: None,
            error: None,
            error_kind: None,
            executed_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub command_id: Uuid,
    pub status: CommandStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueStatus {
    pub queue_length: usize,
    pub active_commands: usize,
    pub processing: bool,
}
