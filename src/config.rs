use std::env;
use std::time::Duration;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub event_buffer_size: usize,
    pub command_max_retries: u32,
    /// Zero requeues failed commands immediately.
    pub command_retry_backoff: Duration,
    pub command_retry_backoff_max: Duration,
    pub command_timeout: Duration,
    pub command_history_limit: usize,
    pub discovery_interval: Duration,
    pub reconnect_delay: Duration,
    pub weather_fail_open: bool,
    pub weather_provider_url: Option<String>,
    pub drone_bridge_url: Option<String>,
    pub drone_telemetry_ws_url: Option<String>,
    pub delivery_token_secret: String,
    pub delivery_token_ttl: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            command_max_retries: parse_or_default("COMMAND_MAX_RETRIES", 3)?,
            command_retry_backoff: Duration::from_millis(parse_or_default(
                "COMMAND_RETRY_BACKOFF_MS",
                0,
            )?),
            command_retry_backoff_max: Duration::from_millis(parse_or_default(
                "COMMAND_RETRY_BACKOFF_MAX_MS",
                5_000,
            )?),
            command_timeout: Duration::from_secs(parse_or_default("COMMAND_TIMEOUT_SECS", 30)?),
            command_history_limit: parse_or_default("COMMAND_HISTORY_LIMIT", 1000)?,
            discovery_interval: Duration::from_secs(parse_or_default(
                "DISCOVERY_INTERVAL_SECS",
                30,
            )?),
            reconnect_delay: Duration::from_secs(parse_or_default("RECONNECT_DELAY_SECS", 3)?),
            weather_fail_open: parse_or_default("WEATHER_FAIL_OPEN", true)?,
            weather_provider_url: optional("WEATHER_PROVIDER_URL"),
            drone_bridge_url: optional("DRONE_BRIDGE_URL"),
            drone_telemetry_ws_url: optional("DRONE_TELEMETRY_WS_URL"),
            delivery_token_secret: env::var("DELIVERY_TOKEN_SECRET")
                .unwrap_or_else(|_| "delivery-token-secret".to_string()),
            delivery_token_ttl: Duration::from_secs(
                parse_or_default::<u64>("DELIVERY_TOKEN_TTL_MINUTES", 30)? * 60,
            ),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 3000,
            log_level: "info".to_string(),
            event_buffer_size: 1024,
            command_max_retries: 3,
            command_retry_backoff: Duration::ZERO,
            command_retry_backoff_max: Duration::from_secs(5),
            command_timeout: Duration::from_secs(30),
            command_history_limit: 1000,
            discovery_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(3),
            weather_fail_open: true,
            weather_provider_url: None,
            drone_bridge_url: None,
            drone_telemetry_ws_url: None,
            delivery_token_secret: "delivery-token-secret".to_string(),
            delivery_token_ttl: Duration::from_secs(30 * 60),
        }
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
