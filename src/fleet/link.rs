use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::error::LinkError;
use crate::models::command::{CommandParams, CommandType};
use crate::models::event::TelemetryFrame;

pub type FrameStream = BoxStream<'static, Result<TelemetryFrame, LinkError>>;

#[async_trait]
pub trait CommandTransport: Send + Sync {
    async fn send(
        &self,
        drone_id: &str,
        command_type: CommandType,
        params: &CommandParams,
    ) -> Result<Value, LinkError>;
}

#[async_trait]
pub trait TelemetryLink: Send + Sync {
    async fn connect(&self, drone_id: &str) -> Result<FrameStream, LinkError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentCommand {
    pub drone_id: String,
    pub command_type: CommandType,
    pub params: CommandParams,
    pub at: DateTime<Utc>,
}

type FrameFeed = mpsc::UnboundedSender<Result<TelemetryFrame, LinkError>>;

/// In-process drone link. Tests script failures, delays and telemetry frames
/// per drone and inspect what was sent.
#[derive(Default)]
pub struct SimulatedLink {
    sent: Mutex<Vec<SentCommand>>,
    send_failures: DashMap<String, u32>,
    send_delays: DashMap<String, VecDeque<Duration>>,
    connect_failures: DashMap<String, u32>,
    connects: DashMap<String, usize>,
    feeds: DashMap<String, FrameFeed>,
}

impl SimulatedLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` sends to `drone_id` fail with a transport error.
    pub fn fail_sends(&self, drone_id: &str, count: u32) {
        self.send_failures.insert(drone_id.to_string(), count);
    }

    /// Queues a delay applied to the next send for `drone_id`.
    pub fn delay_next_send(&self, drone_id: &str, delay: Duration) {
        self.send_delays
            .entry(drone_id.to_string())
            .or_default()
            .push_back(delay);
    }

    pub fn fail_connects(&self, drone_id: &str, count: u32) {
        self.connect_failures.insert(drone_id.to_string(), count);
    }

    pub fn sent(&self) -> Vec<SentCommand> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }

    pub fn sent_to(&self, drone_id: &str) -> Vec<SentCommand> {
        self.sent()
            .into_iter()
            .filter(|command| command.drone_id == drone_id)
            .collect()
    }

    pub fn connect_count(&self, drone_id: &str) -> usize {
        self.connects.get(drone_id).map(|count| *count).unwrap_or(0)
    }

    pub fn is_streaming(&self, drone_id: &str) -> bool {
        self.feeds
            .get(drone_id)
            .is_some_and(|feed| !feed.is_closed())
    }

    /// Delivers a frame on the drone's open stream. Returns false when no
    /// stream is open.
    pub fn push_frame(&self, frame: TelemetryFrame) -> bool {
        match self.feeds.get(&frame.drone_id) {
            Some(feed) => feed.send(Ok(frame)).is_ok(),
            None => false,
        }
    }

    /// Ends the drone's stream cleanly, as a closed socket would.
    pub fn close(&self, drone_id: &str) {
        self.feeds.remove(drone_id);
    }

    /// Emits a transport error on the drone's stream and ends it.
    pub fn break_stream(&self, drone_id: &str, reason: &str) {
        if let Some((_, feed)) = self.feeds.remove(drone_id) {
            let _ = feed.send(Err(LinkError::Transport(reason.to_string())));
        }
    }

    fn take_scripted_failure(counters: &DashMap<String, u32>, drone_id: &str) -> bool {
        let Some(mut remaining) = counters.get_mut(drone_id) else {
            return false;
        };
        if *remaining == 0 {
            return false;
        }
        *remaining -= 1;
        true
    }
}

#[async_trait]
impl CommandTransport for SimulatedLink {
    async fn send(
        &self,
        drone_id: &str,
        command_type: CommandType,
        params: &CommandParams,
    ) -> Result<Value, LinkError> {
        let delay = self
            .send_delays
            .get_mut(drone_id)
            .and_then(|mut delays| delays.pop_front());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if Self::take_scripted_failure(&self.send_failures, drone_id) {
            return Err(LinkError::Transport(format!(
                "simulated link to {drone_id} dropped {command_type}"
            )));
        }

        let sent_at = Utc::now();
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(SentCommand {
                drone_id: drone_id.to_string(),
                command_type,
                params: params.clone(),
                at: sent_at,
            });
        }

        Ok(json!({
            "acknowledged": true,
            "droneId": drone_id,
            "command": command_type,
            "timestamp": sent_at,
        }))
    }
}

#[async_trait]
impl TelemetryLink for SimulatedLink {
    async fn connect(&self, drone_id: &str) -> Result<FrameStream, LinkError> {
        *self.connects.entry(drone_id.to_string()).or_insert(0) += 1;

        if Self::take_scripted_failure(&self.connect_failures, drone_id) {
            return Err(LinkError::Unreachable(drone_id.to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.insert(drone_id.to_string(), tx);

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BridgeEnvelope<'a> {
    drone_id: &'a str,
    command: CommandType,
    params: &'a CommandParams,
    timestamp: DateTime<Utc>,
}

/// Posts commands to an HTTP drone bridge.
pub struct HttpBridgeTransport {
    base_url: String,
    client: Client,
    timeout: Duration,
}

impl HttpBridgeTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl CommandTransport for HttpBridgeTransport {
    async fn send(
        &self,
        drone_id: &str,
        command_type: CommandType,
        params: &CommandParams,
    ) -> Result<Value, LinkError> {
        let envelope = BridgeEnvelope {
            drone_id,
            command: command_type,
            params,
            timestamp: Utc::now(),
        };

        let response = self
            .client
            .post(format!("{}/command", self.base_url))
            .json(&envelope)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| {
                if err.is_connect() {
                    LinkError::Unreachable(drone_id.to_string())
                } else {
                    LinkError::Transport(err.to_string())
                }
            })?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(LinkError::Rejected(format!("{status}: {body}")));
        }
        if !status.is_success() {
            return Err(LinkError::Transport(format!("bridge returned {status}")));
        }

        response
            .json::<Value>()
            .await
            .map_err(|err| LinkError::Malformed(err.to_string()))
    }
}

/// Subscribes to `<base_url>/<drone_id>` over a websocket.
pub struct WsTelemetryLink {
    base_url: String,
}

impl WsTelemetryLink {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl TelemetryLink for WsTelemetryLink {
    async fn connect(&self, drone_id: &str) -> Result<FrameStream, LinkError> {
        let url = format!("{}/{}", self.base_url, drone_id);
        let (socket, _) = connect_async(url.as_str()).await.map_err(|err| {
            LinkError::Transport(format!("telemetry connect to {url} failed: {err}"))
        })?;

        let frames = socket
            .take_while(|message| {
                let open = !matches!(message, Ok(Message::Close(_)));
                async move { open }
            })
            .filter_map(|message| async move {
                match message {
                    Ok(Message::Text(text)) => Some(parse_frame(text.as_bytes())),
                    Ok(Message::Binary(data)) => Some(parse_frame(&data)),
                    Ok(_) => None,
                    Err(err) => Some(Err(LinkError::Transport(err.to_string()))),
                }
            });

        Ok(frames.boxed())
    }
}

fn parse_frame(raw: &[u8]) -> Result<TelemetryFrame, LinkError> {
    serde_json::from_slice(raw).map_err(|err| LinkError::Malformed(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(drone_id: &str) -> TelemetryFrame {
        TelemetryFrame {
            drone_id: drone_id.to_string(),
            lat: 0.0,
            lng: 0.0,
            alt: 40.0,
            battery: 80.0,
            heading: 90.0,
            speed: 10.0,
            armed: true,
            in_air: true,
            obstacles: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed() {
        let link = SimulatedLink::new();
        link.fail_sends("d1", 2);
        let params = CommandParams::default();

        assert!(link.send("d1", CommandType::Hover, &params).await.is_err());
        assert!(link.send("d1", CommandType::Hover, &params).await.is_err());
        assert!(link.send("d1", CommandType::Hover, &params).await.is_ok());
        assert!(link.send("d2", CommandType::Hover, &params).await.is_ok());
        assert_eq!(link.sent_to("d1").len(), 1);
    }

    #[tokio::test]
    async fn stream_ends_on_close() {
        let link = SimulatedLink::new();
        let mut frames = link.connect("d1").await.unwrap();

        assert!(link.push_frame(frame("d1")));
        assert!(frames.next().await.unwrap().is_ok());

        link.close("d1");
        assert!(frames.next().await.is_none());
        assert!(!link.push_frame(frame("d1")));
    }

    #[tokio::test]
    async fn broken_stream_yields_error() {
        let link = SimulatedLink::new();
        let mut frames = link.connect("d1").await.unwrap();

        link.break_stream("d1", "socket reset");

        assert!(matches!(frames.next().await, Some(Err(LinkError::Transport(_)))));
        assert!(frames.next().await.is_none());
    }

    #[test]
    fn bridge_envelope_uses_camel_case() {
        let params = CommandParams::default();
        let envelope = BridgeEnvelope {
            drone_id: "d1",
            command: CommandType::ReturnToBase,
            params: &params,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["droneId"], "d1");
        assert_eq!(json["command"], "RETURN_TO_BASE");
        assert!(json.get("timestamp").is_some());
    }
}
