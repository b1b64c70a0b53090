use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::geo::GeoPoint;
use crate::models::drone::LandingZone;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmergencyContact {
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmergencyNotice {
    pub drone_id: String,
    pub reason: String,
    pub location: GeoPoint,
    pub landing_zone: Option<LandingZone>,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, contact: &EmergencyContact, notice: &EmergencyNotice) -> Result<(), String>;
}

/// Writes notices to the log. Used when no outbound channel is configured.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, contact: &EmergencyContact, notice: &EmergencyNotice) -> Result<(), String> {
        warn!(
            drone_id = %notice.drone_id,
            contact = %contact.name,
            reason = %notice.reason,
            lat = notice.location.lat,
            lng = notice.location.lng,
            "emergency notification"
        );
        Ok(())
    }
}

/// Fire-and-forget emergency fan-out. `notify` never blocks the caller; the
/// notification loop delivers to every contact of the drone.
pub struct EmergencyNotifier {
    contacts: DashMap<String, Vec<EmergencyContact>>,
    tx: mpsc::UnboundedSender<EmergencyNotice>,
}

impl EmergencyNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EmergencyNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                contacts: DashMap::new(),
                tx,
            },
            rx,
        )
    }

    pub fn add_contact(&self, drone_id: &str, contact: EmergencyContact) -> Vec<EmergencyContact> {
        let mut contacts = self.contacts.entry(drone_id.to_string()).or_default();
        contacts.retain(|existing| existing.name != contact.name);
        contacts.push(contact);
        contacts.clone()
    }

    pub fn remove_contact(&self, drone_id: &str, name: &str) -> bool {
        let Some(mut contacts) = self.contacts.get_mut(drone_id) else {
            return false;
        };
        let before = contacts.len();
        contacts.retain(|existing| existing.name != name);
        contacts.len() != before
    }

    pub fn contacts(&self, drone_id: &str) -> Vec<EmergencyContact> {
        self.contacts
            .get(drone_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn notify(&self, notice: EmergencyNotice) {
        if self.tx.send(notice).is_err() {
            warn!("emergency notice dropped: notification loop stopped");
        }
    }
}

pub async fn run_notification_loop(
    notifier: Arc<EmergencyNotifier>,
    sink: Arc<dyn NotificationSink>,
    mut rx: mpsc::UnboundedReceiver<EmergencyNotice>,
) {
    info!("notification loop started");

    while let Some(notice) = rx.recv().await {
        let contacts = notifier.contacts(&notice.drone_id);
        if contacts.is_empty() {
            warn!(drone_id = %notice.drone_id, "no emergency contacts registered");
            continue;
        }

        for contact in &contacts {
            if let Err(err) = sink.deliver(contact, &notice).await {
                warn!(
                    drone_id = %notice.drone_id,
                    contact = %contact.name,
                    error = %err,
                    "emergency notification failed"
                );
            }
        }
    }

    warn!("notification loop stopped: channel closed");
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct Capture(Mutex<Vec<(String, String)>>);

    #[async_trait]
    impl NotificationSink for Capture {
        async fn deliver(&self, contact: &EmergencyContact, notice: &EmergencyNotice) -> Result<(), String> {
            if contact.name == "flaky" {
                return Err("bounced".to_string());
            }
            self.0
                .lock()
                .unwrap()
                .push((contact.name.clone(), notice.drone_id.clone()));
            Ok(())
        }
    }

    fn contact(name: &str) -> EmergencyContact {
        EmergencyContact {
            name: name.to_string(),
            phone: Some("+15550100".to_string()),
            email: None,
        }
    }

    #[test]
    fn contacts_are_keyed_by_name() {
        let (notifier, _rx) = EmergencyNotifier::new();
        notifier.add_contact("d1", contact("ops"));
        let all = notifier.add_contact("d1", contact("ops"));
        assert_eq!(all.len(), 1);
        assert!(notifier.remove_contact("d1", "ops"));
        assert!(!notifier.remove_contact("d1", "ops"));
    }

    #[tokio::test]
    async fn one_failing_contact_does_not_block_the_rest() {
        let (notifier, rx) = EmergencyNotifier::new();
        let notifier = Arc::new(notifier);
        notifier.add_contact("d1", contact("flaky"));
        notifier.add_contact("d1", contact("ops"));
        let sink = Arc::new(Capture(Mutex::new(Vec::new())));

        notifier.notify(EmergencyNotice {
            drone_id: "d1".to_string(),
            reason: "battery".to_string(),
            location: GeoPoint::new(0.0, 0.0),
            landing_zone: None,
            at: Utc::now(),
        });

        let worker = tokio::spawn(run_notification_loop(notifier.clone(), sink.clone(), rx));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        worker.abort();

        assert_eq!(
            *sink.0.lock().unwrap(),
            vec![("ops".to_string(), "d1".to_string())]
        );
    }
}
