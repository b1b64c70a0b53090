//! Persistence collaborator. The core only needs read-after-write within one
//! process, so the in-memory store is the reference implementation.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::models::delivery::DeliveryOrder;
use crate::models::drone::Drone;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub drone_id: Option<String>,
    pub kind: String,
    pub detail: serde_json::Value,
}

impl AuditEntry {
    pub fn new(drone_id: Option<&str>, kind: impl Into<String>, detail: serde_json::Value) -> Self {
        Self {
            at: Utc::now(),
            drone_id: drone_id.map(str::to_string),
            kind: kind.into(),
            detail,
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_drone(&self, id: &str) -> Result<Option<Drone>, StoreError>;
    async fn put_drone(&self, drone: &Drone) -> Result<(), StoreError>;
    async fn list_drone_ids(&self) -> Result<Vec<String>, StoreError>;
    async fn get_order(&self, id: &str) -> Result<Option<DeliveryOrder>, StoreError>;
    async fn put_order(&self, order: &DeliveryOrder) -> Result<(), StoreError>;
    async fn append_audit(&self, entry: AuditEntry) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct MemoryStore {
    drones: DashMap<String, Drone>,
    orders: DashMap<String, DeliveryOrder>,
    audit: Mutex<Vec<AuditEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.audit
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_drone(&self, id: &str) -> Result<Option<Drone>, StoreError> {
        Ok(self.drones.get(id).map(|entry| entry.value().clone()))
    }

    async fn put_drone(&self, drone: &Drone) -> Result<(), StoreError> {
        self.drones.insert(drone.id.clone(), drone.clone());
        Ok(())
    }

    async fn list_drone_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self.drones.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }

    async fn get_order(&self, id: &str) -> Result<Option<DeliveryOrder>, StoreError> {
        Ok(self.orders.get(id).map(|entry| entry.value().clone()))
    }

    async fn put_order(&self, order: &DeliveryOrder) -> Result<(), StoreError> {
        self.orders.insert(order.id.clone(), order.clone());
        Ok(())
    }

    async fn append_audit(&self, entry: AuditEntry) -> Result<(), StoreError> {
        let mut entries = self
            .audit
            .lock()
            .map_err(|_| StoreError::Backend("audit log lock poisoned".to_string()))?;
        entries.push(entry);
        Ok(())
    }
}
