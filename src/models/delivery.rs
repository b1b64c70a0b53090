use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geo::GeoPoint;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Assigned,
    InTransit,
    ApproachingDestination,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub fn is_in_transit(&self) -> bool {
        matches!(
            self,
            OrderStatus::InTransit | OrderStatus::ApproachingDestination
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryOrder {
    pub id: String,
    pub drone_id: Option<String>,
    pub status: OrderStatus,
    pub delivery_location: GeoPoint,
    pub recipient_phone: String,
    pub updated_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl DeliveryOrder {
    pub fn new(
        id: impl Into<String>,
        delivery_location: GeoPoint,
        recipient_phone: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            drone_id: None,
            status: OrderStatus::Pending,
            delivery_location,
            recipient_phone: recipient_phone.into(),
            updated_at: Utc::now(),
            delivered_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryToken {
    pub order_id: String,
    pub drone_id: String,
    pub delivery_location: GeoPoint,
    pub recipient_phone: String,
    pub code: String,
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationRequest {
    pub current_location: GeoPoint,
    pub recipient_phone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReceipt {
    pub order_id: String,
    pub drone_id: String,
    pub code: String,
    pub distance_m: f64,
    pub delivered_at: DateTime<Utc>,
}
