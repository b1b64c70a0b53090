pub mod code;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::error::VerificationError;
use crate::geo::{haversine_m, GeoPoint};
use crate::models::delivery::{
    DeliveryToken, OrderStatus, VerificationReceipt, VerificationRequest,
};
use crate::store::{AuditEntry, Store};

use self::code::{delivery_code, looks_like_code, normalize_phone};

pub const LOCATION_TOLERANCE_M: f64 = 50.0;

#[derive(Debug, Serialize, Deserialize)]
struct DeliveryClaims {
    sub: String,
    drone_id: String,
    code: String,
    iat: i64,
    exp: i64,
}

/// Issues and redeems single-use delivery proofs.
///
/// Live tokens are keyed by order. Every code ever issued stays in `codes`,
/// which is what keeps a code from being handed to a second order.
pub struct DeliveryVerifier {
    store: Arc<dyn Store>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl: chrono::Duration,
    tokens: DashMap<String, DeliveryToken>,
    codes: DashMap<String, String>,
}

impl DeliveryVerifier {
    pub fn new(store: Arc<dyn Store>, secret: &str, ttl: Duration) -> Self {
        Self {
            store,
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::minutes(30)),
            tokens: DashMap::new(),
            codes: DashMap::new(),
        }
    }

    pub async fn issue(
        &self,
        order_id: &str,
        drone_id: &str,
        delivery_location: GeoPoint,
        recipient_phone: &str,
    ) -> Result<DeliveryToken, VerificationError> {
        if order_id.trim().is_empty() || drone_id.trim().is_empty() {
            return Err(VerificationError::InvalidOrder(
                "order and drone ids are required".to_string(),
            ));
        }

        let issued_at = Utc::now();
        let expires_at = issued_at + self.ttl;
        let code = self.reserve_code(order_id, issued_at);

        let claims = DeliveryClaims {
            sub: order_id.to_string(),
            drone_id: drone_id.to_string(),
            code: code.clone(),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|err| VerificationError::Signing(err.to_string()))?;

        let issued = DeliveryToken {
            order_id: order_id.to_string(),
            drone_id: drone_id.to_string(),
            delivery_location,
            recipient_phone: recipient_phone.to_string(),
            code,
            token,
            issued_at,
            expires_at,
        };

        self.tokens.insert(order_id.to_string(), issued.clone());
        self.store
            .append_audit(AuditEntry::new(
                Some(drone_id),
                "delivery_token_issued",
                json!({ "order_id": order_id, "code": issued.code, "expires_at": expires_at }),
            ))
            .await?;

        info!(order_id = %order_id, drone_id = %drone_id, "delivery token issued");
        Ok(issued)
    }

    fn reserve_code(&self, order_id: &str, issued_at: DateTime<Utc>) -> String {
        let millis = issued_at.timestamp_millis().max(0) as u64;
        loop {
            let candidate = delivery_code(order_id, millis, &mut rand::rng());
            if let Entry::Vacant(slot) = self.codes.entry(candidate.clone()) {
                slot.insert(order_id.to_string());
                return candidate;
            }
            warn!(order_id = %order_id, "delivery code collision; regenerating");
        }
    }

    /// Redeems a token or its short code. `presenting_drone`, when given, must
    /// be the drone the token was issued to.
    pub async fn verify(
        &self,
        token_or_code: &str,
        presenting_drone: Option<&str>,
        request: &VerificationRequest,
    ) -> Result<VerificationReceipt, VerificationError> {
        let token = self.resolve(token_or_code.trim())?;

        if Utc::now() > token.expires_at {
            return Err(VerificationError::Expired);
        }

        let distance_m = haversine_m(&request.current_location, &token.delivery_location);
        if distance_m > LOCATION_TOLERANCE_M {
            return Err(VerificationError::LocationMismatch { distance_m });
        }

        if normalize_phone(&request.recipient_phone) != normalize_phone(&token.recipient_phone) {
            return Err(VerificationError::PhoneMismatch);
        }

        if presenting_drone.is_some_and(|drone_id| drone_id != token.drone_id) {
            return Err(VerificationError::InvalidOrder(format!(
                "token for order {} was not issued to this drone",
                token.order_id
            )));
        }

        let mut order = self
            .store
            .get_order(&token.order_id)
            .await?
            .ok_or_else(|| {
                VerificationError::InvalidOrder(format!("order {} not found", token.order_id))
            })?;

        if !order.status.is_in_transit() {
            return Err(VerificationError::InvalidOrder(format!(
                "order {} is {:?}, not in transit",
                order.id, order.status
            )));
        }

        if order.drone_id.as_deref() != Some(token.drone_id.as_str()) {
            return Err(VerificationError::InvalidOrder(format!(
                "order {} is not assigned to drone {}",
                order.id, token.drone_id
            )));
        }

        let Some((_, consumed)) = self
            .tokens
            .remove_if(&token.order_id, |_, live| live.code == token.code)
        else {
            return Err(VerificationError::InvalidOrder(format!(
                "delivery token for order {} was already used",
                token.order_id
            )));
        };

        let delivered_at = Utc::now();
        order.status = OrderStatus::Delivered;
        order.delivered_at = Some(delivered_at);
        order.updated_at = delivered_at;
        if let Err(err) = self.store.put_order(&order).await {
            warn!(order_id = %token.order_id, error = %err, "delivery not persisted; token restored");
            self.tokens.entry(consumed.order_id.clone()).or_insert(consumed);
            return Err(err.into());
        }

        if let Err(err) = self
            .store
            .append_audit(AuditEntry::new(
                Some(&token.drone_id),
                "delivery_verified",
                json!({
                    "order_id": token.order_id,
                    "code": token.code,
                    "distance_m": distance_m,
                }),
            ))
            .await
        {
            warn!(order_id = %token.order_id, error = %err, "delivery verified but audit entry lost");
        }

        info!(
            order_id = %token.order_id,
            drone_id = %token.drone_id,
            distance_m,
            "delivery verified"
        );

        Ok(VerificationReceipt {
            order_id: token.order_id,
            drone_id: token.drone_id,
            code: token.code,
            distance_m,
            delivered_at,
        })
    }

    fn resolve(&self, presented: &str) -> Result<DeliveryToken, VerificationError> {
        if looks_like_code(presented) {
            let code = presented.to_uppercase();
            let order_id = self
                .codes
                .get(&code)
                .map(|entry| entry.value().clone())
                .ok_or(VerificationError::InvalidToken)?;
            return match self.tokens.get(&order_id) {
                Some(live) if live.code == code => Ok(live.value().clone()),
                Some(_) => Err(VerificationError::InvalidToken),
                None => Err(VerificationError::InvalidOrder(format!(
                    "delivery token for order {order_id} was already used or revoked"
                ))),
            };
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        let claims = decode::<DeliveryClaims>(presented, &self.decoding_key, &validation)
            .map_err(|err| match err.kind() {
                ErrorKind::ExpiredSignature => VerificationError::Expired,
                _ => VerificationError::InvalidToken,
            })?
            .claims;

        match self.tokens.get(&claims.sub) {
            Some(live) if live.token == presented => Ok(live.value().clone()),
            Some(_) => Err(VerificationError::InvalidToken),
            None => Err(VerificationError::InvalidOrder(format!(
                "delivery token for order {} was already used or revoked",
                claims.sub
            ))),
        }
    }

    /// Drops the live token and cancels the order unless it was delivered.
    pub async fn revoke(&self, order_id: &str) -> Result<bool, VerificationError> {
        let revoked = self.tokens.remove(order_id).is_some();

        if let Some(mut order) = self.store.get_order(order_id).await? {
            if order.status != OrderStatus::Delivered && order.status != OrderStatus::Cancelled {
                order.status = OrderStatus::Cancelled;
                order.updated_at = Utc::now();
                self.store.put_order(&order).await?;
            }
        }

        self.store
            .append_audit(AuditEntry::new(
                None,
                "delivery_token_revoked",
                json!({ "order_id": order_id, "had_token": revoked }),
            ))
            .await?;

        if revoked {
            info!(order_id = %order_id, "delivery token revoked");
        }
        Ok(revoked)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::error::{HandlerError, StoreError};
    use crate::geo::{translate, Vector2};
    use crate::models::delivery::DeliveryOrder;
    use crate::models::drone::Drone;
    use crate::store::MemoryStore;

    const PHONE: &str = "+1 555 010 0199";

    async fn setup(ttl: Duration) -> (DeliveryVerifier, Arc<MemoryStore>, GeoPoint) {
        let store = Arc::new(MemoryStore::new());
        let drop_off = GeoPoint::new(52.52, 13.405);
        let mut order = DeliveryOrder::new("order-1", drop_off, PHONE);
        order.status = OrderStatus::InTransit;
        order.drone_id = Some("d1".to_string());
        store.put_order(&order).await.unwrap();
        (DeliveryVerifier::new(store.clone(), "test-secret", ttl), store, drop_off)
    }

    fn at(drop_off: GeoPoint, north_m: f64) -> VerificationRequest {
        VerificationRequest {
            current_location: translate(&drop_off, Vector2 { east: 0.0, north: north_m }),
            recipient_phone: "15550100199".to_string(),
        }
    }

    #[tokio::test]
    async fn verifies_within_tolerance_exactly_once() {
        let (verifier, store, drop_off) = setup(Duration::from_secs(1800)).await;
        let token = verifier.issue("order-1", "d1", drop_off, PHONE).await.unwrap();

        let receipt = verifier.verify(&token.code, Some("d1"), &at(drop_off, 49.0)).await.unwrap();
        assert_eq!(receipt.order_id, "order-1");
        assert!(receipt.distance_m < 50.0);

        let order = store.get_order("order-1").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Delivered);
        assert!(order.delivered_at.is_some());

        let again = verifier.verify(&token.code, Some("d1"), &at(drop_off, 10.0)).await;
        assert!(matches!(again, Err(VerificationError::InvalidOrder(_))));
        let again_jwt = verifier.verify(&token.token, None, &at(drop_off, 10.0)).await;
        assert!(matches!(again_jwt, Err(VerificationError::InvalidOrder(_))));
    }

    #[tokio::test]
    async fn rejects_location_and_phone_mismatch() {
        let (verifier, _, drop_off) = setup(Duration::from_secs(1800)).await;
        let token = verifier.issue("order-1", "d1", drop_off, PHONE).await.unwrap();

        let far = verifier.verify(&token.code, None, &at(drop_off, 60.0)).await;
        assert!(matches!(far, Err(VerificationError::LocationMismatch { .. })));

        let mut wrong_phone = at(drop_off, 5.0);
        wrong_phone.recipient_phone = "+44 20 7946 0000".to_string();
        let phone = verifier.verify(&token.token, None, &wrong_phone).await;
        assert_eq!(phone.unwrap_err(), VerificationError::PhoneMismatch);

        assert!(verifier.verify(&token.token, Some("d1"), &at(drop_off, 0.0)).await.is_ok());
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let (verifier, _, drop_off) = setup(Duration::ZERO).await;
        let token = verifier.issue("order-1", "d1", drop_off, PHONE).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let result = verifier.verify(&token.code, None, &at(drop_off, 0.0)).await;
        assert_eq!(result.unwrap_err(), VerificationError::Expired);
    }

    #[tokio::test]
    async fn unknown_or_forged_tokens_are_invalid() {
        let (verifier, store, drop_off) = setup(Duration::from_secs(1800)).await;
        verifier.issue("order-1", "d1", drop_off, PHONE).await.unwrap();

        let unknown = verifier.verify("DEL-0-AAAAA-000000", None, &at(drop_off, 0.0)).await;
        assert_eq!(unknown.unwrap_err(), VerificationError::InvalidToken);

        let forger = DeliveryVerifier::new(store, "other-secret", Duration::from_secs(1800));
        let forged = forger.issue("order-1", "d1", drop_off, PHONE).await.unwrap();
        let result = verifier.verify(&forged.token, None, &at(drop_off, 0.0)).await;
        assert_eq!(result.unwrap_err(), VerificationError::InvalidToken);
    }

    #[tokio::test]
    async fn wrong_drone_or_order_state_is_invalid_order() {
        let (verifier, store, drop_off) = setup(Duration::from_secs(1800)).await;
        let token = verifier.issue("order-1", "d1", drop_off, PHONE).await.unwrap();

        let other_drone = verifier.verify(&token.code, Some("d2"), &at(drop_off, 0.0)).await;
        assert!(matches!(other_drone, Err(VerificationError::InvalidOrder(_))));

        let mut order = store.get_order("order-1").await.unwrap().unwrap();
        order.status = OrderStatus::Assigned;
        store.put_order(&order).await.unwrap();
        let pending = verifier.verify(&token.code, None, &at(drop_off, 0.0)).await;
        assert!(matches!(pending, Err(VerificationError::InvalidOrder(_))));
    }

    #[tokio::test]
    async fn revoke_cancels_order_and_kills_token() {
        let (verifier, store, drop_off) = setup(Duration::from_secs(1800)).await;
        let token = verifier.issue("order-1", "d1", drop_off, PHONE).await.unwrap();

        assert!(verifier.revoke("order-1").await.unwrap());
        assert!(!verifier.revoke("order-1").await.unwrap());

        let order = store.get_order("order-1").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        let result = verifier.verify(&token.code, None, &at(drop_off, 0.0)).await;
        assert!(matches!(result, Err(VerificationError::InvalidOrder(_))));
    }

    #[tokio::test]
    async fn reissue_supersedes_previous_code() {
        let (verifier, _, drop_off) = setup(Duration::from_secs(1800)).await;
        let first = verifier.issue("order-1", "d1", drop_off, PHONE).await.unwrap();
        let second = verifier.issue("order-1", "d1", drop_off, PHONE).await.unwrap();
        assert_ne!(first.code, second.code);

        let stale = verifier.verify(&first.code, None, &at(drop_off, 0.0)).await;
        assert_eq!(stale.unwrap_err(), VerificationError::InvalidToken);
        assert!(verifier.verify(&second.code, None, &at(drop_off, 0.0)).await.is_ok());
    }

    /// Memory store whose next `order_writes` order updates fail.
    struct FlakyStore {
        inner: MemoryStore,
        order_writes: AtomicU32,
    }

    #[async_trait]
    impl Store for FlakyStore {
        async fn get_drone(&self, id: &str) -> Result<Option<Drone>, StoreError> {
            self.inner.get_drone(id).await
        }

        async fn put_drone(&self, drone: &Drone) -> Result<(), StoreError> {
            self.inner.put_drone(drone).await
        }

        async fn list_drone_ids(&self) -> Result<Vec<String>, StoreError> {
            self.inner.list_drone_ids().await
        }

        async fn get_order(&self, id: &str) -> Result<Option<DeliveryOrder>, StoreError> {
            self.inner.get_order(id).await
        }

        async fn put_order(&self, order: &DeliveryOrder) -> Result<(), StoreError> {
            let failing = self
                .order_writes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if failing {
                return Err(StoreError::Backend("disk full".to_string()));
            }
            self.inner.put_order(order).await
        }

        async fn append_audit(&self, entry: AuditEntry) -> Result<(), StoreError> {
            self.inner.append_audit(entry).await
        }
    }

    #[tokio::test]
    async fn failed_write_keeps_token_redeemable() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            order_writes: AtomicU32::new(0),
        });
        let drop_off = GeoPoint::new(52.52, 13.405);
        let mut order = DeliveryOrder::new("order-1", drop_off, PHONE);
        order.status = OrderStatus::InTransit;
        order.drone_id = Some("d1".to_string());
        store.put_order(&order).await.unwrap();

        let verifier = DeliveryVerifier::new(store.clone(), "test-secret", Duration::from_secs(1800));
        let token = verifier.issue("order-1", "d1", drop_off, PHONE).await.unwrap();

        store.order_writes.store(1, Ordering::SeqCst);
        let failed = verifier.verify(&token.code, Some("d1"), &at(drop_off, 0.0)).await;
        assert!(matches!(failed, Err(VerificationError::Store(_))));
        assert_eq!(
            HandlerError::from(failed.unwrap_err()),
            HandlerError::Transient("store error: store backend error: disk full".to_string())
        );

        let order = store.get_order("order-1").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::InTransit);

        let receipt = verifier.verify(&token.code, Some("d1"), &at(drop_off, 0.0)).await.unwrap();
        assert_eq!(receipt.order_id, "order-1");
        let order = store.get_order("order-1").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Delivered);
    }
}
