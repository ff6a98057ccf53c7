use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::status::OrderStatus;

pub const AGGREGATE_ORDER: &str = "Order";
pub const AGGREGATE_INVENTORY: &str = "Inventory";

/// Frame published by the outbox relay. `event_id` is the outbox row id and
/// is what consumers dedupe on; redelivery of the same envelope must be a
/// no-op everywhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    pub fn decode<T: DeserializeOwned>(&self) -> CoreResult<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            CoreError::Validation(format!(
                "malformed {} payload: {e}",
                self.event_type
            ))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    pub product_id: Uuid,
    pub sku: String,
    pub quantity: i32,
    pub unit_price: BigDecimal,
    pub discount: BigDecimal,
    pub total_price: BigDecimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCreatedEvent {
    pub order_id: Uuid,
    pub customer_id: Uuid,
    pub order_type: String,
    pub items: Vec<LineItem>,
    pub total_amount: BigDecimal,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStatusChangedEvent {
    pub order_id: Uuid,
    pub old_status: Option<OrderStatus>,
    pub new_status: OrderStatus,
    pub changed_by: String,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCancelledEvent {
    pub order_id: Uuid,
    pub reason: String,
    pub cancelled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationItem {
    pub sku: String,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationRequestedEvent {
    pub order_id: Uuid,
    pub items: Vec<ReservationItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationSucceededEvent {
    pub order_id: Uuid,
    pub sku: String,
    pub quantity: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationFailureReason {
    UnknownSku,
    InsufficientStock,
    ReservationProcessingError,
}

impl std::fmt::Display for ReservationFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReservationFailureReason::UnknownSku => "UNKNOWN_SKU",
            ReservationFailureReason::InsufficientStock => "INSUFFICIENT_STOCK",
            ReservationFailureReason::ReservationProcessingError => {
                "RESERVATION_PROCESSING_ERROR"
            }
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationFailedEvent {
    pub order_id: Uuid,
    pub sku: String,
    pub reason: ReservationFailureReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_quantity: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_quantity: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequestedEvent {
    pub order_id: Uuid,
    pub amount: BigDecimal,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentSucceededEvent {
    pub order_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentFailedEvent {
    pub order_id: Uuid,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_reasons_use_wire_spellings() {
        let json = serde_json::to_string(&ReservationFailureReason::InsufficientStock).unwrap();
        assert_eq!(json, "\"INSUFFICIENT_STOCK\"");
        let back: ReservationFailureReason = serde_json::from_str("\"UNKNOWN_SKU\"").unwrap();
        assert_eq!(back, ReservationFailureReason::UnknownSku);
    }

    #[test]
    fn failed_event_omits_absent_quantities() {
        let ev = ReservationFailedEvent {
            order_id: Uuid::new_v4(),
            sku: "SKU-1".into(),
            reason: ReservationFailureReason::UnknownSku,
            requested_quantity: None,
            available_quantity: None,
            detail: None,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert!(json.get("requested_quantity").is_none());
        assert!(json.get("detail").is_none());
    }

    #[test]
    fn envelope_decodes_its_payload() {
        let inner = ReservationSucceededEvent {
            order_id: Uuid::new_v4(),
            sku: "SKU-9".into(),
            quantity: 3,
        };
        let env = EventEnvelope {
            event_id: Uuid::new_v4(),
            event_type: "inventory.reservation.succeeded".into(),
            aggregate_type: AGGREGATE_INVENTORY.into(),
            aggregate_id: "SKU-9".into(),
            occurred_at: Utc::now(),
            payload: serde_json::to_value(&inner).unwrap(),
        };
        let decoded: ReservationSucceededEvent = env.decode().unwrap();
        assert_eq!(decoded.order_id, inner.order_id);
        assert_eq!(decoded.quantity, 3);
    }

    #[test]
    fn envelope_decode_rejects_wrong_shape() {
        let env = EventEnvelope {
            event_id: Uuid::new_v4(),
            event_type: "order.created".into(),
            aggregate_type: AGGREGATE_ORDER.into(),
            aggregate_id: Uuid::new_v4().to_string(),
            occurred_at: Utc::now(),
            payload: serde_json::json!({"bogus": true}),
        };
        let res: CoreResult<OrderCreatedEvent> = env.decode();
        assert!(matches!(res, Err(CoreError::Validation(_))));
    }
}
