use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use uuid::Uuid;

use shared::{CoreResult, EventEnvelope, OrderStatus};

#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
#[diesel(table_name = crate::schema::orders)]
pub struct OrderRow {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub order_type: String,
    pub currency: String,
    pub total_amount: BigDecimal,
    pub current_status: String,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderRow {
    pub fn status(&self) -> CoreResult<OrderStatus> {
        self.current_status.parse()
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::schema::orders)]
pub struct NewOrder {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub order_type: String,
    pub currency: String,
    pub total_amount: BigDecimal,
    pub current_status: String,
    pub version: i32,
}

#[derive(Debug, Clone, Queryable, Serialize)]
#[diesel(table_name = crate::schema::order_items)]
pub struct OrderItemRow {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub sku: String,
    pub quantity: i32,
    pub unit_price: BigDecimal,
    pub discount: BigDecimal,
    pub total_price: BigDecimal,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::schema::order_items)]
pub struct NewOrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub sku: String,
    pub quantity: i32,
    pub unit_price: BigDecimal,
    pub discount: BigDecimal,
    pub total_price: BigDecimal,
}

#[derive(Debug, Clone, Queryable, Serialize)]
#[diesel(table_name = crate::schema::order_status_history)]
pub struct StatusHistoryRow {
    pub id: Uuid,
    pub order_id: Uuid,
    pub old_status: Option<String>,
    pub new_status: String,
    pub changed_by: String,
    pub metadata: Option<serde_json::Value>,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::schema::order_status_history)]
pub struct NewStatusHistory {
    pub id: Uuid,
    pub order_id: Uuid,
    pub old_status: Option<String>,
    pub new_status: String,
    pub changed_by: String,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct OutboxEventRow {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

impl OutboxEventRow {
    pub fn envelope(&self) -> EventEnvelope {
        EventEnvelope {
            event_id: self.id,
            event_type: self.event_type.clone(),
            aggregate_type: self.aggregate_type.clone(),
            aggregate_id: self.aggregate_id.clone(),
            occurred_at: self.created_at,
            payload: self.payload.clone(),
        }
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct NewOutboxEvent {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::processed_events)]
pub struct ProcessedEventRow {
    pub event_id: Uuid,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::schema::processed_events)]
pub struct NewProcessedEvent {
    pub event_id: Uuid,
}
