use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use uuid::Uuid;

use shared::EventEnvelope;

#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
#[diesel(table_name = crate::schema::stock_levels, primary_key(sku))]
pub struct StockLevelRow {
    pub sku: String,
    pub available: i32,
    pub reserved: i32,
    pub version: i32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::schema::stock_levels)]
pub struct NewStockLevel {
    pub sku: String,
    pub available: i32,
    pub reserved: i32,
    pub version: i32,
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
