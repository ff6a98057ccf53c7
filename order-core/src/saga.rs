use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::BorrowedMessage;
use rdkafka::Message;
use tracing::{debug, error, info};
use uuid::Uuid;

use shared::{
    CoreError, CoreResult, EventEnvelope, EventType, OrderCreatedEvent, OrderStatus,
    PaymentFailedEvent, PaymentRequestedEvent, PaymentSucceededEvent, ReservationFailedEvent,
    ReservationItem, ReservationRequestedEvent, ReservationSucceededEvent, AGGREGATE_ORDER,
};

use crate::models::{NewProcessedEvent, OrderRow, ProcessedEventRow};
use crate::outbox;
use crate::schema::{orders, processed_events};
use crate::service::{self, StatusChange};

const SAGA_ACTOR: &str = "saga-coordinator";

type DbPool = Pool<AsyncPgConnection>;

/// Drives the order state machine from downstream outcome events. Every
/// handler commits the status change, any follow-on outbox row, and the
/// inbound-event dedupe record in a single transaction, so a redelivered
/// envelope can never double-advance an order or re-emit a command.
pub struct SagaCoordinator {
    pool: DbPool,
}

impl SagaCoordinator {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn run(&self, consumer: StreamConsumer) {
        let mut stream = consumer.stream();

        while let Some(message) = stream.next().await {
            match message {
                Ok(m) => {
                    match decode_envelope(&m) {
                        Ok(envelope) => {
                            if let Err(e) = self.handle_event(&envelope).await {
                                error!(event_id = %envelope.event_id, event_type = %envelope.event_type,
                                    error = %e, "saga handler failed, leaving offset for redelivery");
                                continue;
                            }
                        }
                        // Undecodable frames are poison; skip them but keep the offset.
                        Err(e) => error!(error = %e, "dropping undecodable message"),
                    }
                    if let Err(e) = consumer.commit_message(&m, CommitMode::Async) {
                        error!(error = %e, "error committing offset");
                    }
                }
                Err(e) => error!(error = %e, "error receiving message"),
            }
        }
    }

    async fn handle_event(&self, envelope: &EventEnvelope) -> CoreResult<()> {
        let event_type: EventType = match envelope.event_type.parse() {
            Ok(t) => t,
            Err(_) => {
                debug!(event_type = %envelope.event_type, "ignoring unknown event type");
                return Ok(());
            }
        };

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| CoreError::Persistence(e.to_string()))?;

        if already_processed(&mut conn, envelope.event_id).await? {
            info!(event_id = %envelope.event_id, "duplicate delivery, skipping");
            return Ok(());
        }

        match event_type {
            EventType::OrderCreated => self.on_order_created(&mut conn, envelope).await,
            EventType::ReservationSucceeded => {
                self.on_reservation_succeeded(&mut conn, envelope).await
            }
            EventType::ReservationFailed => self.on_reservation_failed(&mut conn, envelope).await,
            EventType::PaymentSucceeded => self.on_payment_succeeded(&mut conn, envelope).await,
            EventType::PaymentFailed => self.on_payment_failed(&mut conn, envelope).await,
            // Our own relay traffic on order-events; nothing to react to.
            _ => Ok(()),
        }
    }

    /// A freshly created order kicks off the reservation leg of the saga.
    async fn on_order_created(
        &self,
        conn: &mut AsyncPgConnection,
        envelope: &EventEnvelope,
    ) -> CoreResult<()> {
        let event: OrderCreatedEvent = envelope.decode()?;
        let event_id = envelope.event_id;
        let request = ReservationRequestedEvent {
            order_id: event.order_id,
            items: event
                .items
                .iter()
                .map(|i| ReservationItem {
                    sku: i.sku.clone(),
                    quantity: i.quantity,
                })
                .collect(),
        };

        conn.transaction::<_, CoreError, _>(|conn| {
            Box::pin(async move {
                outbox::publish(
                    conn,
                    AGGREGATE_ORDER,
                    &request.order_id.to_string(),
                    EventType::ReservationRequested,
                    &request,
                )
                .await?;
                record_processed(conn, event_id).await
            })
        })
        .await?;

        info!(order_id = %event.order_id, "reservation requested");
        Ok(())
    }

    /// Reservation confirmed: the order is ready for payment. The status
    /// change and the payment request commit together; repeated per-SKU
    /// successes hit the same-status no-op and emit nothing further, and a
    /// success landing after the order was cancelled by a sibling failure
    /// is a recorded no-op so the offset still commits.
    async fn on_reservation_succeeded(
        &self,
        conn: &mut AsyncPgConnection,
        envelope: &EventEnvelope,
    ) -> CoreResult<()> {
        let event: ReservationSucceededEvent = envelope.decode()?;
        let event_id = envelope.event_id;
        let order_id = event.order_id;

        conn.transaction::<_, CoreError, _>(|conn| {
            Box::pin(async move {
                let change =
                    service::transition_order(conn, order_id, OrderStatus::Paid, SAGA_ACTOR, None)
                        .await?;

                if let StatusChange::Applied { .. } = change {
                    let order: OrderRow = orders::table.find(order_id).first(conn).await?;
                    let request = PaymentRequestedEvent {
                        order_id,
                        amount: order.total_amount.clone(),
                        currency: order.currency.clone(),
                    };
                    outbox::publish(
                        conn,
                        AGGREGATE_ORDER,
                        &order_id.to_string(),
                        EventType::PaymentRequested,
                        &request,
                    )
                    .await?;
                    info!(%order_id, "payment requested");
                }

                record_processed(conn, event_id).await
            })
        })
        .await
    }

    async fn on_reservation_failed(
        &self,
        conn: &mut AsyncPgConnection,
        envelope: &EventEnvelope,
    ) -> CoreResult<()> {
        let event: ReservationFailedEvent = envelope.decode()?;
        let event_id = envelope.event_id;
        let reason = format!("reservation failed for sku {}: {}", event.sku, event.reason);

        conn.transaction::<_, CoreError, _>(|conn| {
            Box::pin(async move {
                service::cancel_order_tx(conn, event.order_id, &reason, SAGA_ACTOR).await?;
                record_processed(conn, event_id).await
            })
        })
        .await
    }

    async fn on_payment_succeeded(
        &self,
        conn: &mut AsyncPgConnection,
        envelope: &EventEnvelope,
    ) -> CoreResult<()> {
        let event: PaymentSucceededEvent = envelope.decode()?;
        let event_id = envelope.event_id;

        conn.transaction::<_, CoreError, _>(|conn| {
            Box::pin(async move {
                service::transition_order(
                    conn,
                    event.order_id,
                    OrderStatus::Confirmed,
                    SAGA_ACTOR,
                    None,
                )
                .await?;
                record_processed(conn, event_id).await
            })
        })
        .await
    }

    async fn on_payment_failed(
        &self,
        conn: &mut AsyncPgConnection,
        envelope: &EventEnvelope,
    ) -> CoreResult<()> {
        let event: PaymentFailedEvent = envelope.decode()?;
        let event_id = envelope.event_id;
        let reason = format!("payment failed: {}", event.reason);

        conn.transaction::<_, CoreError, _>(|conn| {
            Box::pin(async move {
                service::cancel_order_tx(conn, event.order_id, &reason, SAGA_ACTOR).await?;
                record_processed(conn, event_id).await
            })
        })
        .await
    }
}

fn decode_envelope(m: &BorrowedMessage<'_>) -> CoreResult<EventEnvelope> {
    let payload = m
        .payload()
        .ok_or_else(|| CoreError::Validation("empty message payload".into()))?;
    Ok(serde_json::from_slice(payload)?)
}

async fn already_processed(conn: &mut AsyncPgConnection, event_id: Uuid) -> CoreResult<bool> {
    let found: Option<ProcessedEventRow> = processed_events::table
        .find(event_id)
        .first(conn)
        .await
        .optional()?;
    Ok(found.is_some())
}

async fn record_processed(conn: &mut AsyncPgConnection, event_id: Uuid) -> CoreResult<()> {
    // A duplicate that raced past the pre-check hits the primary key here
    // and rolls its whole transaction back, side effects included.
    diesel::insert_into(processed_events::table)
        .values(&NewProcessedEvent { event_id })
        .execute(conn)
        .await
        .map_err(|e| CoreError::unique_conflict(e, "processed event", event_id))?;
    Ok(())
}
