use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::BorrowedMessage;
use rdkafka::Message;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use shared::{
    CoreError, CoreResult, EventEnvelope, EventType, ReservationFailedEvent,
    ReservationFailureReason, ReservationItem, ReservationRequestedEvent,
    ReservationSucceededEvent, AGGREGATE_INVENTORY,
};

use crate::models::{NewProcessedEvent, ProcessedEventRow, StockLevelRow};
use crate::outbox;
use crate::schema::{processed_events, stock_levels};

type DbPool = Pool<AsyncPgConnection>;

/// What to do with a single line item, given the stock row as read.
#[derive(Debug, PartialEq, Eq)]
pub enum ReservationDecision {
    Skip,
    Fail {
        reason: ReservationFailureReason,
        requested: Option<i32>,
        available: Option<i32>,
    },
    Reserve {
        new_available: i32,
        new_reserved: i32,
        expected_version: i32,
    },
}

/// Pure decision step of the reservation algorithm. Non-positive quantities
/// are skipped without an event; everything else yields exactly one outcome
/// event per item.
pub fn decide(stock: Option<&StockLevelRow>, requested: i32) -> ReservationDecision {
    if requested <= 0 {
        return ReservationDecision::Skip;
    }
    match stock {
        None => ReservationDecision::Fail {
            reason: ReservationFailureReason::UnknownSku,
            requested: None,
            available: None,
        },
        Some(s) if s.available < requested => ReservationDecision::Fail {
            reason: ReservationFailureReason::InsufficientStock,
            requested: Some(requested),
            available: Some(s.available),
        },
        Some(s) => ReservationDecision::Reserve {
            new_available: s.available - requested,
            new_reserved: s.reserved + requested,
            expected_version: s.version,
        },
    }
}

/// Consumes reservation requests and applies stock deltas under optimistic
/// locking. Items are judged independently: one unknown or exhausted SKU
/// never blocks reservation of the others. All outcomes of one request plus
/// the dedupe record commit in a single transaction.
pub struct ReservationEngine {
    pool: DbPool,
}

impl ReservationEngine {
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
                            if let Err(e) = self.handle_envelope(&envelope).await {
                                error!(event_id = %envelope.event_id, error = %e,
                                    "reservation handler failed, leaving offset for redelivery");
                                continue;
                            }
                        }
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

    async fn handle_envelope(&self, envelope: &EventEnvelope) -> CoreResult<()> {
        match envelope.event_type.parse::<EventType>() {
            Ok(EventType::ReservationRequested) => {}
            _ => {
                debug!(event_type = %envelope.event_type, "ignoring event type");
                return Ok(());
            }
        }
        let request: ReservationRequestedEvent = envelope.decode()?;
        self.handle_reservation_request(envelope.event_id, request)
            .await
    }

    pub async fn handle_reservation_request(
        &self,
        event_id: Uuid,
        request: ReservationRequestedEvent,
    ) -> CoreResult<()> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| CoreError::Persistence(e.to_string()))?;

        if already_processed(&mut conn, event_id).await? {
            info!(%event_id, order_id = %request.order_id, "duplicate reservation request, skipping");
            return Ok(());
        }
        if request.items.is_empty() {
            warn!(order_id = %request.order_id, "reservation request has no items");
        }

        let order_id = request.order_id;
        conn.transaction::<_, CoreError, _>(|conn| {
            Box::pin(async move {
                for item in &request.items {
                    process_item(conn, order_id, item).await?;
                }
                record_processed(conn, event_id).await
            })
        })
        .await?;

        info!(%order_id, "reservation request handled");
        Ok(())
    }
}

/// Runs one item inside a savepoint: a database failure rolls back only
/// that item's writes and is reported as a processing-error outcome, so the
/// remaining items stay independent and the item is not retried internally.
async fn process_item(
    conn: &mut AsyncPgConnection,
    order_id: Uuid,
    item: &ReservationItem,
) -> CoreResult<()> {
    let applied = conn
        .transaction::<_, CoreError, _>(|conn| {
            Box::pin(async move { apply_item(conn, order_id, item).await })
        })
        .await;

    if let Err(e) = applied {
        warn!(sku = %item.sku, %order_id, error = %e, "item processing failed");
        publish_failure(conn, &processing_error_event(order_id, item, e.to_string())).await?;
    }
    Ok(())
}

async fn apply_item(
    conn: &mut AsyncPgConnection,
    order_id: Uuid,
    item: &ReservationItem,
) -> CoreResult<()> {
    let stock: Option<StockLevelRow> = stock_levels::table
        .find(&item.sku)
        .first(conn)
        .await
        .optional()?;

    match decide(stock.as_ref(), item.quantity) {
        ReservationDecision::Skip => {
            warn!(sku = %item.sku, quantity = item.quantity, "skipping non-positive quantity");
        }
        ReservationDecision::Fail {
            reason,
            requested,
            available,
        } => {
            warn!(sku = %item.sku, %order_id, %reason, "reservation rejected");
            let event = ReservationFailedEvent {
                order_id,
                sku: item.sku.clone(),
                reason,
                requested_quantity: requested,
                available_quantity: available,
                detail: None,
            };
            publish_failure(conn, &event).await?;
        }
        ReservationDecision::Reserve {
            new_available,
            new_reserved,
            expected_version,
        } => {
            let updated = diesel::update(
                stock_levels::table
                    .find(&item.sku)
                    .filter(stock_levels::version.eq(expected_version)),
            )
            .set((
                stock_levels::available.eq(new_available),
                stock_levels::reserved.eq(new_reserved),
                stock_levels::version.eq(expected_version + 1),
                stock_levels::updated_at.eq(Utc::now()),
            ))
            .execute(conn)
            .await?;

            if updated == 0 {
                // Lost the race to a concurrent writer. Not retried here; the
                // saga decides what to do with the order.
                warn!(sku = %item.sku, %order_id, "optimistic lock conflict on stock level");
                publish_failure(
                    conn,
                    &processing_error_event(order_id, item, "optimistic lock conflict".to_string()),
                )
                .await?;
            } else {
                info!(sku = %item.sku, %order_id, quantity = item.quantity,
                    available = new_available, reserved = new_reserved, "stock reserved");
                let event = ReservationSucceededEvent {
                    order_id,
                    sku: item.sku.clone(),
                    quantity: item.quantity,
                };
                outbox::publish(
                    conn,
                    AGGREGATE_INVENTORY,
                    &item.sku,
                    EventType::ReservationSucceeded,
                    &event,
                )
                .await?;
            }
        }
    }
    Ok(())
}

/// Failure event for an item the engine could not judge or apply, carrying
/// the error detail for operators.
fn processing_error_event(
    order_id: Uuid,
    item: &ReservationItem,
    detail: String,
) -> ReservationFailedEvent {
    ReservationFailedEvent {
        order_id,
        sku: item.sku.clone(),
        reason: ReservationFailureReason::ReservationProcessingError,
        requested_quantity: Some(item.quantity),
        available_quantity: None,
        detail: Some(detail),
    }
}

async fn publish_failure(
    conn: &mut AsyncPgConnection,
    event: &ReservationFailedEvent,
) -> CoreResult<()> {
    outbox::publish(
        conn,
        AGGREGATE_INVENTORY,
        &event.sku,
        EventType::ReservationFailed,
        event,
    )
    .await?;
    Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;

    fn stock(sku: &str, available: i32, reserved: i32, version: i32) -> StockLevelRow {
        StockLevelRow {
            sku: sku.into(),
            available,
            reserved,
            version,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn non_positive_quantities_are_skipped_silently() {
        let s = stock("SKU-A", 10, 0, 0);
        assert_eq!(decide(Some(&s), 0), ReservationDecision::Skip);
        assert_eq!(decide(Some(&s), -3), ReservationDecision::Skip);
        // Even for a SKU that does not exist.
        assert_eq!(decide(None, 0), ReservationDecision::Skip);
    }

    // A database failure on one item must surface as an outcome event the
    // saga can act on, not abort the whole request into redelivery.
    #[test]
    fn database_failures_become_processing_error_outcomes() {
        let item = ReservationItem {
            sku: "SKU-D".into(),
            quantity: 2,
        };
        let order_id = Uuid::new_v4();
        let ev = processing_error_event(order_id, &item, "connection reset by peer".into());
        assert_eq!(ev.order_id, order_id);
        assert_eq!(ev.reason, ReservationFailureReason::ReservationProcessingError);
        assert_eq!(ev.requested_quantity, Some(2));
        assert_eq!(ev.available_quantity, None);
        assert_eq!(ev.detail.as_deref(), Some("connection reset by peer"));
    }

    #[test]
    fn unknown_sku_fails_without_quantities() {
        assert_eq!(
            decide(None, 5),
            ReservationDecision::Fail {
                reason: ReservationFailureReason::UnknownSku,
                requested: None,
                available: None,
            }
        );
    }

    #[test]
    fn insufficient_stock_reports_requested_and_available() {
        let s = stock("SKU-B", 5, 0, 0);
        assert_eq!(
            decide(Some(&s), 20),
            ReservationDecision::Fail {
                reason: ReservationFailureReason::InsufficientStock,
                requested: Some(20),
                available: Some(5),
            }
        );
    }

    #[test]
    fn successful_reservation_moves_quantity_from_available_to_reserved() {
        let s = stock("SKU-A", 10, 0, 4);
        assert_eq!(
            decide(Some(&s), 5),
            ReservationDecision::Reserve {
                new_available: 5,
                new_reserved: 5,
                expected_version: 4,
            }
        );
    }

    #[test]
    fn exact_remaining_stock_is_reservable() {
        let s = stock("SKU-A", 5, 2, 0);
        assert_eq!(
            decide(Some(&s), 5),
            ReservationDecision::Reserve {
                new_available: 0,
                new_reserved: 7,
                expected_version: 0,
            }
        );
    }

    // The two-item partial-success scenario: SKU-A (qty 5 of 10) reserves,
    // SKU-B (qty 20 of 5) fails, independently.
    #[test]
    fn multi_item_requests_succeed_and_fail_per_item() {
        let a = stock("SKU-A", 10, 0, 0);
        let b = stock("SKU-B", 5, 0, 0);

        assert_eq!(
            decide(Some(&a), 5),
            ReservationDecision::Reserve {
                new_available: 5,
                new_reserved: 5,
                expected_version: 0,
            }
        );
        assert_eq!(
            decide(Some(&b), 20),
            ReservationDecision::Fail {
                reason: ReservationFailureReason::InsufficientStock,
                requested: Some(20),
                available: Some(5),
            }
        );
    }

    // Two concurrent attempts at available=5, each wanting 3: both decide to
    // reserve against the same version; whoever commits second sees 0 rows
    // updated and reports a processing error instead of driving stock
    // negative.
    #[test]
    fn concurrent_attempts_target_the_same_version() {
        let before = stock("SKU-C", 5, 0, 7);
        let first = decide(Some(&before), 3);
        let second = decide(Some(&before), 3);
        assert_eq!(
            first,
            ReservationDecision::Reserve {
                new_available: 2,
                new_reserved: 3,
                expected_version: 7,
            }
        );
        assert_eq!(first, second);

        // After the winner commits, a re-read decides against the new state.
        let after = stock("SKU-C", 2, 3, 8);
        assert_eq!(
            decide(Some(&after), 3),
            ReservationDecision::Fail {
                reason: ReservationFailureReason::InsufficientStock,
                requested: Some(3),
                available: Some(2),
            }
        );
    }
}
