use std::time::Duration;

use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::Serialize;
use tokio::time;
use tracing::{debug, error, info};
use uuid::Uuid;

use shared::{CoreError, CoreResult, EventType};

use crate::models::{NewOutboxEvent, OutboxEventRow};
use crate::schema::outbox_events;

type DbPool = Pool<AsyncPgConnection>;

/// Writes an outbox row on the caller's open transaction. Reservation
/// outcomes and the stock mutations that caused them either commit
/// together or roll back together.
pub async fn publish<T: Serialize>(
    conn: &mut AsyncPgConnection,
    aggregate_type: &str,
    aggregate_id: &str,
    event_type: EventType,
    payload: &T,
) -> CoreResult<Uuid> {
    let row = NewOutboxEvent {
        id: Uuid::new_v4(),
        aggregate_type: aggregate_type.to_string(),
        aggregate_id: aggregate_id.to_string(),
        event_type: event_type.name(),
        payload: serde_json::to_value(payload)?,
    };

    diesel::insert_into(outbox_events::table)
        .values(&row)
        .execute(conn)
        .await?;

    debug!(event_id = %row.id, event_type = %row.event_type, aggregate_id, "outbox event written");
    Ok(row.id)
}

/// Polls unprocessed outbox rows and publishes them to Kafka, oldest first,
/// claiming one row per transaction so no lock outlives a single send.
/// Sends that fail are left unprocessed for the next cycle, so delivery is
/// at-least-once and consumers dedupe on event id.
pub struct OutboxRelay {
    pool: DbPool,
    producer: FutureProducer,
    poll_interval: Duration,
    batch_size: i64,
}

impl OutboxRelay {
    pub fn new(
        pool: DbPool,
        producer: FutureProducer,
        poll_interval: Duration,
        batch_size: i64,
    ) -> Self {
        Self {
            pool,
            producer,
            poll_interval,
            batch_size,
        }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(self.poll_interval);
        loop {
            interval.tick().await;
            match self.drain_batch().await {
                Ok(0) => {}
                Ok(n) => info!(published = n, "outbox batch drained"),
                Err(e) => error!(error = %e, "outbox poll cycle failed"),
            }
        }
    }

    async fn drain_batch(&self) -> CoreResult<usize> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| CoreError::Persistence(e.to_string()))?;

        let mut published = 0;
        let mut failed: Vec<Uuid> = Vec::new();

        while published + failed.len() < self.batch_size as usize {
            let producer = self.producer.clone();
            let exclude = failed.clone();

            let outcome = conn
                .transaction::<_, CoreError, _>(|conn| {
                    Box::pin(async move {
                        // SKIP LOCKED keeps concurrent relay instances off
                        // each other's rows; the lock drops when this
                        // single-event transaction commits.
                        let next: Option<OutboxEventRow> = outbox_events::table
                            .filter(outbox_events::processed.eq(false))
                            .filter(outbox_events::id.ne_all(exclude))
                            .order(outbox_events::created_at.asc())
                            .for_update()
                            .skip_locked()
                            .first(conn)
                            .await
                            .optional()?;

                        let Some(event) = next else {
                            return Ok(ClaimOutcome::Empty);
                        };

                        match send_event(&producer, &event).await {
                            Ok(()) => {
                                diesel::update(outbox_events::table.find(event.id))
                                    .set(outbox_events::processed.eq(true))
                                    .execute(conn)
                                    .await?;
                                Ok(ClaimOutcome::Published)
                            }
                            Err(e) => {
                                error!(event_id = %event.id, event_type = %event.event_type, error = %e,
                                    "failed to publish outbox event");
                                Ok(ClaimOutcome::SendFailed(event.id))
                            }
                        }
                    })
                })
                .await?;

            if !advance_cycle(outcome, &mut published, &mut failed) {
                break;
            }
        }
        Ok(published)
    }
}

/// Outcome of one claim transaction within a poll cycle.
#[derive(Debug, PartialEq, Eq)]
enum ClaimOutcome {
    Empty,
    Published,
    SendFailed(Uuid),
}

/// Failed events are set aside for the rest of the cycle so the rows behind
/// them still get published; an empty claim ends the cycle.
fn advance_cycle(outcome: ClaimOutcome, published: &mut usize, failed: &mut Vec<Uuid>) -> bool {
    match outcome {
        ClaimOutcome::Empty => false,
        ClaimOutcome::Published => {
            *published += 1;
            true
        }
        ClaimOutcome::SendFailed(id) => {
            failed.push(id);
            true
        }
    }
}

async fn send_event(producer: &FutureProducer, event: &OutboxEventRow) -> CoreResult<()> {
    let event_type: EventType = event.event_type.parse()?;
    let json = serde_json::to_string(&event.envelope())?;

    let record = FutureRecord::to(event_type.topic())
        .payload(&json)
        .key(&event.aggregate_id);

    producer
        .send(record, Duration::from_secs(5))
        .await
        .map_err(|(e, _)| {
            CoreError::Transport(format!("send of {} failed: {e}", event.event_type))
        })?;

    debug!(event_id = %event.id, topic = event_type.topic(), "outbox event published");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_failed_send_does_not_stall_the_cycle() {
        let mut published = 0;
        let mut failed = Vec::new();
        let id = Uuid::new_v4();

        assert!(advance_cycle(ClaimOutcome::SendFailed(id), &mut published, &mut failed));
        assert!(advance_cycle(ClaimOutcome::Published, &mut published, &mut failed));
        assert!(!advance_cycle(ClaimOutcome::Empty, &mut published, &mut failed));
        assert_eq!(published, 1);
        assert_eq!(failed, vec![id]);
    }
}
