use bigdecimal::BigDecimal;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use shared::{
    CoreError, CoreResult, EventType, LineItem, OrderCancelledEvent, OrderCreatedEvent,
    OrderStatus, OrderStatusChangedEvent, AGGREGATE_ORDER,
};

use crate::models::*;
use crate::outbox;
use crate::schema::*;

pub type DbPool = Pool<AsyncPgConnection>;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateOrderCommand {
    pub customer_id: Uuid,
    pub order_type: String,
    pub currency: String,
    pub items: Vec<LineItemCommand>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LineItemCommand {
    pub product_id: Uuid,
    pub sku: String,
    pub quantity: i32,
    pub unit_price: BigDecimal,
    #[serde(default)]
    pub discount: Option<BigDecimal>,
}

impl LineItemCommand {
    pub fn total_price(&self) -> BigDecimal {
        self.unit_price.clone() * BigDecimal::from(self.quantity)
            - self.discount.clone().unwrap_or_default()
    }
}

pub fn order_total(items: &[LineItemCommand]) -> BigDecimal {
    items
        .iter()
        .map(LineItemCommand::total_price)
        .sum::<BigDecimal>()
}

fn validate(cmd: &CreateOrderCommand) -> CoreResult<()> {
    if cmd.items.is_empty() {
        return Err(CoreError::Validation("order has no line items".into()));
    }
    if cmd.currency.trim().is_empty() {
        return Err(CoreError::Validation("currency is required".into()));
    }
    for item in &cmd.items {
        if item.quantity <= 0 {
            return Err(CoreError::Validation(format!(
                "non-positive quantity {} for sku {}",
                item.quantity, item.sku
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct OrderDetails {
    pub order: OrderRow,
    pub items: Vec<OrderItemRow>,
    pub history: Vec<StatusHistoryRow>,
}

/// Result of a status transition attempt inside a transaction.
#[derive(Debug)]
pub enum StatusChange {
    Applied { old_status: OrderStatus },
    NoOp,
    /// The order has already moved past (or out of) the requested status.
    /// Saga handlers treat this as a tolerated late arrival; the HTTP
    /// surface turns it back into a validation error.
    Superseded { current: OrderStatus },
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum TransitionKind {
    Apply,
    Repeat,
    Stale,
}

/// How a requested status relates to the order's current one. Outcome
/// events can arrive out of order or after a cancellation, so a rejected
/// transition is ordinary traffic, not a caller mistake.
pub(crate) fn classify_transition(current: OrderStatus, requested: OrderStatus) -> TransitionKind {
    if current == requested {
        TransitionKind::Repeat
    } else if current.can_transition_to(requested) {
        TransitionKind::Apply
    } else {
        TransitionKind::Stale
    }
}

#[derive(Clone)]
pub struct OrderService {
    pool: DbPool,
}

impl OrderService {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn conn(
        &self,
    ) -> CoreResult<diesel_async::pooled_connection::bb8::PooledConnection<'_, AsyncPgConnection>> {
        self.pool
            .get()
            .await
            .map_err(|e| CoreError::Persistence(e.to_string()))
    }

    pub async fn create_order(&self, cmd: CreateOrderCommand) -> CoreResult<Uuid> {
        validate(&cmd)?;

        let order_id = Uuid::new_v4();
        let now = Utc::now();
        let total = order_total(&cmd.items);

        let item_rows: Vec<NewOrderItem> = cmd
            .items
            .iter()
            .map(|i| NewOrderItem {
                id: Uuid::new_v4(),
                order_id,
                product_id: i.product_id,
                sku: i.sku.clone(),
                quantity: i.quantity,
                unit_price: i.unit_price.clone(),
                discount: i.discount.clone().unwrap_or_default(),
                total_price: i.total_price(),
            })
            .collect();

        let event = OrderCreatedEvent {
            order_id,
            customer_id: cmd.customer_id,
            order_type: cmd.order_type.clone(),
            items: item_rows
                .iter()
                .map(|r| LineItem {
                    product_id: r.product_id,
                    sku: r.sku.clone(),
                    quantity: r.quantity,
                    unit_price: r.unit_price.clone(),
                    discount: r.discount.clone(),
                    total_price: r.total_price.clone(),
                })
                .collect(),
            total_amount: total.clone(),
            currency: cmd.currency.clone(),
            created_at: now,
        };

        let new_order = NewOrder {
            id: order_id,
            customer_id: cmd.customer_id,
            order_type: cmd.order_type,
            currency: cmd.currency,
            total_amount: total,
            current_status: OrderStatus::Created.as_str().to_string(),
            version: 0,
        };

        let mut conn = self.conn().await?;
        conn.transaction::<_, CoreError, _>(|conn| {
            Box::pin(async move {
                diesel::insert_into(orders::table)
                    .values(&new_order)
                    .execute(conn)
                    .await?;

                diesel::insert_into(order_items::table)
                    .values(&item_rows)
                    .execute(conn)
                    .await?;

                diesel::insert_into(order_status_history::table)
                    .values(&NewStatusHistory {
                        id: Uuid::new_v4(),
                        order_id,
                        old_status: None,
                        new_status: OrderStatus::Created.as_str().to_string(),
                        changed_by: "system".to_string(),
                        metadata: None,
                    })
                    .execute(conn)
                    .await?;

                outbox::publish(
                    conn,
                    AGGREGATE_ORDER,
                    &order_id.to_string(),
                    EventType::OrderCreated,
                    &event,
                )
                .await?;

                Ok(())
            })
        })
        .await?;

        info!(%order_id, "order created");
        Ok(order_id)
    }

    pub async fn update_order_status(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
        changed_by: &str,
    ) -> CoreResult<()> {
        let changed_by = changed_by.to_string();
        let mut conn = self.conn().await?;
        let change = conn
            .transaction::<_, CoreError, _>(|conn| {
                Box::pin(
                    async move { transition_order(conn, order_id, new_status, &changed_by, None).await },
                )
            })
            .await?;
        if let StatusChange::Superseded { current } = change {
            return Err(CoreError::Validation(format!(
                "illegal status transition {current} -> {new_status} for order {order_id}"
            )));
        }
        Ok(())
    }

    /// Cancels an order: the `cancelled` status change plus a second, distinct
    /// `order.cancelled` event carrying the reason. Both outbox rows commit in
    /// the one transaction, so neither is visible to the relay before commit.
    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        reason: &str,
        changed_by: &str,
    ) -> CoreResult<()> {
        let reason = reason.to_string();
        let changed_by = changed_by.to_string();
        let mut conn = self.conn().await?;
        let change = conn
            .transaction::<_, CoreError, _>(|conn| {
                Box::pin(async move { cancel_order_tx(conn, order_id, &reason, &changed_by).await })
            })
            .await?;
        if let StatusChange::Superseded { current } = change {
            return Err(CoreError::Validation(format!(
                "cannot cancel order {order_id} in status {current}"
            )));
        }
        Ok(())
    }

    pub async fn get_order(&self, order_id: Uuid) -> CoreResult<OrderDetails> {
        let mut conn = self.conn().await?;

        let order: OrderRow = orders::table
            .find(order_id)
            .first(&mut conn)
            .await
            .optional()?
            .ok_or_else(|| CoreError::not_found("order", order_id))?;

        let items = order_items::table
            .filter(order_items::order_id.eq(order_id))
            .order(order_items::sku.asc())
            .load(&mut conn)
            .await?;

        let history = order_status_history::table
            .filter(order_status_history::order_id.eq(order_id))
            .order(order_status_history::changed_at.asc())
            .load(&mut conn)
            .await?;

        Ok(OrderDetails {
            order,
            items,
            history,
        })
    }
}

/// Moves an order to `new_status` inside the caller's transaction: version-
/// checked UPDATE, one history row, one `order.status.<new>` outbox row.
/// A repeated target status is an idempotent no-op that writes nothing, and
/// a stale request (the order is terminal or already further along) returns
/// `Superseded` rather than an error so consumers can commit past it.
pub(crate) async fn transition_order(
    conn: &mut AsyncPgConnection,
    order_id: Uuid,
    new_status: OrderStatus,
    changed_by: &str,
    metadata: Option<serde_json::Value>,
) -> CoreResult<StatusChange> {
    let order: OrderRow = orders::table
        .find(order_id)
        .first(conn)
        .await
        .optional()?
        .ok_or_else(|| CoreError::not_found("order", order_id))?;

    let old_status = order.status()?;
    match classify_transition(old_status, new_status) {
        TransitionKind::Repeat => {
            warn!(%order_id, status = %new_status, "order already in target status, no update performed");
            return Ok(StatusChange::NoOp);
        }
        TransitionKind::Stale => {
            warn!(%order_id, current = %old_status, requested = %new_status,
                "stale status transition ignored");
            return Ok(StatusChange::Superseded {
                current: old_status,
            });
        }
        TransitionKind::Apply => {}
    }

    let updated = diesel::update(
        orders::table
            .find(order_id)
            .filter(orders::version.eq(order.version)),
    )
    .set((
        orders::current_status.eq(new_status.as_str()),
        orders::version.eq(order.version + 1),
        orders::updated_at.eq(Utc::now()),
    ))
    .execute(conn)
    .await?;
    if updated == 0 {
        return Err(CoreError::conflict("order", order_id));
    }

    diesel::insert_into(order_status_history::table)
        .values(&NewStatusHistory {
            id: Uuid::new_v4(),
            order_id,
            old_status: Some(old_status.as_str().to_string()),
            new_status: new_status.as_str().to_string(),
            changed_by: changed_by.to_string(),
            metadata,
        })
        .execute(conn)
        .await?;

    let event = OrderStatusChangedEvent {
        order_id,
        old_status: Some(old_status),
        new_status,
        changed_by: changed_by.to_string(),
        changed_at: Utc::now(),
    };
    outbox::publish(
        conn,
        AGGREGATE_ORDER,
        &order_id.to_string(),
        EventType::OrderStatusChanged(new_status),
        &event,
    )
    .await?;

    info!(%order_id, from = %old_status, to = %new_status, by = changed_by, "order status updated");
    Ok(StatusChange::Applied { old_status })
}

/// Cancellation path shared by the API and the saga coordinator. Must run
/// inside an open transaction.
pub(crate) async fn cancel_order_tx(
    conn: &mut AsyncPgConnection,
    order_id: Uuid,
    reason: &str,
    changed_by: &str,
) -> CoreResult<StatusChange> {
    let change = transition_order(
        conn,
        order_id,
        OrderStatus::Cancelled,
        changed_by,
        Some(serde_json::json!({ "reason": reason })),
    )
    .await?;

    if let StatusChange::Applied { .. } = change {
        let event = OrderCancelledEvent {
            order_id,
            reason: reason.to_string(),
            cancelled_at: Utc::now(),
        };
        outbox::publish(
            conn,
            AGGREGATE_ORDER,
            &order_id.to_string(),
            EventType::OrderCancelled,
            &event,
        )
        .await?;
        info!(%order_id, %reason, "order cancelled");
    }
    Ok(change)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    fn item(sku: &str, quantity: i32, unit_price: &str, discount: Option<&str>) -> LineItemCommand {
        LineItemCommand {
            product_id: Uuid::new_v4(),
            sku: sku.into(),
            quantity,
            unit_price: dec(unit_price),
            discount: discount.map(dec),
        }
    }

    #[test]
    fn item_total_is_price_times_quantity_minus_discount() {
        assert_eq!(item("A", 3, "19.99", None).total_price(), dec("59.97"));
        assert_eq!(item("A", 2, "10.00", Some("2.50")).total_price(), dec("17.50"));
    }

    #[test]
    fn order_total_is_the_sum_of_item_totals() {
        let items = vec![
            item("A", 5, "10.00", None),
            item("B", 20, "1.25", Some("5.00")),
        ];
        assert_eq!(order_total(&items), dec("70.00"));
        assert_eq!(
            order_total(&items),
            items.iter().map(|i| i.total_price()).sum::<BigDecimal>()
        );
    }

    // A partial reservation failure cancels the order; the sibling success
    // event for the other SKU then arrives against a cancelled order and
    // must classify as stale, never as an error the consumer cannot get
    // past.
    #[test]
    fn outcomes_after_cancellation_are_stale_not_errors() {
        use OrderStatus::*;
        assert_eq!(classify_transition(Cancelled, Paid), TransitionKind::Stale);
        assert_eq!(classify_transition(Cancelled, Confirmed), TransitionKind::Stale);
        assert_eq!(classify_transition(Completed, Paid), TransitionKind::Stale);
    }

    #[test]
    fn late_and_duplicate_outcomes_classify_without_erroring() {
        use OrderStatus::*;
        assert_eq!(classify_transition(Created, Paid), TransitionKind::Apply);
        assert_eq!(classify_transition(Paid, Paid), TransitionKind::Repeat);
        // Order already advanced past the requested status.
        assert_eq!(classify_transition(Confirmed, Paid), TransitionKind::Stale);
    }

    #[test]
    fn empty_orders_are_rejected() {
        let cmd = CreateOrderCommand {
            customer_id: Uuid::new_v4(),
            order_type: "customer".into(),
            currency: "USD".into(),
            items: vec![],
        };
        assert!(matches!(validate(&cmd), Err(CoreError::Validation(_))));
    }

    #[test]
    fn non_positive_quantities_are_rejected() {
        let cmd = CreateOrderCommand {
            customer_id: Uuid::new_v4(),
            order_type: "customer".into(),
            currency: "USD".into(),
            items: vec![item("A", 0, "10.00", None)],
        };
        assert!(matches!(validate(&cmd), Err(CoreError::Validation(_))));
    }

    #[test]
    fn missing_currency_is_rejected() {
        let cmd = CreateOrderCommand {
            customer_id: Uuid::new_v4(),
            order_type: "customer".into(),
            currency: " ".into(),
            items: vec![item("A", 1, "10.00", None)],
        };
        assert!(matches!(validate(&cmd), Err(CoreError::Validation(_))));
    }
}
