use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;
use crate::status::OrderStatus;

pub const TOPIC_ORDER_EVENTS: &str = "order-events";
pub const TOPIC_INVENTORY_COMMANDS: &str = "inventory-commands";
pub const TOPIC_INVENTORY_EVENTS: &str = "inventory-events";
pub const TOPIC_PAYMENT_COMMANDS: &str = "payment-commands";
pub const TOPIC_PAYMENT_EVENTS: &str = "payment-events";

/// Closed mapping from logical event type to wire name and transport topic.
///
/// The outbox writer only accepts this enum, so an outbox row can never
/// carry an event type the relay does not know how to route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    OrderCreated,
    OrderStatusChanged(OrderStatus),
    OrderCancelled,
    ReservationRequested,
    ReservationSucceeded,
    ReservationFailed,
    PaymentRequested,
    PaymentSucceeded,
    PaymentFailed,
}

impl EventType {
    pub fn name(&self) -> String {
        match self {
            EventType::OrderCreated => "order.created".to_string(),
            EventType::OrderStatusChanged(s) => format!("order.status.{}", s.as_str()),
            EventType::OrderCancelled => "order.cancelled".to_string(),
            EventType::ReservationRequested => "inventory.reservation.requested".to_string(),
            EventType::ReservationSucceeded => "inventory.reservation.succeeded".to_string(),
            EventType::ReservationFailed => "inventory.reservation.failed".to_string(),
            EventType::PaymentRequested => "order.payment.requested".to_string(),
            EventType::PaymentSucceeded => "payment.succeeded".to_string(),
            EventType::PaymentFailed => "payment.failed".to_string(),
        }
    }

    pub const fn topic(&self) -> &'static str {
        match self {
            EventType::OrderCreated
            | EventType::OrderStatusChanged(_)
            | EventType::OrderCancelled => TOPIC_ORDER_EVENTS,
            EventType::ReservationRequested => TOPIC_INVENTORY_COMMANDS,
            EventType::ReservationSucceeded | EventType::ReservationFailed => {
                TOPIC_INVENTORY_EVENTS
            }
            EventType::PaymentRequested => TOPIC_PAYMENT_COMMANDS,
            EventType::PaymentSucceeded | EventType::PaymentFailed => TOPIC_PAYMENT_EVENTS,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl FromStr for EventType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(status) = s.strip_prefix("order.status.") {
            return Ok(EventType::OrderStatusChanged(status.parse()?));
        }
        match s {
            "order.created" => Ok(EventType::OrderCreated),
            "order.cancelled" => Ok(EventType::OrderCancelled),
            "inventory.reservation.requested" => Ok(EventType::ReservationRequested),
            "inventory.reservation.succeeded" => Ok(EventType::ReservationSucceeded),
            "inventory.reservation.failed" => Ok(EventType::ReservationFailed),
            "order.payment.requested" => Ok(EventType::PaymentRequested),
            "payment.succeeded" => Ok(EventType::PaymentSucceeded),
            "payment.failed" => Ok(EventType::PaymentFailed),
            other => Err(CoreError::Validation(format!(
                "unknown event type: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        let types = [
            EventType::OrderCreated,
            EventType::OrderStatusChanged(OrderStatus::Paid),
            EventType::OrderCancelled,
            EventType::ReservationRequested,
            EventType::ReservationFailed,
            EventType::PaymentRequested,
        ];
        for t in types {
            assert_eq!(t.name().parse::<EventType>().unwrap(), t);
        }
    }

    #[test]
    fn status_events_embed_the_status_name() {
        let t = EventType::OrderStatusChanged(OrderStatus::Confirmed);
        assert_eq!(t.name(), "order.status.confirmed");
    }

    #[test]
    fn unknown_names_do_not_parse() {
        assert!("order.exploded".parse::<EventType>().is_err());
        assert!("order.status.sideways".parse::<EventType>().is_err());
    }

    #[test]
    fn each_type_routes_to_its_topic() {
        assert_eq!(EventType::OrderCreated.topic(), TOPIC_ORDER_EVENTS);
        assert_eq!(
            EventType::OrderStatusChanged(OrderStatus::Paid).topic(),
            TOPIC_ORDER_EVENTS
        );
        assert_eq!(
            EventType::ReservationRequested.topic(),
            TOPIC_INVENTORY_COMMANDS
        );
        assert_eq!(EventType::ReservationFailed.topic(), TOPIC_INVENTORY_EVENTS);
        assert_eq!(EventType::PaymentRequested.topic(), TOPIC_PAYMENT_COMMANDS);
        assert_eq!(EventType::PaymentFailed.topic(), TOPIC_PAYMENT_EVENTS);
    }
}
