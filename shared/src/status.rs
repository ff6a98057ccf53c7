use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Order lifecycle. Orders only move forward through this sequence, except
/// that `Cancelled` is reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Created,
    Paid,
    Confirmed,
    Fulfilling,
    Shipped,
    Delivered,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "created",
            OrderStatus::Paid => "paid",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Fulfilling => "fulfilling",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }

    fn rank(&self) -> u8 {
        match self {
            OrderStatus::Created => 0,
            OrderStatus::Paid => 1,
            OrderStatus::Confirmed => 2,
            OrderStatus::Fulfilling => 3,
            OrderStatus::Shipped => 4,
            OrderStatus::Delivered => 5,
            OrderStatus::Completed => 6,
            OrderStatus::Cancelled => u8::MAX,
        }
    }

    /// Forward jumps are legal: saga outcomes can arrive out of order, and a
    /// skipped intermediate state must never wedge an order.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        if self.is_terminal() || next == *self {
            return false;
        }
        if next == OrderStatus::Cancelled {
            return true;
        }
        next.rank() > self.rank()
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(OrderStatus::Created),
            "paid" => Ok(OrderStatus::Paid),
            "confirmed" => Ok(OrderStatus::Confirmed),
            "fulfilling" => Ok(OrderStatus::Fulfilling),
            "shipped" => Ok(OrderStatus::Shipped),
            "delivered" => Ok(OrderStatus::Delivered),
            "completed" => Ok(OrderStatus::Completed),
            "cancelled" => Ok(OrderStatus::Cancelled),
            other => Err(CoreError::Validation(format!(
                "unknown order status: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::OrderStatus::*;

    #[test]
    fn forward_transitions_are_allowed() {
        assert!(Created.can_transition_to(Paid));
        assert!(Paid.can_transition_to(Confirmed));
        assert!(Confirmed.can_transition_to(Shipped));
    }

    #[test]
    fn forward_jumps_are_allowed() {
        assert!(Created.can_transition_to(Confirmed));
        assert!(Paid.can_transition_to(Delivered));
    }

    #[test]
    fn backward_transitions_are_rejected() {
        assert!(!Paid.can_transition_to(Created));
        assert!(!Delivered.can_transition_to(Confirmed));
    }

    #[test]
    fn same_status_is_not_a_transition() {
        assert!(!Paid.can_transition_to(Paid));
        assert!(!Cancelled.can_transition_to(Cancelled));
    }

    #[test]
    fn cancel_is_reachable_from_any_non_terminal_state() {
        for s in [Created, Paid, Confirmed, Fulfilling, Shipped, Delivered] {
            assert!(s.can_transition_to(Cancelled), "cannot cancel from {s}");
        }
    }

    #[test]
    fn nothing_leaves_a_terminal_state() {
        assert!(!Cancelled.can_transition_to(Created));
        assert!(!Cancelled.can_transition_to(Paid));
        assert!(!Completed.can_transition_to(Cancelled));
    }

    #[test]
    fn round_trips_through_strings() {
        for s in [Created, Paid, Cancelled] {
            assert_eq!(s.as_str().parse::<super::OrderStatus>().unwrap(), s);
        }
        assert!("unknown".parse::<super::OrderStatus>().is_err());
    }
}
