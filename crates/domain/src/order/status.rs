//! Order status state machine.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::OrderError;

/// The status of an order in its lifecycle.
///
/// The checkout saga drives an order through:
/// ```text
/// Pending ──► Reserving ──► ItemsReserved ──► CartCleared ──► Completed
///    │            │               │                              │
///    └────────────┴───────────────┴──► Compensating ──┬──► Compensated
///                                                      └──► Failed
/// ```
///
/// Once `Completed`, fulfillment updates come from outside the saga:
/// ```text
/// Completed ──► Processing ──► Shipped ──► Delivered
///     │             │
///     └─────────────┴──► Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Order built from the cart snapshot but not yet persisted.
    #[default]
    Pending,

    /// Order persisted, stock reservations in progress.
    Reserving,

    /// Every item has a logged stock reservation.
    ItemsReserved,

    /// The buyer's cart has been cleared.
    CartCleared,

    /// Checkout finished successfully.
    Completed,

    /// A step failed and logged reservations are being released.
    Compensating,

    /// Every logged reservation was released (terminal).
    Compensated,

    /// A compensation could not be applied; needs operator reconciliation (terminal).
    Failed,

    /// Fulfillment started.
    Processing,

    /// Handed to the carrier.
    Shipped,

    /// Received by the buyer (terminal).
    Delivered,

    /// Cancelled after checkout (terminal).
    Cancelled,
}

impl OrderStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [OrderStatus; 12] = [
        OrderStatus::Pending,
        OrderStatus::Reserving,
        OrderStatus::ItemsReserved,
        OrderStatus::CartCleared,
        OrderStatus::Completed,
        OrderStatus::Compensating,
        OrderStatus::Compensated,
        OrderStatus::Failed,
        OrderStatus::Processing,
        OrderStatus::Shipped,
        OrderStatus::Delivered,
        OrderStatus::Cancelled,
    ];

    /// Returns true if `next` is a legal successor of this status.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Reserving)
                | (Pending, Compensating)
                | (Reserving, ItemsReserved)
                | (Reserving, Compensating)
                | (ItemsReserved, CartCleared)
                | (ItemsReserved, Completed)
                | (ItemsReserved, Compensating)
                | (CartCleared, Completed)
                | (Compensating, Compensated)
                | (Compensating, Failed)
                | (Completed, Processing)
                | (Completed, Cancelled)
                | (Processing, Shipped)
                | (Processing, Cancelled)
                | (Shipped, Delivered)
        )
    }

    /// Returns an error unless `next` is a legal successor.
    pub fn ensure_transition(&self, next: OrderStatus) -> Result<(), OrderError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(OrderError::InvalidStateTransition {
                from: *self,
                to: next,
            })
        }
    }

    /// Returns true while the checkout saga still owns the order.
    ///
    /// These are the statuses the recovery sweep looks for.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending
                | OrderStatus::Reserving
                | OrderStatus::ItemsReserved
                | OrderStatus::CartCleared
                | OrderStatus::Compensating
        )
    }

    /// Returns true once the saga has finished, successfully or not.
    pub fn is_saga_terminal(&self) -> bool {
        !self.is_in_flight()
    }

    /// Returns true for statuses that may only be set by fulfillment updates.
    pub fn is_fulfillment(&self) -> bool {
        matches!(
            self,
            OrderStatus::Processing
                | OrderStatus::Shipped
                | OrderStatus::Delivered
                | OrderStatus::Cancelled
        )
    }

    /// Returns true if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        OrderStatus::ALL
            .iter()
            .all(|next| !self.can_transition_to(*next))
    }

    /// Returns the status name as stored and serialized.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Reserving => "reserving",
            OrderStatus::ItemsReserved => "items_reserved",
            OrderStatus::CartCleared => "cart_cleared",
            OrderStatus::Completed => "completed",
            OrderStatus::Compensating => "compensating",
            OrderStatus::Compensated => "compensated",
            OrderStatus::Failed => "failed",
            OrderStatus::Processing => "processing",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| OrderError::UnknownStatus(s.to_string()))
    }
}
