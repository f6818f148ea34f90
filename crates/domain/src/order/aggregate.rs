//! Order aggregate implementation.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use common::{OrderId, UserId};
use serde::{Deserialize, Serialize};

use super::{
    Compensation, Money, OrderError, OrderItem, OrderStatus, PaymentMethod, SagaStep, StepName,
    StepStatus,
};

/// Order aggregate root.
///
/// Holds the line items captured from the cart, the checkout status, and the
/// saga steps recorded while the order was being placed. The total is always
/// derived from the items and never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    id: OrderId,
    user_id: UserId,
    items: Vec<OrderItem>,
    status: OrderStatus,
    payment_method: PaymentMethod,
    address: String,
    saga_steps: Vec<SagaStep>,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// All persisted fields of an order, used by stores to rebuild the aggregate.
#[derive(Debug, Clone)]
pub struct OrderRecord {
    pub id: OrderId,
    pub user_id: UserId,
    pub items: Vec<OrderItem>,
    pub status: OrderStatus,
    pub payment_method: PaymentMethod,
    pub address: String,
    pub saga_steps: Vec<SagaStep>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Builds a new `Pending` order from a cart snapshot.
    ///
    /// Rejects empty orders, zero quantities, negative prices, repeated
    /// products and blank addresses.
    pub fn new(
        id: OrderId,
        user_id: UserId,
        items: Vec<OrderItem>,
        payment_method: PaymentMethod,
        address: impl Into<String>,
    ) -> Result<Self, OrderError> {
        let address = address.into();
        if address.trim().is_empty() {
            return Err(OrderError::AddressRequired);
        }

        Self::validate_items(&items)?;

        let now = Utc::now();
        Ok(Self {
            id,
            user_id,
            items,
            status: OrderStatus::Pending,
            payment_method,
            address,
            saga_steps: Vec::new(),
            failure_reason: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Rebuilds an order from its stored representation.
    pub fn restore(record: OrderRecord) -> Self {
        Self {
            id: record.id,
            user_id: record.user_id,
            items: record.items,
            status: record.status,
            payment_method: record.payment_method,
            address: record.address,
            saga_steps: record.saga_steps,
            failure_reason: record.failure_reason,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }

    fn validate_items(items: &[OrderItem]) -> Result<(), OrderError> {
        if items.is_empty() {
            return Err(OrderError::NoItems);
        }

        let mut seen = HashSet::new();
        for item in items {
            if item.quantity == 0 {
                return Err(OrderError::InvalidQuantity {
                    product_id: item.product_id.to_string(),
                    quantity: item.quantity,
                });
            }
            if item.unit_price.is_negative() {
                return Err(OrderError::InvalidPrice {
                    product_id: item.product_id.to_string(),
                    price: item.unit_price.cents(),
                });
            }
            if !seen.insert(&item.product_id) {
                return Err(OrderError::DuplicateProduct {
                    product_id: item.product_id.to_string(),
                });
            }
        }
        Ok(())
    }
}

// Query methods
impl Order {
    pub fn id(&self) -> OrderId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Returns the items in cart order.
    pub fn items(&self) -> &[OrderItem] {
        &self.items
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn payment_method(&self) -> PaymentMethod {
        self.payment_method
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Returns the saga steps in the order they were recorded.
    pub fn saga_steps(&self) -> &[SagaStep] {
        &self.saga_steps
    }

    /// Returns why the saga failed or was compensated, if it did.
    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Returns the order total, `sum(unit_price * quantity)` over all items.
    pub fn total(&self) -> Money {
        self.items.iter().map(OrderItem::total_price).sum()
    }

    /// Returns the total quantity of all items.
    pub fn total_quantity(&self) -> u32 {
        self.items.iter().map(|item| item.quantity).sum()
    }

    /// Reservations recorded as applied but missing from the compensation
    /// log, which no later step has released.
    pub fn unreleased_unlogged(&self) -> Vec<Compensation> {
        let mut pending = Vec::new();
        for (index, step) in self.saga_steps.iter().enumerate() {
            if step.name != StepName::ReserveStock || step.status != StepStatus::Pending {
                continue;
            }
            let Some(compensation) = &step.compensation else {
                continue;
            };
            let released = self.saga_steps[index + 1..]
                .iter()
                .any(|later| later.status == StepStatus::Compensated && later.target == step.target);
            if !released {
                pending.push(compensation.clone());
            }
        }
        pending
    }
}

// Mutations
impl Order {
    /// Moves the order to `next`, enforcing the status state machine.
    pub fn transition_to(&mut self, next: OrderStatus) -> Result<(), OrderError> {
        self.status.ensure_transition(next)?;
        self.status = next;
        self.touch();
        Ok(())
    }

    /// Appends a saga step record.
    pub fn record_step(&mut self, step: SagaStep) {
        self.saga_steps.push(step);
        self.touch();
    }

    /// Records why the saga did not complete. The first reason wins.
    pub fn set_failure_reason(&mut self, reason: impl Into<String>) {
        if self.failure_reason.is_none() {
            self.failure_reason = Some(reason.into());
            self.touch();
        }
    }

    /// Bumps `updated_at` without any other change.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
