//! The compensation log: which reversible steps succeeded for an order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{IdempotencyKey, OrderId, ProductId};
use domain::StepName;
use serde::{Deserialize, Serialize};

use crate::Result;

/// A write-once record of a reversible step that took effect remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationLogEntry {
    /// The order the step belongs to.
    pub order_id: OrderId,

    /// Position of the step within the order's saga; compensation runs in
    /// descending sequence.
    pub sequence: u32,

    /// The step that was applied.
    pub step_name: StepName,

    /// The product whose stock was changed.
    pub target: ProductId,

    /// The stock delta the step applied (negative for a reservation).
    pub applied_delta: i64,

    /// The key the forward step was sent with. Unique across the log.
    pub idempotency_key: IdempotencyKey,

    /// When the entry was written.
    pub recorded_at: DateTime<Utc>,
}

impl CompensationLogEntry {
    /// Entry for a stock reservation of `quantity` units of `product_id`.
    pub fn stock_reservation(
        order_id: OrderId,
        sequence: u32,
        product_id: ProductId,
        quantity: u32,
    ) -> Self {
        Self {
            idempotency_key: IdempotencyKey::reservation(order_id, &product_id),
            order_id,
            sequence,
            step_name: StepName::ReserveStock,
            target: product_id,
            applied_delta: -i64::from(quantity),
            recorded_at: Utc::now(),
        }
    }

    /// The delta that reverses this entry.
    pub fn inverse_delta(&self) -> i64 {
        -self.applied_delta
    }

    /// The key the compensating call is sent with.
    pub fn compensation_key(&self) -> IdempotencyKey {
        IdempotencyKey::release(self.order_id, &self.target)
    }
}

/// Append-only store of [`CompensationLogEntry`] records.
///
/// The orchestrator appends an entry after a reversible step succeeds and
/// before it starts the next step, so at any moment the log covers every
/// remote effect of the saga except the one in flight.
#[async_trait]
pub trait CompensationLog: Send + Sync {
    /// Durably records an entry.
    ///
    /// Entries are keyed by their idempotency key: appending the same key
    /// again is a no-op, which lets recovery replay a step safely.
    async fn append(&self, entry: CompensationLogEntry) -> Result<()>;

    /// Returns the entries for an order in ascending sequence.
    async fn entries_for(&self, order_id: OrderId) -> Result<Vec<CompensationLogEntry>>;

    /// Records that an entry has been reversed. Idempotent.
    async fn mark_compensated(&self, entry: &CompensationLogEntry) -> Result<()>;

    /// Returns true if the entry has already been reversed.
    async fn is_compensated(&self, entry: &CompensationLogEntry) -> Result<bool>;
}

/// Extension trait providing convenience methods for compensation logs.
#[async_trait]
pub trait CompensationLogExt: CompensationLog {
    /// Returns the entries still to be reversed, last applied first.
    async fn pending_compensation(&self, order_id: OrderId) -> Result<Vec<CompensationLogEntry>> {
        let mut pending = Vec::new();
        for entry in self.entries_for(order_id).await?.into_iter().rev() {
            if !self.is_compensated(&entry).await? {
                pending.push(entry);
            }
        }
        Ok(pending)
    }

    /// Returns the net stock delta the order still holds on `product_id`.
    async fn outstanding_delta(&self, order_id: OrderId, product_id: &ProductId) -> Result<i64> {
        let mut total = 0;
        for entry in self.pending_compensation(order_id).await? {
            if &entry.target == product_id {
                total += entry.applied_delta;
            }
        }
        Ok(total)
    }
}

// Blanket implementation for all CompensationLog implementations
impl<T: CompensationLog + ?Sized> CompensationLogExt for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_entry_records_negative_delta() {
        let order_id = OrderId::new();
        let entry = CompensationLogEntry::stock_reservation(order_id, 0, "SKU-1".into(), 4);

        assert_eq!(entry.applied_delta, -4);
        assert_eq!(entry.inverse_delta(), 4);
        assert_eq!(entry.step_name, StepName::ReserveStock);
        assert_eq!(
            entry.idempotency_key,
            IdempotencyKey::reservation(order_id, &ProductId::new("SKU-1"))
        );
    }

    #[test]
    fn compensation_key_differs_from_forward_key() {
        let entry = CompensationLogEntry::stock_reservation(OrderId::new(), 0, "SKU-1".into(), 1);
        assert_ne!(entry.compensation_key(), entry.idempotency_key);
    }
}
