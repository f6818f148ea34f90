//! The `OrderStore` trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{OrderId, UserId};
use domain::{Order, OrderStatus, SagaStep};

use crate::Result;

/// Core trait for order persistence.
///
/// Every method is a single local transaction: the order row, its items and
/// its saga steps change together or not at all. Writes to the same order are
/// serialized by the implementation; writes to different orders never block
/// each other on anything but the backend itself.
///
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Persists a new order with its items and any saga steps already recorded.
    ///
    /// Fails with `OrderAlreadyExists` if the ID is taken.
    async fn create_order_record(&self, order: &Order) -> Result<()>;

    /// Moves an order to `status`, enforcing the status state machine.
    ///
    /// `reason` is stored as the failure reason if the order does not have one
    /// yet. Returns the updated order.
    async fn update_status(
        &self,
        order_id: OrderId,
        status: OrderStatus,
        reason: Option<String>,
    ) -> Result<Order>;

    /// Appends a saga step to the order. Returns the updated order.
    async fn append_saga_step(&self, order_id: OrderId, step: SagaStep) -> Result<Order>;

    /// Loads an order by ID.
    ///
    /// Returns None if the order doesn't exist.
    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>>;

    /// Loads every order placed by a user, newest first.
    async fn orders_for_user(&self, user_id: UserId) -> Result<Vec<Order>>;

    /// Loads up to `limit` orders whose saga is still in flight and which
    /// have not been written since `updated_before`, oldest first.
    async fn stale_orders(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Order>>;

    /// Takes over a stale order for recovery.
    ///
    /// Succeeds only if the order is still in flight and has not been written
    /// since `updated_before`; the claim itself counts as a write. Returns
    /// None when the order moved on or another sweep claimed it first.
    async fn claim_stale(
        &self,
        order_id: OrderId,
        updated_before: DateTime<Utc>,
    ) -> Result<Option<Order>>;
}
