//! In-memory stores for tests and local runs.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{IdempotencyKey, OrderId, UserId};
use domain::{Order, OrderStatus, SagaStep, StepName};
use tokio::sync::RwLock;

use crate::{
    CompensationLogEntry, Result, StoreError, compensation::CompensationLog, store::OrderStore,
};

/// In-memory order store for testing.
///
/// Each write clones the order, applies the change to the clone and swaps it
/// in under the write lock, so a rejected change leaves the stored order
/// untouched.
#[derive(Clone, Default)]
pub struct InMemoryOrderStore {
    orders: Arc<RwLock<HashMap<OrderId, Order>>>,
    fail_writes: Arc<AtomicBool>,
    fail_on_step: Arc<Mutex<Option<StepName>>>,
}

impl InMemoryOrderStore {
    /// Creates a new empty in-memory order store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored orders.
    pub async fn order_count(&self) -> usize {
        self.orders.read().await.len()
    }

    /// Makes every subsequent write fail with a backend error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes every append of a saga step named `step` fail with a backend
    /// error, leaving other writes alone. `None` turns it off.
    pub fn set_fail_on_step(&self, step: Option<StepName>) {
        *self.fail_on_step.lock().unwrap_or_else(PoisonError::into_inner) = step;
    }

    fn fails_on(&self, step: StepName) -> bool {
        *self.fail_on_step.lock().unwrap_or_else(PoisonError::into_inner) == Some(step)
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("order store unavailable".to_string()));
        }
        Ok(())
    }

    async fn modify<F>(&self, order_id: OrderId, change: F) -> Result<Order>
    where
        F: FnOnce(&mut Order) -> Result<()> + Send,
    {
        self.check_writable()?;

        let mut orders = self.orders.write().await;
        let current = orders
            .get(&order_id)
            .ok_or(StoreError::OrderNotFound(order_id))?;

        let mut updated = current.clone();
        change(&mut updated)?;
        orders.insert(order_id, updated.clone());
        Ok(updated)
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn create_order_record(&self, order: &Order) -> Result<()> {
        self.check_writable()?;

        let mut orders = self.orders.write().await;
        if orders.contains_key(&order.id()) {
            return Err(StoreError::OrderAlreadyExists(order.id()));
        }
        orders.insert(order.id(), order.clone());
        Ok(())
    }

    async fn update_status(
        &self,
        order_id: OrderId,
        status: OrderStatus,
        reason: Option<String>,
    ) -> Result<Order> {
        self.modify(order_id, |order| {
            order.transition_to(status)?;
            if let Some(reason) = reason {
                order.set_failure_reason(reason);
            }
            Ok(())
        })
        .await
    }

    async fn append_saga_step(&self, order_id: OrderId, step: SagaStep) -> Result<Order> {
        if self.fails_on(step.name) {
            return Err(StoreError::Backend(format!(
                "write of {} step rejected",
                step.name
            )));
        }
        self.modify(order_id, |order| {
            order.record_step(step);
            Ok(())
        })
        .await
    }

    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>> {
        Ok(self.orders.read().await.get(&order_id).cloned())
    }

    async fn orders_for_user(&self, user_id: UserId) -> Result<Vec<Order>> {
        let orders = self.orders.read().await;
        let mut matching: Vec<_> = orders
            .values()
            .filter(|o| o.user_id() == user_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        Ok(matching)
    }

    async fn stale_orders(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Order>> {
        let orders = self.orders.read().await;
        let mut stale: Vec<_> = orders
            .values()
            .filter(|o| o.status().is_in_flight() && o.updated_at() <= updated_before)
            .cloned()
            .collect();
        stale.sort_by_key(|o| o.updated_at());
        stale.truncate(limit);
        Ok(stale)
    }

    async fn claim_stale(
        &self,
        order_id: OrderId,
        updated_before: DateTime<Utc>,
    ) -> Result<Option<Order>> {
        self.check_writable()?;

        let mut orders = self.orders.write().await;
        let Some(order) = orders.get_mut(&order_id) else {
            return Ok(None);
        };
        if !order.status().is_in_flight() || order.updated_at() > updated_before {
            return Ok(None);
        }
        order.touch();
        Ok(Some(order.clone()))
    }
}

#[derive(Default)]
struct LogState {
    entries: Vec<CompensationLogEntry>,
    compensated: HashSet<IdempotencyKey>,
}

/// In-memory compensation log for testing.
#[derive(Clone, Default)]
pub struct InMemoryCompensationLog {
    state: Arc<RwLock<LogState>>,
    fail_appends: Arc<AtomicBool>,
}

impl InMemoryCompensationLog {
    /// Creates a new empty compensation log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of entries across all orders.
    pub async fn entry_count(&self) -> usize {
        self.state.read().await.entries.len()
    }

    /// Makes every subsequent append fail with a backend error.
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CompensationLog for InMemoryCompensationLog {
    async fn append(&self, entry: CompensationLogEntry) -> Result<()> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StoreError::Backend(
                "compensation log unavailable".to_string(),
            ));
        }

        let mut state = self.state.write().await;
        let exists = state
            .entries
            .iter()
            .any(|e| e.idempotency_key == entry.idempotency_key);
        if !exists {
            state.entries.push(entry);
        }
        Ok(())
    }

    async fn entries_for(&self, order_id: OrderId) -> Result<Vec<CompensationLogEntry>> {
        let state = self.state.read().await;
        let mut entries: Vec<_> = state
            .entries
            .iter()
            .filter(|e| e.order_id == order_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }

    async fn mark_compensated(&self, entry: &CompensationLogEntry) -> Result<()> {
        let mut state = self.state.write().await;
        state.compensated.insert(entry.idempotency_key.clone());
        Ok(())
    }

    async fn is_compensated(&self, entry: &CompensationLogEntry) -> Result<bool> {
        Ok(self
            .state
            .read()
            .await
            .compensated
            .contains(&entry.idempotency_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CompensationLogExt;
    use domain::{Money, OrderItem, PaymentMethod};

    fn create_test_order(user_id: u64) -> Order {
        Order::new(
            OrderId::new(),
            UserId::new(user_id),
            vec![
                OrderItem::new("SKU-001", 2, Money::from_cents(1000)),
                OrderItem::new("SKU-002", 1, Money::from_cents(500)),
            ],
            PaymentMethod::CreditCard,
            "1 Main St",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn create_and_get_order() {
        let store = InMemoryOrderStore::new();
        let order = create_test_order(1);

        store.create_order_record(&order).await.unwrap();

        let loaded = store.get_order(order.id()).await.unwrap().unwrap();
        assert_eq!(loaded, order);
        assert_eq!(store.order_count().await, 1);
    }

    #[tokio::test]
    async fn create_rejects_duplicate_id() {
        let store = InMemoryOrderStore::new();
        let order = create_test_order(1);

        store.create_order_record(&order).await.unwrap();
        let result = store.create_order_record(&order).await;
        assert!(matches!(result, Err(StoreError::OrderAlreadyExists(_))));
    }

    #[tokio::test]
    async fn get_missing_order_returns_none() {
        let store = InMemoryOrderStore::new();
        assert!(store.get_order(OrderId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_status_follows_state_machine() {
        let store = InMemoryOrderStore::new();
        let order = create_test_order(1);
        store.create_order_record(&order).await.unwrap();

        let updated = store
            .update_status(order.id(), OrderStatus::Reserving, None)
            .await
            .unwrap();
        assert_eq!(updated.status(), OrderStatus::Reserving);

        let result = store
            .update_status(order.id(), OrderStatus::Completed, None)
            .await;
        assert!(matches!(result, Err(StoreError::Domain(_))));

        // Rejected write leaves the stored order as it was
        let loaded = store.get_order(order.id()).await.unwrap().unwrap();
        assert_eq!(loaded.status(), OrderStatus::Reserving);
    }

    #[tokio::test]
    async fn update_status_records_first_reason() {
        let store = InMemoryOrderStore::new();
        let order = create_test_order(1);
        store.create_order_record(&order).await.unwrap();

        store
            .update_status(order.id(), OrderStatus::Compensating, Some("no stock".into()))
            .await
            .unwrap();
        let updated = store
            .update_status(order.id(), OrderStatus::Compensated, Some("later".into()))
            .await
            .unwrap();

        assert_eq!(updated.failure_reason(), Some("no stock"));
    }

    #[tokio::test]
    async fn update_missing_order_fails() {
        let store = InMemoryOrderStore::new();
        let result = store
            .update_status(OrderId::new(), OrderStatus::Reserving, None)
            .await;
        assert!(matches!(result, Err(StoreError::OrderNotFound(_))));
    }

    #[tokio::test]
    async fn append_saga_step_keeps_order() {
        let store = InMemoryOrderStore::new();
        let order = create_test_order(1);
        store.create_order_record(&order).await.unwrap();

        store
            .append_saga_step(order.id(), SagaStep::reserved("SKU-001".into(), 2))
            .await
            .unwrap();
        let updated = store
            .append_saga_step(order.id(), SagaStep::reserved("SKU-002".into(), 1))
            .await
            .unwrap();

        let targets: Vec<_> = updated
            .saga_steps()
            .iter()
            .map(|s| s.target.to_string())
            .collect();
        assert_eq!(targets, ["product:SKU-001", "product:SKU-002"]);
    }

    #[tokio::test]
    async fn orders_for_user_filters_and_sorts_newest_first() {
        let store = InMemoryOrderStore::new();
        let first = create_test_order(7);
        store.create_order_record(&first).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let second = create_test_order(7);
        store.create_order_record(&second).await.unwrap();
        store
            .create_order_record(&create_test_order(8))
            .await
            .unwrap();

        let orders = store.orders_for_user(UserId::new(7)).await.unwrap();
        let ids: Vec<_> = orders.iter().map(Order::id).collect();
        assert_eq!(ids, [second.id(), first.id()]);
    }

    #[tokio::test]
    async fn stale_orders_only_returns_in_flight() {
        let store = InMemoryOrderStore::new();
        let in_flight = create_test_order(1);
        store.create_order_record(&in_flight).await.unwrap();
        store
            .update_status(in_flight.id(), OrderStatus::Reserving, None)
            .await
            .unwrap();

        let finished = create_test_order(1);
        store.create_order_record(&finished).await.unwrap();
        store
            .update_status(finished.id(), OrderStatus::Compensating, None)
            .await
            .unwrap();
        store
            .update_status(finished.id(), OrderStatus::Compensated, None)
            .await
            .unwrap();

        let stale = store.stale_orders(Utc::now(), 10).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id(), in_flight.id());

        let cutoff = in_flight.created_at() - chrono::Duration::seconds(60);
        assert!(store.stale_orders(cutoff, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_stale_takes_each_order_once() {
        let store = InMemoryOrderStore::new();
        let order = create_test_order(1);
        store.create_order_record(&order).await.unwrap();
        store
            .update_status(order.id(), OrderStatus::Reserving, None)
            .await
            .unwrap();

        let cutoff = Utc::now();
        let claimed = store.claim_stale(order.id(), cutoff).await.unwrap().unwrap();
        assert!(claimed.updated_at() > cutoff);

        // The claim counts as a write, so a second sweep with the same cutoff misses.
        assert!(store.claim_stale(order.id(), cutoff).await.unwrap().is_none());
        assert!(store.claim_stale(OrderId::new(), cutoff).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_stale_skips_recently_written_and_finished_orders() {
        let store = InMemoryOrderStore::new();
        let order = create_test_order(1);
        store.create_order_record(&order).await.unwrap();
        let cutoff = order.updated_at() - chrono::Duration::seconds(60);
        assert!(store.claim_stale(order.id(), cutoff).await.unwrap().is_none());

        store
            .update_status(order.id(), OrderStatus::Compensating, None)
            .await
            .unwrap();
        store
            .update_status(order.id(), OrderStatus::Compensated, None)
            .await
            .unwrap();
        assert!(store.claim_stale(order.id(), Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failing_one_step_name_leaves_other_writes() {
        let store = InMemoryOrderStore::new();
        let order = create_test_order(1);
        store.create_order_record(&order).await.unwrap();
        store.set_fail_on_step(Some(StepName::ClearCart));

        let cleared = SagaStep::completed(StepName::ClearCart, domain::StepTarget::User(UserId::new(1)));
        let result = store.append_saga_step(order.id(), cleared).await;
        assert!(matches!(result, Err(StoreError::Backend(_))));

        store
            .append_saga_step(order.id(), SagaStep::reserved("SKU-001".into(), 2))
            .await
            .unwrap();
        store
            .update_status(order.id(), OrderStatus::Reserving, None)
            .await
            .unwrap();

        store.set_fail_on_step(None);
        let loaded = store.get_order(order.id()).await.unwrap().unwrap();
        assert_eq!(loaded.saga_steps().len(), 1);
    }

    #[tokio::test]
    async fn failing_writes_surface_backend_error() {
        let store = InMemoryOrderStore::new();
        store.set_fail_writes(true);

        let result = store.create_order_record(&create_test_order(1)).await;
        assert!(matches!(result, Err(StoreError::Backend(_))));
        assert_eq!(store.order_count().await, 0);
    }

    #[tokio::test]
    async fn log_append_is_idempotent_per_key() {
        let log = InMemoryCompensationLog::new();
        let order_id = OrderId::new();
        let entry = CompensationLogEntry::stock_reservation(order_id, 0, "SKU-1".into(), 2);

        log.append(entry.clone()).await.unwrap();
        log.append(entry.clone()).await.unwrap();

        assert_eq!(log.entries_for(order_id).await.unwrap(), vec![entry]);
    }

    #[tokio::test]
    async fn log_entries_are_scoped_and_ordered() {
        let log = InMemoryCompensationLog::new();
        let order_id = OrderId::new();
        let other = OrderId::new();

        log.append(CompensationLogEntry::stock_reservation(order_id, 1, "B".into(), 1))
            .await
            .unwrap();
        log.append(CompensationLogEntry::stock_reservation(other, 0, "X".into(), 1))
            .await
            .unwrap();
        log.append(CompensationLogEntry::stock_reservation(order_id, 0, "A".into(), 1))
            .await
            .unwrap();

        let targets: Vec<_> = log
            .entries_for(order_id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.target.to_string())
            .collect();
        assert_eq!(targets, ["A", "B"]);
    }

    #[tokio::test]
    async fn pending_compensation_is_lifo_and_skips_compensated() {
        let log = InMemoryCompensationLog::new();
        let order_id = OrderId::new();
        let a = CompensationLogEntry::stock_reservation(order_id, 0, "A".into(), 1);
        let b = CompensationLogEntry::stock_reservation(order_id, 1, "B".into(), 2);
        let c = CompensationLogEntry::stock_reservation(order_id, 2, "C".into(), 3);
        for entry in [&a, &b, &c] {
            log.append(entry.clone()).await.unwrap();
        }

        log.mark_compensated(&c).await.unwrap();
        log.mark_compensated(&c).await.unwrap();

        let pending = log.pending_compensation(order_id).await.unwrap();
        assert_eq!(pending, vec![b.clone(), a.clone()]);
        assert!(log.is_compensated(&c).await.unwrap());
        assert!(!log.is_compensated(&a).await.unwrap());
        assert_eq!(
            log.outstanding_delta(order_id, &"B".into()).await.unwrap(),
            -2
        );
        assert_eq!(
            log.outstanding_delta(order_id, &"C".into()).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn failing_appends_write_nothing() {
        let log = InMemoryCompensationLog::new();
        log.set_fail_appends(true);

        let entry = CompensationLogEntry::stock_reservation(OrderId::new(), 0, "A".into(), 1);
        assert!(matches!(
            log.append(entry).await,
            Err(StoreError::Backend(_))
        ));
        assert_eq!(log.entry_count().await, 0);
    }
}
