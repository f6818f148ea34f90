//! Cart service trait and in-memory implementation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use common::{IdempotencyKey, ProductId, UserId};
use domain::Money;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::ServiceError;

/// One line of a shopping cart, priced at the time it was read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    pub product_id: ProductId,
    pub quantity: u32,
    pub price: Money,
}

impl CartItem {
    pub fn new(product_id: impl Into<ProductId>, quantity: u32, price: Money) -> Self {
        Self {
            product_id: product_id.into(),
            quantity,
            price,
        }
    }
}

/// Snapshot of a user's cart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    pub items: Vec<CartItem>,
    pub total: Money,
}

impl Cart {
    /// Builds a cart snapshot, computing the total from the lines.
    pub fn new(items: Vec<CartItem>) -> Self {
        let total = items
            .iter()
            .map(|item| item.price.multiply(item.quantity))
            .sum();
        Self { items, total }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Trait for the cart collaborator.
#[async_trait]
pub trait CartService: Send + Sync {
    /// Returns the user's cart. A user without a cart gets an empty one.
    async fn get_cart(&self, user_id: UserId) -> Result<Cart, ServiceError>;

    /// Empties the user's cart. Applied at most once per key.
    async fn clear_cart(&self, user_id: UserId, key: &IdempotencyKey) -> Result<(), ServiceError>;
}

#[derive(Debug, Default)]
struct InMemoryCartState {
    carts: HashMap<UserId, Vec<CartItem>>,
    cleared: HashSet<IdempotencyKey>,
}

/// In-memory cart service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCartService {
    state: Arc<RwLock<InMemoryCartState>>,
    fail_on_clear: Arc<AtomicBool>,
    transient_get_failures: Arc<AtomicU32>,
}

impl InMemoryCartService {
    /// Creates a new in-memory cart service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a line to the user's cart, replacing any line for the same product.
    pub async fn add_item(&self, user_id: UserId, item: CartItem) {
        let mut state = self.state.write().await;
        let lines = state.carts.entry(user_id).or_default();
        lines.retain(|line| line.product_id != item.product_id);
        lines.push(item);
    }

    /// Replaces the user's cart with the given lines.
    pub async fn set_cart(&self, user_id: UserId, items: Vec<CartItem>) {
        self.state.write().await.carts.insert(user_id, items);
    }

    /// Returns the lines currently in the user's cart.
    pub async fn items_for(&self, user_id: UserId) -> Vec<CartItem> {
        self.state
            .read()
            .await
            .carts
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the number of distinct clear requests applied.
    pub async fn clear_count(&self) -> usize {
        self.state.read().await.cleared.len()
    }

    /// Configures every clear call to fail with a transient error.
    pub fn set_fail_on_clear(&self, fail: bool) {
        self.fail_on_clear.store(fail, Ordering::SeqCst);
    }

    /// Makes the next `count` get calls fail with a transient error.
    pub fn fail_next_gets(&self, count: u32) {
        self.transient_get_failures.store(count, Ordering::SeqCst);
    }

    fn take_transient_failure(&self) -> bool {
        self.transient_get_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl CartService for InMemoryCartService {
    async fn get_cart(&self, user_id: UserId) -> Result<Cart, ServiceError> {
        if self.take_transient_failure() {
            return Err(ServiceError::Unavailable("cart service returned 503".into()));
        }

        Ok(Cart::new(self.items_for(user_id).await))
    }

    async fn clear_cart(&self, user_id: UserId, key: &IdempotencyKey) -> Result<(), ServiceError> {
        if self.fail_on_clear.load(Ordering::SeqCst) {
            return Err(ServiceError::Unavailable("cart service returned 503".into()));
        }

        let mut state = self.state.write().await;
        if state.cleared.insert(key.clone()) {
            state.carts.remove(&user_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::OrderId;

    #[tokio::test]
    async fn test_missing_cart_is_empty() {
        let service = InMemoryCartService::new();
        let cart = service.get_cart(UserId::new(1)).await.unwrap();
        assert!(cart.is_empty());
        assert_eq!(cart.total, Money::zero());
    }

    #[tokio::test]
    async fn test_cart_total_is_computed() {
        let service = InMemoryCartService::new();
        let user = UserId::new(1);
        service
            .add_item(user, CartItem::new("SKU-A", 5, Money::from_cents(1000)))
            .await;
        service
            .add_item(user, CartItem::new("SKU-B", 1, Money::from_cents(250)))
            .await;

        let cart = service.get_cart(user).await.unwrap();
        assert_eq!(cart.items.len(), 2);
        assert_eq!(cart.total, Money::from_cents(5250));
    }

    #[tokio::test]
    async fn test_clear_is_applied_once_per_key() {
        let service = InMemoryCartService::new();
        let user = UserId::new(1);
        let key = IdempotencyKey::cart_clear(OrderId::new());
        service
            .add_item(user, CartItem::new("SKU-A", 1, Money::from_cents(100)))
            .await;

        service.clear_cart(user, &key).await.unwrap();
        assert!(service.items_for(user).await.is_empty());

        // The user refills the cart; a replay of the old clear must not empty it.
        service
            .add_item(user, CartItem::new("SKU-B", 1, Money::from_cents(100)))
            .await;
        service.clear_cart(user, &key).await.unwrap();

        assert_eq!(service.items_for(user).await.len(), 1);
        assert_eq!(service.clear_count().await, 1);
    }

    #[tokio::test]
    async fn test_fail_on_clear() {
        let service = InMemoryCartService::new();
        service.set_fail_on_clear(true);

        let err = service
            .clear_cart(UserId::new(1), &IdempotencyKey::cart_clear(OrderId::new()))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_transient_get_failures_are_consumed() {
        let service = InMemoryCartService::new();
        service.fail_next_gets(1);

        assert!(service.get_cart(UserId::new(1)).await.is_err());
        assert!(service.get_cart(UserId::new(1)).await.is_ok());
    }
}
