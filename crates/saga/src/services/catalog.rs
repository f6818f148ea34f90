//! Catalog service trait and in-memory implementation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::{IdempotencyKey, ProductId};
use domain::Money;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};

use super::ServiceError;

/// A product as the catalog reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub price: Money,
    pub stock: i64,
}

/// Trait for the product catalog collaborator.
#[async_trait]
pub trait CatalogService: Send + Sync {
    /// Returns the product's price and stock.
    async fn get_product(&self, product_id: &ProductId) -> Result<Product, ServiceError>;

    /// Adds `delta` to the product's stock.
    ///
    /// A negative delta fails with `InsufficientStock` if it would drive
    /// stock below zero. The adjustment is applied at most once per key;
    /// repeating a key that was already applied succeeds without effect.
    async fn adjust_stock(
        &self,
        product_id: &ProductId,
        delta: i64,
        key: &IdempotencyKey,
    ) -> Result<(), ServiceError>;
}

#[derive(Debug, Default)]
struct InMemoryCatalogState {
    products: HashMap<ProductId, Product>,
    applied: HashSet<IdempotencyKey>,
    reservations_applied: u32,
    stall_at: Option<u32>,
}

/// In-memory catalog for testing.
///
/// Besides the conditional decrement, it can inject transient failures,
/// failing releases, per-call latency, and a "crash" that applies a
/// reservation and then never answers.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalogService {
    state: Arc<Mutex<InMemoryCatalogState>>,
    transient_reservation_failures: Arc<AtomicU32>,
    fail_releases: Arc<AtomicBool>,
    latency: Arc<std::sync::Mutex<Option<Duration>>>,
    stalled: Arc<Notify>,
}

impl InMemoryCatalogService {
    /// Creates a new in-memory catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a product.
    pub async fn seed(&self, product_id: impl Into<ProductId>, price: Money, stock: i64) {
        let id = product_id.into();
        self.state
            .lock()
            .await
            .products
            .insert(id.clone(), Product { id, price, stock });
    }

    /// Returns the current stock of a product.
    pub async fn stock_of(&self, product_id: impl Into<ProductId>) -> Option<i64> {
        let id = product_id.into();
        self.state
            .lock()
            .await
            .products
            .get(&id)
            .map(|product| product.stock)
    }

    /// Returns the number of distinct keys that changed stock.
    pub async fn applied_count(&self) -> usize {
        self.state.lock().await.applied.len()
    }

    /// Makes the next `count` reservations (negative deltas) fail with a
    /// transient error before touching stock.
    pub fn fail_next_reservations(&self, count: u32) {
        self.transient_reservation_failures
            .store(count, Ordering::SeqCst);
    }

    /// Configures every release (positive delta) to fail with a transient error.
    pub fn set_fail_releases(&self, fail: bool) {
        self.fail_releases.store(fail, Ordering::SeqCst);
    }

    /// Delays every stock adjustment by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut current) = self.latency.lock() {
            *current = latency;
        }
    }

    /// The `n`-th reservation applied from now on (1-based) takes effect
    /// and then never returns, as if the caller crashed mid-call.
    pub async fn stall_after_reservations(&self, n: u32) {
        let mut state = self.state.lock().await;
        state.stall_at = Some(state.reservations_applied + n);
    }

    /// Waits until a stalled reservation has been applied.
    pub async fn wait_for_stall(&self) {
        self.stalled.notified().await;
    }

    fn take_transient_failure(&self) -> bool {
        self.transient_reservation_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn current_latency(&self) -> Option<Duration> {
        self.latency.lock().ok().and_then(|latency| *latency)
    }
}

#[async_trait]
impl CatalogService for InMemoryCatalogService {
    async fn get_product(&self, product_id: &ProductId) -> Result<Product, ServiceError> {
        self.state
            .lock()
            .await
            .products
            .get(product_id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("product {product_id}")))
    }

    async fn adjust_stock(
        &self,
        product_id: &ProductId,
        delta: i64,
        key: &IdempotencyKey,
    ) -> Result<(), ServiceError> {
        if let Some(latency) = self.current_latency() {
            tokio::time::sleep(latency).await;
        }

        if delta < 0 && self.take_transient_failure() {
            return Err(ServiceError::Unavailable("catalog returned 503".into()));
        }
        if delta > 0 && self.fail_releases.load(Ordering::SeqCst) {
            return Err(ServiceError::Unavailable("catalog returned 503".into()));
        }

        let stall = {
            let mut state = self.state.lock().await;
            if state.applied.contains(key) {
                return Ok(());
            }

            let product = state
                .products
                .get_mut(product_id)
                .ok_or_else(|| ServiceError::NotFound(format!("product {product_id}")))?;

            let new_stock = product.stock + delta;
            if new_stock < 0 {
                return Err(ServiceError::InsufficientStock {
                    product_id: product_id.clone(),
                    requested: u32::try_from(-delta).unwrap_or(u32::MAX),
                    available: product.stock,
                });
            }
            product.stock = new_stock;
            state.applied.insert(key.clone());

            if delta < 0 {
                state.reservations_applied += 1;
                if state.stall_at == Some(state.reservations_applied) {
                    state.stall_at = None;
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };

        if stall {
            self.stalled.notify_one();
            std::future::pending::<()>().await;
        }

        Ok(())
    }
}
