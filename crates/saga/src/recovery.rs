//! Periodic sweep that finishes sagas abandoned mid-flight.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use domain::OrderStatus;
use order_store::{CompensationLog, OrderStore};
use tokio::time::MissedTickBehavior;

use crate::config::RecoveryConfig;
use crate::error::{Result, SagaError};
use crate::orchestrator::OrderOrchestrator;
use crate::services::{CartService, CatalogService, FeatureFlagService};

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Stale orders picked up.
    pub scanned: usize,
    /// Orders rolled forward to `Completed`.
    pub completed: usize,
    /// Orders rolled back to `Compensated`.
    pub compensated: usize,
    /// Orders that ended `Failed` and need manual reconciliation.
    pub failed: usize,
    /// Orders left in flight because of an error; retried next sweep.
    pub errors: usize,
    /// Orders already being driven, by a live saga or another sweep.
    pub skipped: usize,
}

/// Finds in-flight orders that have not been written for a while and drives
/// each one to a terminal state through [`OrderOrchestrator::resume`].
///
/// Each order is claimed in the store before it is resumed, so concurrent
/// sweeps never run the same order twice. Orders handled by a saga still
/// live in this process are skipped. Orders are handled one at a time.
pub struct RecoverySweep<S, L, C, P, F>
where
    S: OrderStore,
    L: CompensationLog,
    C: CartService,
    P: CatalogService,
    F: FeatureFlagService,
{
    orchestrator: Arc<OrderOrchestrator<S, L, C, P, F>>,
    config: RecoveryConfig,
}

impl<S, L, C, P, F> RecoverySweep<S, L, C, P, F>
where
    S: OrderStore,
    L: CompensationLog,
    C: CartService,
    P: CatalogService,
    F: FeatureFlagService,
{
    pub fn new(orchestrator: Arc<OrderOrchestrator<S, L, C, P, F>>, config: RecoveryConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    /// Runs a single pass over stale orders.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let threshold = chrono::Duration::from_std(self.config.staleness_threshold)
            .map_err(|e| SagaError::Validation(format!("staleness threshold out of range: {e}")))?;
        let cutoff = Utc::now() - threshold;

        let stale = self
            .orchestrator
            .store()
            .stale_orders(cutoff, self.config.batch_size)
            .await?;

        let mut report = SweepReport {
            scanned: stale.len(),
            ..SweepReport::default()
        };

        for order in stale {
            let order_id = order.id();
            let order = match self.orchestrator.store().claim_stale(order_id, cutoff).await {
                Ok(Some(order)) => order,
                Ok(None) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    tracing::error!(%order_id, error = %e, "could not claim stale order");
                    report.errors += 1;
                    continue;
                }
            };
            let from = order.status();

            let resumed = self.orchestrator.resume(order).await;
            if let Err(SagaError::AlreadyRunning(_)) = resumed {
                tracing::debug!(%order_id, "order is still being driven, skipping");
                report.skipped += 1;
                continue;
            }

            let status = match self.orchestrator.store().get_order(order_id).await {
                Ok(Some(order)) => order.status(),
                Ok(None) => {
                    report.errors += 1;
                    continue;
                }
                Err(e) => {
                    tracing::error!(%order_id, error = %e, "could not reload recovered order");
                    report.errors += 1;
                    continue;
                }
            };

            match status {
                OrderStatus::Completed => report.completed += 1,
                OrderStatus::Compensated => report.compensated += 1,
                OrderStatus::Failed => report.failed += 1,
                _ => report.errors += 1,
            }

            if status.is_saga_terminal() {
                metrics::counter!("checkout_recovered_orders_total", "status" => status.as_str())
                    .increment(1);
                tracing::info!(%order_id, %from, to = %status, "recovered order");
            } else if let Err(e) = resumed {
                tracing::warn!(%order_id, %from, error = %e, "order still in flight after recovery");
            }
        }

        Ok(report)
    }

    /// Sweeps every `interval` until `shutdown` resolves.
    ///
    /// Refuses to start unless the staleness threshold is longer than any
    /// step of a live saga can run without writing its order.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        self.config.validate(&self.orchestrator.config().retry)?;

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        tracing::info!(interval = ?self.config.interval, "recovery sweep started");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("recovery sweep stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(report) if report.scanned > 0 => {
                            tracing::info!(?report, "recovery sweep finished");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "recovery sweep failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{OrchestratorConfig, RetryConfig};
    use crate::services::{InMemoryCartService, InMemoryCatalogService, InMemoryFeatureFlagService};
    use common::{OrderId, UserId};
    use domain::{Money, Order, OrderItem, PaymentMethod, SagaStep};
    use order_store::{
        CompensationLogEntry, InMemoryCompensationLog, InMemoryOrderStore,
    };

    type TestSweep = RecoverySweep<
        InMemoryOrderStore,
        InMemoryCompensationLog,
        InMemoryCartService,
        InMemoryCatalogService,
        InMemoryFeatureFlagService,
    >;

    fn immediate() -> RecoveryConfig {
        RecoveryConfig {
            interval: Duration::from_millis(10),
            staleness_threshold: Duration::ZERO,
            batch_size: 10,
        }
    }

    async fn setup(
        config: RecoveryConfig,
    ) -> (TestSweep, InMemoryOrderStore, InMemoryCompensationLog, InMemoryCatalogService) {
        setup_with_retry(config, RetryConfig::fast()).await
    }

    async fn setup_with_retry(
        config: RecoveryConfig,
        retry: RetryConfig,
    ) -> (TestSweep, InMemoryOrderStore, InMemoryCompensationLog, InMemoryCatalogService) {
        let store = InMemoryOrderStore::new();
        let log = InMemoryCompensationLog::new();
        let catalog = InMemoryCatalogService::new();

        let orchestrator = OrderOrchestrator::new(
            store.clone(),
            log.clone(),
            InMemoryCartService::new(),
            catalog.clone(),
            InMemoryFeatureFlagService::new(),
            OrchestratorConfig::default().with_retry(retry),
        );

        (
            RecoverySweep::new(Arc::new(orchestrator), config),
            store,
            log,
            catalog,
        )
    }

    async fn stuck_order(store: &InMemoryOrderStore, status: OrderStatus) -> Order {
        let mut order = Order::new(
            OrderId::new(),
            UserId::new(1),
            vec![OrderItem::new("SKU-A", 2, Money::from_cents(500))],
            PaymentMethod::CreditCard,
            "1 Main St",
        )
        .unwrap();
        order.transition_to(OrderStatus::Reserving).unwrap();
        if status == OrderStatus::Compensating {
            order.transition_to(OrderStatus::Compensating).unwrap();
        }
        store.create_order_record(&order).await.unwrap();
        order
    }

    #[tokio::test]
    async fn test_empty_sweep() {
        let (sweep, _, _, _) = setup(immediate()).await;
        let report = sweep.sweep_once().await.unwrap();
        assert_eq!(report, SweepReport::default());
    }

    #[tokio::test]
    async fn test_fresh_orders_are_left_alone() {
        let config = RecoveryConfig {
            staleness_threshold: Duration::from_secs(3600),
            ..immediate()
        };
        let (sweep, store, _, catalog) = setup(config).await;
        catalog.seed("SKU-A", Money::from_cents(500), 10).await;
        let order = stuck_order(&store, OrderStatus::Reserving).await;

        let report = sweep.sweep_once().await.unwrap();
        assert_eq!(report.scanned, 0);

        let order = store.get_order(order.id()).await.unwrap().unwrap();
        assert_eq!(order.status(), OrderStatus::Reserving);
    }

    #[tokio::test]
    async fn test_reserving_order_is_rolled_forward() {
        let (sweep, store, _, catalog) = setup(immediate()).await;
        catalog.seed("SKU-A", Money::from_cents(500), 10).await;
        let order = stuck_order(&store, OrderStatus::Reserving).await;

        let report = sweep.sweep_once().await.unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.completed, 1);

        let order = store.get_order(order.id()).await.unwrap().unwrap();
        assert_eq!(order.status(), OrderStatus::Completed);
        assert_eq!(catalog.stock_of("SKU-A").await, Some(8));
    }

    #[tokio::test]
    async fn test_compensating_order_is_rolled_back() {
        let (sweep, store, log, catalog) = setup(immediate()).await;
        catalog.seed("SKU-A", Money::from_cents(500), 8).await;
        let order = stuck_order(&store, OrderStatus::Compensating).await;

        // The reservation took effect and was logged before the crash.
        let entry = CompensationLogEntry::stock_reservation(order.id(), 1, "SKU-A".into(), 2);
        log.append(entry).await.unwrap();

        let report = sweep.sweep_once().await.unwrap();
        assert_eq!(report.compensated, 1);

        let order = store.get_order(order.id()).await.unwrap().unwrap();
        assert_eq!(order.status(), OrderStatus::Compensated);
        assert_eq!(catalog.stock_of("SKU-A").await, Some(10));
    }

    #[tokio::test]
    async fn test_failed_release_is_reported() {
        let (sweep, store, log, catalog) = setup(immediate()).await;
        catalog.seed("SKU-A", Money::from_cents(500), 8).await;
        catalog.set_fail_releases(true);
        let order = stuck_order(&store, OrderStatus::Compensating).await;
        log.append(CompensationLogEntry::stock_reservation(
            order.id(),
            1,
            "SKU-A".into(),
            2,
        ))
        .await
        .unwrap();

        let report = sweep.sweep_once().await.unwrap();
        assert_eq!(report.failed, 1);

        let order = store.get_order(order.id()).await.unwrap().unwrap();
        assert_eq!(order.status(), OrderStatus::Failed);
    }

    #[tokio::test]
    async fn test_unlogged_reservation_is_released_on_recovery() {
        let (sweep, store, _, catalog) = setup(immediate()).await;
        // Two units were taken, but the crash hit before they were logged or released.
        catalog.seed("SKU-A", Money::from_cents(500), 8).await;

        let mut order = Order::new(
            OrderId::new(),
            UserId::new(1),
            vec![OrderItem::new("SKU-A", 2, Money::from_cents(500))],
            PaymentMethod::CreditCard,
            "1 Main St",
        )
        .unwrap();
        order.transition_to(OrderStatus::Reserving).unwrap();
        order.record_step(SagaStep::unlogged("SKU-A".into(), 2));
        order.transition_to(OrderStatus::Compensating).unwrap();
        store.create_order_record(&order).await.unwrap();

        let report = sweep.sweep_once().await.unwrap();
        assert_eq!(report.compensated, 1);

        let order = store.get_order(order.id()).await.unwrap().unwrap();
        assert_eq!(order.status(), OrderStatus::Compensated);
        assert!(order.unreleased_unlogged().is_empty());
        assert_eq!(catalog.stock_of("SKU-A").await, Some(10));
    }

    #[tokio::test]
    async fn test_run_until_rejects_threshold_shorter_than_a_step() {
        let (sweep, _, _, _) = setup(immediate()).await;
        let result = sweep.run_until(std::future::pending::<()>()).await;
        assert!(matches!(result, Err(SagaError::Validation(_))));
    }

    #[tokio::test]
    async fn test_run_until_stops_on_shutdown() {
        let retry = RetryConfig {
            attempt_timeout: Duration::from_millis(20),
            ..RetryConfig::fast()
        };
        let config = RecoveryConfig {
            staleness_threshold: Duration::from_millis(100),
            ..immediate()
        };
        let (sweep, store, _, catalog) = setup_with_retry(config, retry).await;
        catalog.seed("SKU-A", Money::from_cents(500), 10).await;
        let order = stuck_order(&store, OrderStatus::Reserving).await;

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let sweeper = tokio::spawn(async move {
            sweep
                .run_until(async {
                    let _ = rx.await;
                })
                .await
        });

        for _ in 0..200 {
            let current = store.get_order(order.id()).await.unwrap().unwrap();
            if current.status() == OrderStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tx.send(()).unwrap();
        sweeper.await.unwrap().unwrap();

        let order = store.get_order(order.id()).await.unwrap().unwrap();
        assert_eq!(order.status(), OrderStatus::Completed);
    }
}
