//! Order orchestrator driving the checkout saga.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use common::{IdempotencyKey, OrderId, UserId};
use domain::{
    Compensation, Order, OrderItem, OrderStatus, PaymentMethod, SagaStep, StepName, StepTarget,
};
use order_store::{
    CompensationLog, CompensationLogEntry, CompensationLogExt, OrderStore, StoreError,
};
use tokio::time::Instant;

use crate::api::CreateOrderRequest;
use crate::config::{CartClearPolicy, OrchestratorConfig};
use crate::error::{Result, SagaError};
use crate::executor::StepExecutor;
use crate::services::{CartService, CatalogService, FeatureFlagService};

/// Why the forward path stopped.
struct Interrupted {
    error: SagaError,
    /// A reservation that took effect but could not be logged.
    unlogged: Option<OrderItem>,
    /// Cleared once the cart is gone: from then on the saga only rolls forward.
    compensate: bool,
}

impl Interrupted {
    fn settled(error: SagaError) -> Self {
        Self {
            error,
            unlogged: None,
            compensate: false,
        }
    }
}

impl From<SagaError> for Interrupted {
    fn from(error: SagaError) -> Self {
        Self {
            error,
            unlogged: None,
            compensate: true,
        }
    }
}

impl From<StoreError> for Interrupted {
    fn from(err: StoreError) -> Self {
        SagaError::from(err).into()
    }
}

/// Marks an order as driven by this orchestrator until dropped.
struct RunGuard<'a> {
    running: &'a Mutex<HashSet<OrderId>>,
    order_id: OrderId,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.order_id);
    }
}

/// Places orders from carts.
///
/// The saga runs as:
///
/// ```text
/// fetch cart ─► check flag (cod only) ─► create order (Reserving)
///     ─► reserve stock per item, logging each ─► ItemsReserved
///     ─► clear cart ─► CartCleared ─► Completed
/// ```
///
/// Nothing before the order record is written has side effects, so those
/// failures simply return. Any later failure marks the order `Compensating`,
/// releases logged reservations newest first, and ends in `Compensated`, or
/// in `Failed` if a release could not be made.
pub struct OrderOrchestrator<S, L, C, P, F>
where
    S: OrderStore,
    L: CompensationLog,
    C: CartService,
    P: CatalogService,
    F: FeatureFlagService,
{
    store: S,
    log: L,
    cart: C,
    catalog: P,
    flags: F,
    executor: StepExecutor,
    config: OrchestratorConfig,
    running: Mutex<HashSet<OrderId>>,
}

impl<S, L, C, P, F> OrderOrchestrator<S, L, C, P, F>
where
    S: OrderStore,
    L: CompensationLog,
    C: CartService,
    P: CatalogService,
    F: FeatureFlagService,
{
    /// Creates a new orchestrator.
    pub fn new(store: S, log: L, cart: C, catalog: P, flags: F, config: OrchestratorConfig) -> Self {
        Self {
            store,
            log,
            cart,
            catalog,
            flags,
            executor: StepExecutor::new(config.retry.clone()),
            config,
            running: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn compensation_log(&self) -> &L {
        &self.log
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Converts the user's cart into an order.
    ///
    /// Returns the `Completed` order, or the error that stopped the saga after
    /// any reservations it made have been released.
    #[tracing::instrument(
        skip(self, request),
        fields(user_id = %request.user_id, payment_method = %request.payment_method)
    )]
    pub async fn create_order(&self, request: CreateOrderRequest) -> Result<Order> {
        metrics::counter!("checkout_sagas_total").increment(1);
        let started = Instant::now();

        let result = self
            .place_order(request, started + self.config.saga_deadline)
            .await;

        metrics::histogram!("checkout_saga_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        if let Err(ref e) = result {
            tracing::info!(error = %e, kind = e.kind(), "checkout rejected");
        }
        result
    }

    /// Drives an interrupted saga to a terminal state.
    ///
    /// Orders still moving forward replay their remaining steps with the
    /// original idempotency keys; orders already compensating finish their
    /// rollback.
    #[tracing::instrument(skip(self, order), fields(order_id = %order.id(), status = %order.status()))]
    pub async fn resume(&self, order: Order) -> Result<Order> {
        let _guard = self.claim_run(order.id())?;
        let deadline = Instant::now() + self.config.saga_deadline;
        match order.status() {
            OrderStatus::Compensating => self.finish_compensation(order.id(), None).await,
            status if status.is_in_flight() => self.run_forward(order, deadline).await,
            status => Err(SagaError::Validation(format!(
                "order {} is {status}, nothing to resume",
                order.id()
            ))),
        }
    }

    /// Loads an order by ID.
    #[tracing::instrument(skip(self))]
    pub async fn get_order(&self, order_id: OrderId) -> Result<Order> {
        self.store
            .get_order(order_id)
            .await?
            .ok_or_else(|| SagaError::NotFound(format!("order {order_id}")))
    }

    /// Loads a user's orders, newest first.
    #[tracing::instrument(skip(self))]
    pub async fn orders_for_user(&self, user_id: UserId) -> Result<Vec<Order>> {
        Ok(self.store.orders_for_user(user_id).await?)
    }

    /// Applies an externally-driven fulfillment status.
    ///
    /// Only `processing`, `shipped`, `delivered` and `cancelled` can be set,
    /// and only along legal transitions.
    #[tracing::instrument(skip(self))]
    pub async fn update_status(&self, order_id: OrderId, status: OrderStatus) -> Result<Order> {
        if !status.is_fulfillment() {
            return Err(SagaError::Validation(format!(
                "status '{status}' is managed by the checkout saga"
            )));
        }

        let order = self.store.update_status(order_id, status, None).await?;
        tracing::info!(%order_id, %status, "order status updated");
        Ok(order)
    }

    async fn place_order(&self, request: CreateOrderRequest, deadline: Instant) -> Result<Order> {
        let payment_method: PaymentMethod = request.payment_method.parse()?;
        if request.address.trim().is_empty() {
            return Err(SagaError::Validation("delivery address is required".into()));
        }
        let user_id = request.user_id;

        let cart = self
            .executor
            .execute(StepName::FetchCart, None, || self.cart.get_cart(user_id))
            .await?;
        if cart.is_empty() {
            return Err(SagaError::Validation(format!(
                "cart for user {user_id} is empty"
            )));
        }

        let mut steps = vec![SagaStep::completed(
            StepName::FetchCart,
            StepTarget::User(user_id),
        )];

        if payment_method.requires_feature_flag() {
            let flag = self.config.cod_flag_name.as_str();
            let enabled = self
                .executor
                .execute(StepName::CheckFeatureFlag, None, || {
                    self.flags.is_enabled(flag)
                })
                .await?;
            if !enabled {
                return Err(SagaError::FeatureDisabled(format!(
                    "{payment_method} payments are disabled ({flag})"
                )));
            }
            steps.push(SagaStep::completed(
                StepName::CheckFeatureFlag,
                StepTarget::Flag(flag.to_string()),
            ));
        }

        let items = cart
            .items
            .into_iter()
            .map(|line| OrderItem::new(line.product_id, line.quantity, line.price))
            .collect();
        let mut order = Order::new(
            OrderId::new(),
            user_id,
            items,
            payment_method,
            request.address,
        )?;
        for step in steps {
            order.record_step(step);
        }
        order.transition_to(OrderStatus::Reserving)?;
        let _guard = self.claim_run(order.id())?;

        self.store.create_order_record(&order).await?;
        tracing::info!(order_id = %order.id(), total = %order.total(), "order record created");

        self.run_forward(order, deadline).await
    }

    /// Runs the remaining forward steps, compensating if one of them fails.
    async fn run_forward(&self, order: Order, deadline: Instant) -> Result<Order> {
        let order_id = order.id();

        match self.advance(order, deadline).await {
            Ok(order) => {
                metrics::counter!("checkout_sagas_completed").increment(1);
                tracing::info!(%order_id, total = %order.total(), "checkout saga completed");
                Ok(order)
            }
            Err(interrupted) if !interrupted.compensate => {
                tracing::warn!(
                    %order_id,
                    error = %interrupted.error,
                    "saga stopped after the cart was cleared; recovery will complete it"
                );
                Err(interrupted.error)
            }
            Err(Interrupted {
                error, unlogged, ..
            }) => {
                tracing::warn!(%order_id, %error, "checkout step failed, compensating");

                // Releases only start once the order is durably Compensating;
                // otherwise recovery would roll it forward over released stock.
                self.store
                    .update_status(order_id, OrderStatus::Compensating, Some(error.to_string()))
                    .await?;

                self.finish_compensation(order_id, unlogged).await?;
                Err(error)
            }
        }
    }

    async fn advance(
        &self,
        mut order: Order,
        deadline: Instant,
    ) -> std::result::Result<Order, Interrupted> {
        let order_id = order.id();

        if order.status() == OrderStatus::Pending {
            order = self
                .store
                .update_status(order_id, OrderStatus::Reserving, None)
                .await?;
        }

        if order.status() == OrderStatus::Reserving {
            self.reserve_items(&order, deadline).await?;
            order = self
                .store
                .update_status(order_id, OrderStatus::ItemsReserved, None)
                .await?;
        }

        if order.status() == OrderStatus::ItemsReserved {
            order = self.clear_cart(&order, deadline).await?;
        }

        let cart_cleared = order.status() == OrderStatus::CartCleared;
        self.store
            .update_status(order_id, OrderStatus::Completed, None)
            .await
            .map_err(|err| {
                if cart_cleared {
                    Interrupted::settled(err.into())
                } else {
                    err.into()
                }
            })
    }

    /// Reserves every item not yet in the compensation log.
    async fn reserve_items(
        &self,
        order: &Order,
        deadline: Instant,
    ) -> std::result::Result<(), Interrupted> {
        let order_id = order.id();
        let logged = self.log.entries_for(order_id).await?;
        let mut sequence = logged.iter().map(|entry| entry.sequence).max().unwrap_or(0);
        let done: HashSet<IdempotencyKey> = logged
            .into_iter()
            .map(|entry| entry.idempotency_key)
            .collect();

        for item in order.items() {
            let key = IdempotencyKey::reservation(order_id, &item.product_id);
            if done.contains(&key) {
                continue;
            }
            self.check_deadline(order_id, deadline)?;

            let delta = -i64::from(item.quantity);
            self.executor
                .execute(StepName::ReserveStock, Some(&key), || {
                    self.catalog.adjust_stock(&item.product_id, delta, &key)
                })
                .await?;

            sequence += 1;
            let entry = CompensationLogEntry::stock_reservation(
                order_id,
                sequence,
                item.product_id.clone(),
                item.quantity,
            );
            if let Err(err) = self.log.append(entry).await {
                tracing::error!(%order_id, product_id = %item.product_id, error = %err, "reservation applied but not logged");
                let recorded = self
                    .store
                    .append_saga_step(
                        order_id,
                        SagaStep::unlogged(item.product_id.clone(), item.quantity),
                    )
                    .await;
                return Err(Interrupted {
                    error: err.into(),
                    unlogged: recorded.is_err().then(|| item.clone()),
                    compensate: true,
                });
            }

            self.store
                .append_saga_step(
                    order_id,
                    SagaStep::reserved(item.product_id.clone(), item.quantity),
                )
                .await?;
            tracing::info!(%order_id, product_id = %item.product_id, quantity = item.quantity, "stock reserved");
        }

        Ok(())
    }

    async fn clear_cart(
        &self,
        order: &Order,
        deadline: Instant,
    ) -> std::result::Result<Order, Interrupted> {
        let order_id = order.id();
        let user_id = order.user_id();
        self.check_deadline(order_id, deadline)?;

        let key = IdempotencyKey::cart_clear(order_id);
        let cleared = self
            .executor
            .execute(StepName::ClearCart, Some(&key), || {
                self.cart.clear_cart(user_id, &key)
            })
            .await;

        match cleared {
            // The cart is gone; from here a store failure leaves the order
            // ItemsReserved and recovery replays the clear under its key.
            Ok(()) => {
                self.store
                    .append_saga_step(
                        order_id,
                        SagaStep::completed(StepName::ClearCart, StepTarget::User(user_id)),
                    )
                    .await
                    .map_err(|err| Interrupted::settled(err.into()))?;
                self.store
                    .update_status(order_id, OrderStatus::CartCleared, None)
                    .await
                    .map_err(|err| Interrupted::settled(err.into()))
            }
            Err(error) => match self.config.cart_clear_policy {
                CartClearPolicy::Compensate => Err(error.into()),
                CartClearPolicy::BestEffort => {
                    tracing::warn!(%order_id, %error, "cart clear failed, completing order anyway");
                    Ok(self
                        .store
                        .append_saga_step(
                            order_id,
                            SagaStep::failed(
                                StepName::ClearCart,
                                StepTarget::User(user_id),
                                error.to_string(),
                            ),
                        )
                        .await?)
                }
            },
        }
    }

    /// Releases reservations recorded on the order but missing from the log,
    /// then logged ones newest first, and settles the order as `Compensated`
    /// or `Failed`.
    ///
    /// The order must already be `Compensating`. A store or log failure
    /// leaves it there for the recovery sweep; release keys make the rerun safe.
    #[tracing::instrument(skip(self, unlogged))]
    async fn finish_compensation(
        &self,
        order_id: OrderId,
        unlogged: Option<OrderItem>,
    ) -> Result<Order> {
        let mut failures = Vec::new();

        let order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or_else(|| SagaError::NotFound(format!("order {order_id}")))?;
        let mut unlogged_releases = order.unreleased_unlogged();
        if let Some(item) = unlogged {
            unlogged_releases.push(Compensation::RestoreStock {
                product_id: item.product_id,
                quantity: item.quantity,
            });
        }

        for compensation in unlogged_releases {
            let Compensation::RestoreStock {
                product_id,
                quantity,
            } = compensation;
            let key = IdempotencyKey::release(order_id, &product_id);
            let delta = i64::from(quantity);
            let released = self
                .executor
                .execute(StepName::ReleaseStock, Some(&key), || {
                    self.catalog.adjust_stock(&product_id, delta, &key)
                })
                .await;

            let step = match released {
                Ok(()) => {
                    tracing::info!(%order_id, %product_id, quantity = delta, "unlogged reservation released");
                    SagaStep::compensated(product_id)
                }
                Err(err) => {
                    tracing::error!(%order_id, %product_id, error = %err, "release of unlogged reservation failed");
                    failures.push(format!("{product_id}: {err}"));
                    SagaStep::failed(
                        StepName::ReleaseStock,
                        StepTarget::Product(product_id),
                        err.to_string(),
                    )
                }
            };
            self.store.append_saga_step(order_id, step).await?;
        }

        for entry in self.log.pending_compensation(order_id).await? {
            let key = entry.compensation_key();
            let delta = entry.inverse_delta();
            let released = self
                .executor
                .execute(StepName::ReleaseStock, Some(&key), || {
                    self.catalog.adjust_stock(&entry.target, delta, &key)
                })
                .await;

            match released {
                Ok(()) => {
                    self.log.mark_compensated(&entry).await?;
                    self.store
                        .append_saga_step(order_id, SagaStep::compensated(entry.target.clone()))
                        .await?;
                    tracing::info!(%order_id, product_id = %entry.target, quantity = delta, "stock released");
                }
                Err(err) => {
                    tracing::error!(%order_id, product_id = %entry.target, error = %err, "stock release failed");
                    failures.push(format!("{}: {err}", entry.target));
                    self.store
                        .append_saga_step(
                            order_id,
                            SagaStep::failed(
                                StepName::ReleaseStock,
                                StepTarget::Product(entry.target.clone()),
                                err.to_string(),
                            ),
                        )
                        .await?;
                }
            }
        }

        if failures.is_empty() {
            let order = self
                .store
                .update_status(order_id, OrderStatus::Compensated, None)
                .await?;
            metrics::counter!("checkout_sagas_compensated").increment(1);
            tracing::warn!(
                %order_id,
                reason = order.failure_reason().unwrap_or("unknown"),
                "checkout saga compensated"
            );
            Ok(order)
        } else {
            let reason = failures.join("; ");
            self.store
                .update_status(order_id, OrderStatus::Failed, Some(reason.clone()))
                .await?;
            metrics::counter!("checkout_sagas_failed").increment(1);
            tracing::error!(%order_id, %reason, "compensation failed, order needs manual reconciliation");
            Err(SagaError::Compensation { order_id, reason })
        }
    }

    fn claim_run(&self, order_id: OrderId) -> Result<RunGuard<'_>> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if !running.insert(order_id) {
            return Err(SagaError::AlreadyRunning(order_id));
        }
        Ok(RunGuard {
            running: &self.running,
            order_id,
        })
    }

    fn check_deadline(&self, order_id: OrderId, deadline: Instant) -> Result<()> {
        if Instant::now() >= deadline {
            tracing::warn!(%order_id, "saga deadline exceeded");
            return Err(SagaError::DeadlineExceeded(order_id));
        }
        Ok(())
    }
}
