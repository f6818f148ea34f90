//! Checkout saga for turning a shopping cart into an order.
//!
//! The cart, catalog and feature-flag services are owned elsewhere, so placing
//! an order is a sequence of remote calls that can fail partway:
//! 1. Fetch the cart
//! 2. Check the cash-on-delivery flag (cod orders only)
//! 3. Persist the order
//! 4. Reserve stock item by item, logging each reservation
//! 5. Clear the cart
//!
//! If a step fails after stock was reserved, the logged reservations are
//! released in reverse order. A [`RecoverySweep`] finishes sagas that were
//! interrupted by a crash.

pub mod api;
pub mod config;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod recovery;
pub mod services;

pub use api::{CreateOrderRequest, OrderItemResponse, OrderResponse, UpdateStatusRequest};
pub use config::{CartClearPolicy, OrchestratorConfig, RecoveryConfig, RetryConfig};
pub use error::{Result, SagaError};
pub use executor::StepExecutor;
pub use orchestrator::OrderOrchestrator;
pub use recovery::{RecoverySweep, SweepReport};
pub use services::{
    Cart, CartItem, CartService, CatalogService, FeatureFlagService, InMemoryCartService,
    InMemoryCatalogService, InMemoryFeatureFlagService, Product, ServiceError,
};
