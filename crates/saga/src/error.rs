//! Saga error types.

use common::{OrderId, ProductId};
use domain::{OrderError, StepName};
use order_store::StoreError;
use thiserror::Error;

/// Errors returned to callers of the checkout saga and the order API.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The request or cart was rejected before any side effect.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The order, cart, product, or flag does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The catalog refused a reservation because stock would go below zero.
    #[error("Insufficient stock for {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: ProductId,
        requested: u32,
        available: i64,
    },

    /// The feature gating the requested payment method is off.
    #[error("Feature disabled: {0}")]
    FeatureDisabled(String),

    /// A collaborator kept failing with transient errors until retries ran out.
    #[error("Step '{step}' unavailable after {attempts} attempt(s): {last_error}")]
    RemoteUnavailable {
        step: StepName,
        attempts: u32,
        last_error: String,
    },

    /// The local order store or compensation log failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Rollback did not complete; the order needs manual reconciliation.
    #[error("Compensation failed for order {order_id}: {reason}")]
    Compensation { order_id: OrderId, reason: String },

    /// The saga ran past its overall deadline.
    #[error("Saga deadline exceeded for order {0}")]
    DeadlineExceeded(OrderId),

    /// Another task of this orchestrator is already driving the order.
    #[error("Saga for order {0} is already running")]
    AlreadyRunning(OrderId),
}

impl SagaError {
    /// Short label used as a metrics tag and in stored failure reasons.
    pub fn kind(&self) -> &'static str {
        match self {
            SagaError::Validation(_) => "validation",
            SagaError::NotFound(_) => "not_found",
            SagaError::InsufficientStock { .. } => "insufficient_stock",
            SagaError::FeatureDisabled(_) => "feature_disabled",
            SagaError::RemoteUnavailable { .. } => "remote_unavailable",
            SagaError::Persistence(_) => "persistence",
            SagaError::Compensation { .. } => "compensation",
            SagaError::DeadlineExceeded(_) => "deadline_exceeded",
            SagaError::AlreadyRunning(_) => "already_running",
        }
    }
}

impl From<StoreError> for SagaError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::OrderNotFound(id) => SagaError::NotFound(format!("order {id}")),
            StoreError::Domain(e) => SagaError::Validation(e.to_string()),
            other => SagaError::Persistence(other.to_string()),
        }
    }
}

impl From<OrderError> for SagaError {
    fn from(err: OrderError) -> Self {
        SagaError::Validation(err.to_string())
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
