//! Saga step records kept on the order.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::{ProductId, UserId};
use serde::{Deserialize, Serialize};

use super::OrderError;

/// The operations of the checkout saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    FetchCart,
    CheckFeatureFlag,
    ReserveStock,
    ClearCart,
    /// Compensation of `ReserveStock`.
    ReleaseStock,
}

impl StepName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::FetchCart => "fetch_cart",
            StepName::CheckFeatureFlag => "check_feature_flag",
            StepName::ReserveStock => "reserve_stock",
            StepName::ClearCart => "clear_cart",
            StepName::ReleaseStock => "release_stock",
        }
    }

    /// Returns true if the step changes state in another service.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            StepName::ReserveStock | StepName::ClearCart | StepName::ReleaseStock
        )
    }
}

impl std::fmt::Display for StepName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepName {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fetch_cart" => Ok(StepName::FetchCart),
            "check_feature_flag" => Ok(StepName::CheckFeatureFlag),
            "reserve_stock" => Ok(StepName::ReserveStock),
            "clear_cart" => Ok(StepName::ClearCart),
            "release_stock" => Ok(StepName::ReleaseStock),
            other => Err(OrderError::UnknownStep(other.to_string())),
        }
    }
}

/// Outcome of a single saga step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Completed,
    Compensated,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Completed => "completed",
            StepStatus::Compensated => "compensated",
            StepStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The entity a step acted on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum StepTarget {
    User(UserId),
    Product(ProductId),
    Flag(String),
}

impl std::fmt::Display for StepTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepTarget::User(id) => write!(f, "user:{id}"),
            StepTarget::Product(id) => write!(f, "product:{id}"),
            StepTarget::Flag(name) => write!(f, "flag:{name}"),
        }
    }
}

/// Describes how to reverse a completed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Compensation {
    /// Give back stock taken by a reservation.
    RestoreStock { product_id: ProductId, quantity: u32 },
}

/// A record of one saga step, appended to the order as the saga progresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaStep {
    pub name: StepName,
    pub target: StepTarget,
    pub status: StepStatus,
    /// How to undo this step; `None` for steps with no remote side effect.
    pub compensation: Option<Compensation>,
    /// Failure message or other context.
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl SagaStep {
    fn new(name: StepName, target: StepTarget, status: StepStatus) -> Self {
        Self {
            name,
            target,
            status,
            compensation: None,
            detail: None,
            recorded_at: Utc::now(),
        }
    }

    /// A step that finished successfully.
    pub fn completed(name: StepName, target: StepTarget) -> Self {
        Self::new(name, target, StepStatus::Completed)
    }

    /// A stock reservation that finished successfully, with its inverse.
    pub fn reserved(product_id: ProductId, quantity: u32) -> Self {
        Self::completed(StepName::ReserveStock, StepTarget::Product(product_id.clone()))
            .with_compensation(Compensation::RestoreStock {
                product_id,
                quantity,
            })
    }

    /// A reservation that took effect but could not be added to the
    /// compensation log. It stays `Pending` until a release is recorded.
    pub fn unlogged(product_id: ProductId, quantity: u32) -> Self {
        Self::new(
            StepName::ReserveStock,
            StepTarget::Product(product_id.clone()),
            StepStatus::Pending,
        )
        .with_compensation(Compensation::RestoreStock {
            product_id,
            quantity,
        })
    }

    /// A reservation that has been undone.
    pub fn compensated(product_id: ProductId) -> Self {
        Self::new(
            StepName::ReserveStock,
            StepTarget::Product(product_id),
            StepStatus::Compensated,
        )
    }

    /// A step that failed.
    pub fn failed(name: StepName, target: StepTarget, detail: impl Into<String>) -> Self {
        Self::new(name, target, StepStatus::Failed).with_detail(detail)
    }

    pub fn with_compensation(mut self, compensation: Compensation) -> Self {
        self.compensation = Some(compensation);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
