//! Collaborator contracts used by the checkout saga, with in-memory implementations.

pub mod cart;
pub mod catalog;
pub mod feature_flags;

use common::ProductId;
use thiserror::Error;

pub use cart::{Cart, CartItem, CartService, InMemoryCartService};
pub use catalog::{CatalogService, InMemoryCatalogService, Product};
pub use feature_flags::{FeatureFlagService, InMemoryFeatureFlagService};

/// Errors reported by a collaborator call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The call did not complete in time. The effect may or may not have been applied.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The collaborator could not be reached or answered with a server error.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// The requested entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The collaborator rejected the request as malformed.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// A negative stock adjustment would drive stock below zero.
    #[error("Insufficient stock for {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: ProductId,
        requested: u32,
        available: i64,
    },
}

impl ServiceError {
    /// Returns true if the same call may succeed when repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServiceError::Timeout(_) | ServiceError::Unavailable(_))
    }
}
