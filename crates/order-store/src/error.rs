use common::OrderId;
use domain::OrderError;
use thiserror::Error;

/// Errors that can occur when reading or writing orders and the compensation log.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The order does not exist.
    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    /// An order with the same ID has already been stored.
    #[error("Order already exists: {0}")]
    OrderAlreadyExists(OrderId),

    /// The write would break an order invariant (e.g. an illegal status transition).
    #[error("Order rule violated: {0}")]
    Domain(#[from] OrderError),

    /// A stored value could not be mapped back to the domain model.
    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    /// The storage backend rejected or failed the operation.
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
