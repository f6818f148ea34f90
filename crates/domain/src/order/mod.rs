//! Order aggregate and related types.

mod aggregate;
mod saga_step;
mod status;
mod value_objects;

pub use aggregate::{Order, OrderRecord};
pub use saga_step::{Compensation, SagaStep, StepName, StepStatus, StepTarget};
pub use status::OrderStatus;
pub use value_objects::{Money, OrderItem, PaymentMethod};

use thiserror::Error;

/// Errors that can occur during order operations.
#[derive(Debug, Error)]
pub enum OrderError {
    /// Order has no items.
    #[error("Order has no items")]
    NoItems,

    /// Invalid quantity.
    #[error("Invalid quantity for {product_id}: {quantity} (must be greater than 0)")]
    InvalidQuantity { product_id: String, quantity: u32 },

    /// Invalid price.
    #[error("Invalid price for {product_id}: {price} (must not be negative)")]
    InvalidPrice { product_id: String, price: i64 },

    /// The same product appears on more than one line.
    #[error("Duplicate product in order: {product_id}")]
    DuplicateProduct { product_id: String },

    /// Delivery address is required.
    #[error("Delivery address is required")]
    AddressRequired,

    /// Payment method is not one the storefront accepts.
    #[error("Unknown payment method: {0}")]
    UnknownPaymentMethod(String),

    /// Status name could not be parsed.
    #[error("Unknown order status: {0}")]
    UnknownStatus(String),

    /// Saga step name could not be parsed.
    #[error("Unknown saga step: {0}")]
    UnknownStep(String),

    /// Order is not in a status that allows the requested transition.
    #[error("Invalid state transition: cannot move from {from} to {to}")]
    InvalidStateTransition { from: OrderStatus, to: OrderStatus },
}
