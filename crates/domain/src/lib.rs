//! Domain layer for checkout orders.
//!
//! This crate provides the order aggregate placed by the checkout saga:
//! - `Order` with its line items and derived total
//! - `OrderStatus` state machine covering the saga and fulfillment
//! - `SagaStep` records describing what the saga did and how to undo it

pub mod order;

pub use common::{IdempotencyKey, OrderId, ProductId, UserId};
pub use order::{
    Compensation, Money, Order, OrderError, OrderItem, OrderRecord, OrderStatus, PaymentMethod,
    SagaStep, StepName, StepStatus, StepTarget,
};
