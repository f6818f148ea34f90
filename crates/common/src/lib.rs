//! Identifiers shared by the domain, storage, and saga layers.

mod idempotency;
mod ids;

pub use idempotency::IdempotencyKey;
pub use ids::{OrderId, ProductId, UserId};
