use serde::{Deserialize, Serialize};

use crate::{OrderId, ProductId};

/// Deterministic token attached to every mutating collaborator call.
///
/// Keys are derived only from the order and the target of the call, so a
/// retried request, or a request replayed by crash recovery, carries the same
/// key as the original and is applied at most once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Key for the stock reservation of `product_id` within `order_id`.
    pub fn reservation(order_id: OrderId, product_id: &ProductId) -> Self {
        Self(format!("order:{order_id}:reserve:{product_id}"))
    }

    /// Key for the compensating stock release of `product_id` within `order_id`.
    pub fn release(order_id: OrderId, product_id: &ProductId) -> Self {
        Self(format!("order:{order_id}:release:{product_id}"))
    }

    /// Key for clearing the buyer's cart once `order_id` is reserved.
    pub fn cart_clear(order_id: OrderId) -> Self {
        Self(format!("order:{order_id}:clear-cart"))
    }

    /// Wraps a key received from elsewhere (e.g. read back from storage).
    pub fn from_raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for IdempotencyKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
