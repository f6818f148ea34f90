//! Request and response types for the order-facing API.
//!
//! Transport-neutral: any HTTP or RPC layer can bind these with serde.

use common::UserId;
use domain::{Order, OrderItem, OrderStatus};
use serde::{Deserialize, Serialize};

use crate::error::Result;

// -- Request types --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    pub user_id: UserId,
    pub payment_method: String,
    pub address: String,
}

impl CreateOrderRequest {
    pub fn new(
        user_id: UserId,
        payment_method: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            payment_method: payment_method.into(),
            address: address.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
}

impl UpdateStatusRequest {
    /// Parses the requested status. Unknown names are a validation error.
    pub fn parse_status(&self) -> Result<OrderStatus> {
        Ok(self.status.parse()?)
    }
}

// -- Response types --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResponse {
    pub id: String,
    pub user_id: u64,
    pub status: String,
    pub payment_method: String,
    pub address: String,
    pub items: Vec<OrderItemResponse>,
    pub total_cents: i64,
    pub failure_reason: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItemResponse {
    pub product_id: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
    pub total_cents: i64,
}

impl From<&OrderItem> for OrderItemResponse {
    fn from(item: &OrderItem) -> Self {
        Self {
            product_id: item.product_id.to_string(),
            quantity: item.quantity,
            unit_price_cents: item.unit_price.cents(),
            total_cents: item.total_price().cents(),
        }
    }
}

impl From<&Order> for OrderResponse {
    fn from(order: &Order) -> Self {
        Self {
            id: order.id().to_string(),
            user_id: order.user_id().as_u64(),
            status: order.status().to_string(),
            payment_method: order.payment_method().to_string(),
            address: order.address().to_string(),
            items: order.items().iter().map(OrderItemResponse::from).collect(),
            total_cents: order.total().cents(),
            failure_reason: order.failure_reason().map(str::to_string),
            created_at: order.created_at().to_rfc3339(),
            updated_at: order.updated_at().to_rfc3339(),
        }
    }
}
