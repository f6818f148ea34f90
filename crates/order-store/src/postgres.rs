//! PostgreSQL implementations of the order store and compensation log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{IdempotencyKey, OrderId, ProductId, UserId};
use domain::{Money, Order, OrderItem, OrderRecord, OrderStatus, SagaStep};
use sqlx::{PgConnection, PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    CompensationLogEntry, Result, StoreError, compensation::CompensationLog, store::OrderStore,
};

/// Statuses the recovery sweep is interested in, as stored.
fn in_flight_statuses() -> Vec<&'static str> {
    OrderStatus::ALL
        .iter()
        .filter(|s| s.is_in_flight())
        .map(OrderStatus::as_str)
        .collect()
}

fn user_id_to_db(user_id: UserId) -> Result<i64> {
    i64::try_from(user_id.as_u64())
        .map_err(|_| StoreError::InvalidData(format!("user id {user_id} out of range")))
}

fn index_to_db(index: usize, what: &str) -> Result<i32> {
    i32::try_from(index)
        .map_err(|_| StoreError::InvalidData(format!("{what} {index} out of range")))
}

fn user_id_from_db(value: i64) -> Result<UserId> {
    u64::try_from(value)
        .map(UserId::new)
        .map_err(|_| StoreError::InvalidData(format!("negative user id {value}")))
}

/// PostgreSQL-backed order store.
///
/// Expects the schema from `migrations/001_create_orders.sql`.
#[derive(Clone)]
pub struct PostgresOrderStore {
    pool: PgPool,
}

impl PostgresOrderStore {
    /// Creates a new PostgreSQL order store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_item(row: PgRow) -> Result<OrderItem> {
        let quantity: i32 = row.try_get("quantity")?;
        let quantity = u32::try_from(quantity)
            .map_err(|_| StoreError::InvalidData(format!("negative quantity {quantity}")))?;

        Ok(OrderItem {
            product_id: ProductId::new(row.try_get::<String, _>("product_id")?),
            quantity,
            unit_price: Money::from_cents(row.try_get("unit_price_cents")?),
        })
    }

    /// Loads one order with its items and saga steps on the given connection.
    async fn load_order(conn: &mut PgConnection, order_id: OrderId) -> Result<Option<Order>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, status, payment_method, address, failure_reason, created_at, updated_at
            FROM orders
            WHERE id = $1
            "#,
        )
        .bind(order_id.as_uuid())
        .fetch_optional(&mut *conn)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let items = sqlx::query(
            r#"
            SELECT product_id, quantity, unit_price_cents
            FROM order_items
            WHERE order_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(order_id.as_uuid())
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(Self::row_to_item)
        .collect::<Result<Vec<_>>>()?;

        let saga_steps = sqlx::query(
            r#"
            SELECT step
            FROM saga_steps
            WHERE order_id = $1
            ORDER BY sequence ASC
            "#,
        )
        .bind(order_id.as_uuid())
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(|r| {
            let step: serde_json::Value = r.try_get("step")?;
            Ok(serde_json::from_value::<SagaStep>(step)?)
        })
        .collect::<Result<Vec<_>>>()?;

        let status: String = row.try_get("status")?;
        let payment_method: String = row.try_get("payment_method")?;

        Ok(Some(Order::restore(OrderRecord {
            id: OrderId::from_uuid(row.try_get::<Uuid, _>("id")?),
            user_id: user_id_from_db(row.try_get("user_id")?)?,
            items,
            status: status.parse()?,
            payment_method: payment_method.parse()?,
            address: row.try_get("address")?,
            saga_steps,
            failure_reason: row.try_get("failure_reason")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })))
    }

    /// Locks the order row for the rest of the transaction and returns its status.
    async fn lock_order(conn: &mut PgConnection, order_id: OrderId) -> Result<OrderStatus> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM orders WHERE id = $1 FOR UPDATE")
                .bind(order_id.as_uuid())
                .fetch_optional(&mut *conn)
                .await?;

        let status = status.ok_or(StoreError::OrderNotFound(order_id))?;
        Ok(status.parse()?)
    }

    async fn insert_step(
        conn: &mut PgConnection,
        order_id: OrderId,
        sequence: i32,
        step: &SagaStep,
    ) -> Result<()> {
        sqlx::query("INSERT INTO saga_steps (order_id, sequence, step) VALUES ($1, $2, $3)")
            .bind(order_id.as_uuid())
            .bind(sequence)
            .bind(serde_json::to_value(step)?)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn load_many(&self, ids: Vec<Uuid>) -> Result<Vec<Order>> {
        let mut conn = self.pool.acquire().await?;
        let mut orders = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(order) = Self::load_order(&mut conn, OrderId::from_uuid(id)).await? {
                orders.push(order);
            }
        }
        Ok(orders)
    }
}

#[async_trait]
impl OrderStore for PostgresOrderStore {
    async fn create_order_record(&self, order: &Order) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO orders (id, user_id, status, payment_method, address, failure_reason, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(order.id().as_uuid())
        .bind(user_id_to_db(order.user_id())?)
        .bind(order.status().as_str())
        .bind(order.payment_method().as_str())
        .bind(order.address())
        .bind(order.failure_reason())
        .bind(order.created_at())
        .bind(order.updated_at())
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(StoreError::OrderAlreadyExists(order.id()));
        }

        for (position, item) in order.items().iter().enumerate() {
            let quantity = i32::try_from(item.quantity).map_err(|_| {
                StoreError::InvalidData(format!("quantity {} out of range", item.quantity))
            })?;

            sqlx::query(
                r#"
                INSERT INTO order_items (order_id, position, product_id, quantity, unit_price_cents)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(order.id().as_uuid())
            .bind(index_to_db(position, "item position")?)
            .bind(item.product_id.as_str())
            .bind(quantity)
            .bind(item.unit_price.cents())
            .execute(&mut *tx)
            .await?;
        }

        for (index, step) in order.saga_steps().iter().enumerate() {
            let sequence = index_to_db(index + 1, "step sequence")?;
            Self::insert_step(&mut tx, order.id(), sequence, step).await?;
        }

        tx.commit().await?;
        tracing::debug!(order_id = %order.id(), "order record created");
        Ok(())
    }

    async fn update_status(
        &self,
        order_id: OrderId,
        status: OrderStatus,
        reason: Option<String>,
    ) -> Result<Order> {
        let mut tx = self.pool.begin().await?;

        let current = Self::lock_order(&mut tx, order_id).await?;
        current.ensure_transition(status)?;

        sqlx::query(
            r#"
            UPDATE orders
            SET status = $2, failure_reason = COALESCE(failure_reason, $3), updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(order_id.as_uuid())
        .bind(status.as_str())
        .bind(reason)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        let order = Self::load_order(&mut tx, order_id)
            .await?
            .ok_or(StoreError::OrderNotFound(order_id))?;
        tx.commit().await?;

        metrics::counter!("order_status_updates_total", "status" => status.as_str())
            .increment(1);
        Ok(order)
    }

    async fn append_saga_step(&self, order_id: OrderId, step: SagaStep) -> Result<Order> {
        let mut tx = self.pool.begin().await?;

        Self::lock_order(&mut tx, order_id).await?;

        let next: i32 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sequence), 0) + 1 FROM saga_steps WHERE order_id = $1",
        )
        .bind(order_id.as_uuid())
        .fetch_one(&mut *tx)
        .await?;

        Self::insert_step(&mut tx, order_id, next, &step).await?;

        sqlx::query("UPDATE orders SET updated_at = $2 WHERE id = $1")
            .bind(order_id.as_uuid())
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;

        let order = Self::load_order(&mut tx, order_id)
            .await?
            .ok_or(StoreError::OrderNotFound(order_id))?;
        tx.commit().await?;
        Ok(order)
    }

    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>> {
        let mut conn = self.pool.acquire().await?;
        Self::load_order(&mut conn, order_id).await
    }

    async fn orders_for_user(&self, user_id: UserId) -> Result<Vec<Order>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM orders WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id_to_db(user_id)?)
        .fetch_all(&self.pool)
        .await?;

        self.load_many(ids).await
    }

    async fn stale_orders(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Order>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM orders
            WHERE status = ANY($1) AND updated_at <= $2
            ORDER BY updated_at ASC
            LIMIT $3
            "#,
        )
        .bind(in_flight_statuses())
        .bind(updated_before)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        self.load_many(ids).await
    }

    async fn claim_stale(
        &self,
        order_id: OrderId,
        updated_before: DateTime<Utc>,
    ) -> Result<Option<Order>> {
        let mut tx = self.pool.begin().await?;

        // Compare-and-set on updated_at: a concurrent sweep or a saga write
        // in between makes this a no-op.
        let claimed = sqlx::query(
            r#"
            UPDATE orders SET updated_at = $3
            WHERE id = $1 AND status = ANY($2) AND updated_at <= $4
            "#,
        )
        .bind(order_id.as_uuid())
        .bind(in_flight_statuses())
        .bind(Utc::now())
        .bind(updated_before)
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let order = Self::load_order(&mut tx, order_id).await?;
        tx.commit().await?;
        Ok(order)
    }
}

/// PostgreSQL-backed compensation log.
#[derive(Clone)]
pub struct PostgresCompensationLog {
    pool: PgPool,
}

impl PostgresCompensationLog {
    /// Creates a new PostgreSQL compensation log.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_entry(row: PgRow) -> Result<CompensationLogEntry> {
        let sequence: i32 = row.try_get("sequence")?;
        let step_name: String = row.try_get("step_name")?;

        Ok(CompensationLogEntry {
            order_id: OrderId::from_uuid(row.try_get::<Uuid, _>("order_id")?),
            sequence: u32::try_from(sequence)
                .map_err(|_| StoreError::InvalidData(format!("negative sequence {sequence}")))?,
            step_name: step_name.parse()?,
            target: ProductId::new(row.try_get::<String, _>("target")?),
            applied_delta: row.try_get("applied_delta")?,
            idempotency_key: IdempotencyKey::from_raw(row.try_get::<String, _>("idempotency_key")?),
            recorded_at: row.try_get("recorded_at")?,
        })
    }
}

#[async_trait]
impl CompensationLog for PostgresCompensationLog {
    async fn append(&self, entry: CompensationLogEntry) -> Result<()> {
        let sequence = i32::try_from(entry.sequence)
            .map_err(|_| StoreError::InvalidData(format!("sequence {} too large", entry.sequence)))?;

        sqlx::query(
            r#"
            INSERT INTO compensation_log (order_id, sequence, step_name, target, applied_delta, idempotency_key, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(entry.order_id.as_uuid())
        .bind(sequence)
        .bind(entry.step_name.as_str())
        .bind(entry.target.as_str())
        .bind(entry.applied_delta)
        .bind(entry.idempotency_key.as_str())
        .bind(entry.recorded_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn entries_for(&self, order_id: OrderId) -> Result<Vec<CompensationLogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT order_id, sequence, step_name, target, applied_delta, idempotency_key, recorded_at
            FROM compensation_log
            WHERE order_id = $1
            ORDER BY sequence ASC
            "#,
        )
        .bind(order_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_entry).collect()
    }

    async fn mark_compensated(&self, entry: &CompensationLogEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO compensation_markers (idempotency_key, order_id, compensated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(entry.idempotency_key.as_str())
        .bind(entry.order_id.as_uuid())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn is_compensated(&self, entry: &CompensationLogEntry) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM compensation_markers WHERE idempotency_key = $1)",
        )
        .bind(entry.idempotency_key.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }
}
