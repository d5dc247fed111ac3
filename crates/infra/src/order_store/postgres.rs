//! Postgres-backed order store.
//!
//! One row per order; the `body` column holds the full serialized aggregate
//! and is the authoritative payload, while the status/total columns exist for
//! indexed queries.
//!
//! The `OrderStore` trait is synchronous; this implementation bridges into
//! async sqlx with `tokio::runtime::Handle`, which works when called from
//! within a tokio runtime (e.g. from axum handlers or `spawn_blocking`).

use std::sync::Arc;

use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};

use medipaw_orders::{FulfillmentStatus, Order, OrderId};

use super::{OrderStore, StoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS orders (
    id UUID PRIMARY KEY,
    user_id UUID NOT NULL,
    payment_status TEXT NOT NULL,
    fulfillment_status TEXT NOT NULL,
    total BIGINT NOT NULL CHECK (total >= 0),
    refund_due BOOLEAN NOT NULL DEFAULT FALSE,
    body JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS orders_fulfillment_status_idx ON orders (fulfillment_status);
"#;

fn status_as_db(status: FulfillmentStatus) -> &'static str {
    match status {
        FulfillmentStatus::Draft => "draft",
        FulfillmentStatus::AwaitingPayment => "awaiting_payment",
        FulfillmentStatus::Paid => "paid",
        FulfillmentStatus::UnderReview => "under_review",
        FulfillmentStatus::Fulfilling => "fulfilling",
        FulfillmentStatus::Completed => "completed",
        FulfillmentStatus::PaymentFailed => "payment_failed",
        FulfillmentStatus::PrescriptionRejected => "prescription_rejected",
        FulfillmentStatus::Cancelled => "cancelled",
        FulfillmentStatus::OutOfStock => "out_of_stock",
    }
}

fn payment_as_db(order: &Order) -> &'static str {
    match order.payment_status() {
        medipaw_orders::PaymentStatus::Unpaid => "unpaid",
        medipaw_orders::PaymentStatus::Paid => "paid",
        medipaw_orders::PaymentStatus::Refunded => "refunded",
    }
}

fn map_sqlx_error(op: &str, err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        // 23505 = unique violation: a concurrent insert won the race.
        if db_err.code().as_deref() == Some("23505") {
            return StoreError::Conflict(format!("{op}: duplicate key"));
        }
    }
    StoreError::Unavailable(format!("{op}: {err}"))
}

fn decode_body(body: JsonValue) -> Result<Order, StoreError> {
    serde_json::from_value(body)
        .map_err(|e| StoreError::Unavailable(format!("order body deserialization failed: {e}")))
}

/// Postgres-backed order store.
#[derive(Debug, Clone)]
pub struct PostgresOrderStore {
    pool: Arc<PgPool>,
}

impl PostgresOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the orders table if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    pub async fn insert_order(&self, order: &Order) -> Result<(), StoreError> {
        let body = serde_json::to_value(order)
            .map_err(|e| StoreError::Unavailable(format!("order serialization failed: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO orders
                (id, user_id, payment_status, fulfillment_status, total, refund_due,
                 body, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(order.id_typed().0.as_uuid())
        .bind(order.user_id().as_uuid())
        .bind(payment_as_db(order))
        .bind(status_as_db(order.fulfillment_status()))
        .bind(order.total() as i64)
        .bind(order.refund_due())
        .bind(body)
        .bind(order.created_at())
        .bind(order.updated_at())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert", e))?;

        Ok(())
    }

    pub async fn update_order(&self, order: &Order) -> Result<(), StoreError> {
        let body = serde_json::to_value(order)
            .map_err(|e| StoreError::Unavailable(format!("order serialization failed: {e}")))?;

        let result = sqlx::query(
            r#"
            UPDATE orders
            SET payment_status = $2,
                fulfillment_status = $3,
                refund_due = $4,
                body = $5,
                updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(order.id_typed().0.as_uuid())
        .bind(payment_as_db(order))
        .bind(status_as_db(order.fulfillment_status()))
        .bind(order.refund_due())
        .bind(body)
        .bind(order.updated_at())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub async fn load_order(&self, id: OrderId) -> Result<Order, StoreError> {
        let row = sqlx::query("SELECT body FROM orders WHERE id = $1")
            .bind(id.0.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load", e))?
            .ok_or(StoreError::NotFound)?;

        let body: JsonValue = row
            .try_get("body")
            .map_err(|e| StoreError::Unavailable(format!("load: {e}")))?;
        decode_body(body)
    }

    pub async fn list_orders_by_status(
        &self,
        status: FulfillmentStatus,
    ) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query("SELECT body FROM orders WHERE fulfillment_status = $1")
            .bind(status_as_db(status))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_by_status", e))?;

        let mut orders = Vec::with_capacity(rows.len());
        for row in rows {
            let body: JsonValue = row
                .try_get("body")
                .map_err(|e| StoreError::Unavailable(format!("list_by_status: {e}")))?;
            orders.push(decode_body(body)?);
        }
        Ok(orders)
    }

    fn runtime_handle() -> Result<tokio::runtime::Handle, StoreError> {
        tokio::runtime::Handle::try_current().map_err(|_| {
            StoreError::Unavailable(
                "PostgresOrderStore requires a tokio runtime context".to_string(),
            )
        })
    }
}

impl OrderStore for PostgresOrderStore {
    fn insert(&self, order: &Order) -> Result<(), StoreError> {
        Self::runtime_handle()?.block_on(self.insert_order(order))
    }

    fn update(&self, order: &Order) -> Result<(), StoreError> {
        Self::runtime_handle()?.block_on(self.update_order(order))
    }

    fn load(&self, id: OrderId) -> Result<Order, StoreError> {
        Self::runtime_handle()?.block_on(self.load_order(id))
    }

    fn list_by_status(&self, status: FulfillmentStatus) -> Result<Vec<Order>, StoreError> {
        Self::runtime_handle()?.block_on(self.list_orders_by_status(status))
    }
}
