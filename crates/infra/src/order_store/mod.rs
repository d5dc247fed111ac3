//! Durable order records.
//!
//! The order record is the source of truth for an order's lifecycle;
//! reservations and broadcast topics are derived/ephemeral. Implementations
//! are handed to the fulfillment service at construction; there is no
//! global connection.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use thiserror::Error;

use medipaw_core::DomainError;
use medipaw_orders::{FulfillmentStatus, Order, OrderId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("order not found")]
    NotFound,

    #[error("store conflict: {0}")]
    Conflict(String),

    /// Storage/network hiccup; the caller retries with bounded backoff.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for DomainError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => DomainError::NotFound,
            StoreError::Conflict(msg) => DomainError::conflict(msg),
            StoreError::Unavailable(msg) => DomainError::transient(msg),
        }
    }
}

/// Keyed access to persisted order records.
pub trait OrderStore: Send + Sync {
    /// Persist a brand-new order. Fails on duplicate id.
    fn insert(&self, order: &Order) -> Result<(), StoreError>;

    /// Overwrite the record of an existing order.
    fn update(&self, order: &Order) -> Result<(), StoreError>;

    fn load(&self, id: OrderId) -> Result<Order, StoreError>;

    /// All orders currently in `status` (used by gating re-evaluation and
    /// the expiry sweep).
    fn list_by_status(&self, status: FulfillmentStatus) -> Result<Vec<Order>, StoreError>;
}

impl<S> OrderStore for Arc<S>
where
    S: OrderStore + ?Sized,
{
    fn insert(&self, order: &Order) -> Result<(), StoreError> {
        (**self).insert(order)
    }

    fn update(&self, order: &Order) -> Result<(), StoreError> {
        (**self).update(order)
    }

    fn load(&self, id: OrderId) -> Result<Order, StoreError> {
        (**self).load(id)
    }

    fn list_by_status(&self, status: FulfillmentStatus) -> Result<Vec<Order>, StoreError> {
        (**self).list_by_status(status)
    }
}

pub use in_memory::InMemoryOrderStore;
pub use postgres::PostgresOrderStore;
