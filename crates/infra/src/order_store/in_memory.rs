use std::collections::HashMap;
use std::sync::RwLock;

use medipaw_orders::{FulfillmentStatus, Order, OrderId};

use super::{OrderStore, StoreError};

/// In-memory order store.
///
/// Intended for dev and tests. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryOrderStore {
    orders: RwLock<HashMap<OrderId, Order>>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OrderStore for InMemoryOrderStore {
    fn insert(&self, order: &Order) -> Result<(), StoreError> {
        let mut orders = self.orders.write().unwrap_or_else(|e| e.into_inner());
        if orders.contains_key(&order.id_typed()) {
            return Err(StoreError::Conflict(format!(
                "order {} already exists",
                order.id_typed()
            )));
        }
        orders.insert(order.id_typed(), order.clone());
        Ok(())
    }

    fn update(&self, order: &Order) -> Result<(), StoreError> {
        let mut orders = self.orders.write().unwrap_or_else(|e| e.into_inner());
        match orders.get_mut(&order.id_typed()) {
            Some(existing) => {
                *existing = order.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    fn load(&self, id: OrderId) -> Result<Order, StoreError> {
        let orders = self.orders.read().unwrap_or_else(|e| e.into_inner());
        orders.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    fn list_by_status(&self, status: FulfillmentStatus) -> Result<Vec<Order>, StoreError> {
        let orders = self.orders.read().unwrap_or_else(|e| e.into_inner());
        Ok(orders
            .values()
            .filter(|o| o.fulfillment_status() == status)
            .cloned()
            .collect())
    }
}
