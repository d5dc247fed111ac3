use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use medipaw_catalog::ProductId;
use medipaw_core::AggregateId;

/// Reservations outstanding longer than this are swept back to available
/// stock (abandoned checkouts must not lock stock forever).
pub const DEFAULT_RESERVATION_TTL_MINUTES: i64 = 15;

/// Identifier of a stock reservation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(pub AggregateId);

impl ReservationId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for ReservationId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HoldState {
    Reserved,
    Committed,
    Released,
}

/// Ephemeral hold on stock, tied to one order line.
///
/// Exists only between payment confirmation and finalize/release; not a
/// long-lived persisted entity.
#[derive(Debug, Clone)]
pub struct StockReservation {
    pub id: ReservationId,
    pub product_id: ProductId,
    pub order_id: AggregateId,
    pub quantity: u32,
    pub expires_at: DateTime<Utc>,
    state: HoldState,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: ProductId,
        requested: u32,
        available: i64,
    },

    #[error("unknown product: {0}")]
    UnknownProduct(ProductId),

    #[error("unknown reservation: {0}")]
    UnknownReservation(ReservationId),

    #[error("reservation {0} was already released; cannot commit it")]
    AlreadyReleased(ReservationId),

    #[error("reservation {0} was already committed; cannot release it")]
    AlreadyCommitted(ReservationId),

    #[error("quantity must be at least 1")]
    InvalidQuantity,
}

impl LedgerError {
    pub fn is_insufficient_stock(&self) -> bool {
        matches!(self, Self::InsufficientStock { .. })
    }
}

/// Per-product stock counts with atomic reserve/commit/release.
///
/// Each product's available count lives behind its own mutex, so reservations
/// against different products never contend. The check-and-decrement in
/// `reserve` happens under the product lock, which is what keeps two
/// concurrent reservations from both taking the last unit.
#[derive(Debug)]
pub struct InventoryLedger {
    stocks: RwLock<HashMap<ProductId, Arc<Mutex<i64>>>>,
    reservations: Mutex<HashMap<ReservationId, StockReservation>>,
    reservation_ttl: Duration,
}

impl InventoryLedger {
    pub fn new(reservation_ttl: Duration) -> Self {
        Self {
            stocks: RwLock::new(HashMap::new()),
            reservations: Mutex::new(HashMap::new()),
            reservation_ttl,
        }
    }

    pub fn with_default_ttl() -> Self {
        Self::new(Duration::minutes(DEFAULT_RESERVATION_TTL_MINUTES))
    }

    /// Set the available count for a product (initial seeding or restock).
    pub fn seed(&self, product_id: ProductId, quantity: u32) {
        let mut stocks = self.stocks.write().unwrap_or_else(|e| e.into_inner());
        let cell = stocks.entry(product_id).or_default();
        *cell.lock().unwrap_or_else(|e| e.into_inner()) = i64::from(quantity);
    }

    pub fn available(&self, product_id: ProductId) -> Option<i64> {
        let stocks = self.stocks.read().unwrap_or_else(|e| e.into_inner());
        stocks
            .get(&product_id)
            .map(|cell| *cell.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn stock_cell(&self, product_id: ProductId) -> Result<Arc<Mutex<i64>>, LedgerError> {
        let stocks = self.stocks.read().unwrap_or_else(|e| e.into_inner());
        stocks
            .get(&product_id)
            .cloned()
            .ok_or(LedgerError::UnknownProduct(product_id))
    }

    /// Atomically take `quantity` units of `product_id` for `order_id`.
    ///
    /// The stock read and the decrement happen under the product's lock, so
    /// concurrent reservations never both succeed beyond available stock.
    pub fn reserve(
        &self,
        product_id: ProductId,
        order_id: AggregateId,
        quantity: u32,
        now: DateTime<Utc>,
    ) -> Result<ReservationId, LedgerError> {
        if quantity == 0 {
            return Err(LedgerError::InvalidQuantity);
        }

        let cell = self.stock_cell(product_id)?;
        {
            let mut available = cell.lock().unwrap_or_else(|e| e.into_inner());
            if *available < i64::from(quantity) {
                return Err(LedgerError::InsufficientStock {
                    product_id,
                    requested: quantity,
                    available: *available,
                });
            }
            *available -= i64::from(quantity);
        }

        let id = ReservationId::new(AggregateId::new());
        let reservation = StockReservation {
            id,
            product_id,
            order_id,
            quantity,
            expires_at: now + self.reservation_ttl,
            state: HoldState::Reserved,
        };
        self.reservations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, reservation);

        debug!(%product_id, %order_id, quantity, "stock reserved");
        Ok(id)
    }

    /// Reserve every line of an order, all-or-nothing.
    ///
    /// Lines are processed in sorted product-id order so that two orders
    /// reserving overlapping product sets always take products in the same
    /// global order. On any `InsufficientStock` the holds already taken for
    /// this order are released before the error is returned.
    pub fn reserve_all(
        &self,
        order_id: AggregateId,
        lines: &[(ProductId, u32)],
        now: DateTime<Utc>,
    ) -> Result<Vec<ReservationId>, LedgerError> {
        let mut sorted: Vec<(ProductId, u32)> = lines.to_vec();
        sorted.sort_by_key(|(product_id, _)| *product_id);

        let mut taken = Vec::with_capacity(sorted.len());
        for (product_id, quantity) in sorted {
            match self.reserve(product_id, order_id, quantity, now) {
                Ok(id) => taken.push(id),
                Err(err) => {
                    for id in taken {
                        // Fresh holds by this call; release cannot fail on them.
                        let _ = self.release(id);
                    }
                    return Err(err);
                }
            }
        }
        Ok(taken)
    }

    /// Convert a reservation into a permanent decrement.
    ///
    /// Idempotent: the reservation is consumed on first commit; a second
    /// commit is a no-op that returns the prior result.
    pub fn commit(&self, reservation_id: ReservationId) -> Result<(), LedgerError> {
        let mut reservations = self.reservations.lock().unwrap_or_else(|e| e.into_inner());
        let reservation = reservations
            .get_mut(&reservation_id)
            .ok_or(LedgerError::UnknownReservation(reservation_id))?;

        match reservation.state {
            HoldState::Reserved => {
                reservation.state = HoldState::Committed;
                Ok(())
            }
            HoldState::Committed => Ok(()),
            HoldState::Released => Err(LedgerError::AlreadyReleased(reservation_id)),
        }
    }

    /// Return a reservation's quantity to available stock. Idempotent.
    pub fn release(&self, reservation_id: ReservationId) -> Result<(), LedgerError> {
        let (product_id, quantity) = {
            let mut reservations = self.reservations.lock().unwrap_or_else(|e| e.into_inner());
            let reservation = reservations
                .get_mut(&reservation_id)
                .ok_or(LedgerError::UnknownReservation(reservation_id))?;

            match reservation.state {
                HoldState::Reserved => {
                    reservation.state = HoldState::Released;
                    (reservation.product_id, reservation.quantity)
                }
                HoldState::Released => return Ok(()),
                HoldState::Committed => {
                    return Err(LedgerError::AlreadyCommitted(reservation_id));
                }
            }
        };

        let cell = self.stock_cell(product_id)?;
        *cell.lock().unwrap_or_else(|e| e.into_inner()) += i64::from(quantity);

        debug!(%product_id, quantity, "reservation released");
        Ok(())
    }

    /// Commit every outstanding hold of one order. Idempotent per hold.
    pub fn commit_for_order(&self, order_id: AggregateId) -> Result<usize, LedgerError> {
        let ids = self.reservation_ids_for(order_id, HoldState::Reserved);
        for id in &ids {
            self.commit(*id)?;
        }
        Ok(ids.len())
    }

    /// Release every outstanding hold of one order. Returns how many were released.
    pub fn release_for_order(&self, order_id: AggregateId) -> usize {
        let ids = self.reservation_ids_for(order_id, HoldState::Reserved);
        let mut released = 0;
        for id in &ids {
            if self.release(*id).is_ok() {
                released += 1;
            }
        }
        released
    }

    /// Holds still outstanding (reserved, not yet committed or released).
    pub fn outstanding_for_order(&self, order_id: AggregateId) -> usize {
        self.reservation_ids_for(order_id, HoldState::Reserved).len()
    }

    /// Holds already converted into permanent decrements.
    pub fn committed_for_order(&self, order_id: AggregateId) -> usize {
        self.reservation_ids_for(order_id, HoldState::Committed).len()
    }

    fn reservation_ids_for(&self, order_id: AggregateId, state: HoldState) -> Vec<ReservationId> {
        let reservations = self.reservations.lock().unwrap_or_else(|e| e.into_inner());
        reservations
            .values()
            .filter(|r| r.order_id == order_id && r.state == state)
            .map(|r| r.id)
            .collect()
    }

    /// Sweep: release all holds past their expiry, and drop terminal records
    /// that are at least one TTL past expiry (so the map does not grow
    /// without bound). Returns the reservations that were released.
    pub fn release_expired(&self, now: DateTime<Utc>) -> Vec<StockReservation> {
        let expired: Vec<StockReservation> = {
            let reservations = self.reservations.lock().unwrap_or_else(|e| e.into_inner());
            reservations
                .values()
                .filter(|r| r.state == HoldState::Reserved && r.expires_at <= now)
                .cloned()
                .collect()
        };

        for reservation in &expired {
            let _ = self.release(reservation.id);
            debug!(
                reservation_id = %reservation.id,
                order_id = %reservation.order_id,
                "expired reservation released"
            );
        }

        let prune_before = now - self.reservation_ttl;
        let mut reservations = self.reservations.lock().unwrap_or_else(|e| e.into_inner());
        reservations
            .retain(|_, r| r.state == HoldState::Reserved || r.expires_at > prune_before);

        expired
    }
}


#[cfg(test)]
mod properties {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Step {
        Reserve(u32),
        ReleaseNth(usize),
        CommitNth(usize),
    }

    fn step_strategy() -> impl Strategy<Value = Step> {
        prop_oneof![
            (1u32..5).prop_map(Step::Reserve),
            (0usize..16).prop_map(Step::ReleaseNth),
            (0usize..16).prop_map(Step::CommitNth),
        ]
    }

    proptest! {
        /// available + reserved + committed always equals the seeded count,
        /// and available never goes negative, whatever the interleaving.
        #[test]
        fn stock_is_conserved(initial in 1u32..50, steps in prop::collection::vec(step_strategy(), 1..40)) {
            let ledger = InventoryLedger::with_default_ttl();
            let product = ProductId::new(AggregateId::new());
            let order = AggregateId::new();
            ledger.seed(product, initial);

            let mut holds: Vec<(ReservationId, u32)> = Vec::new();
            let mut reserved: i64 = 0;
            let mut committed: i64 = 0;

            for step in steps {
                match step {
                    Step::Reserve(qty) => {
                        if let Ok(id) = ledger.reserve(product, order, qty, Utc::now()) {
                            holds.push((id, qty));
                            reserved += i64::from(qty);
                        }
                    }
                    Step::ReleaseNth(n) => {
                        if !holds.is_empty() {
                            let (id, qty) = holds[n % holds.len()];
                            if ledger.release(id).is_ok() {
                                holds.retain(|(h, _)| *h != id);
                                reserved -= i64::from(qty);
                            }
                        }
                    }
                    Step::CommitNth(n) => {
                        if !holds.is_empty() {
                            let (id, qty) = holds[n % holds.len()];
                            if ledger.commit(id).is_ok() {
                                holds.retain(|(h, _)| *h != id);
                                reserved -= i64::from(qty);
                                committed += i64::from(qty);
                            }
                        }
                    }
                }

                let available = ledger.available(product).unwrap();
                prop_assert!(available >= 0);
                prop_assert_eq!(available + reserved + committed, i64::from(initial));
            }
        }

        /// Releasing and re-reserving the same quantity lands back on the
        /// same available count.
        #[test]
        fn release_then_rereserve_is_idempotent(initial in 1u32..50, qty in 1u32..10) {
            prop_assume!(qty <= initial);

            let ledger = InventoryLedger::with_default_ttl();
            let product = ProductId::new(AggregateId::new());
            let order = AggregateId::new();
            ledger.seed(product, initial);

            let before = ledger.available(product).unwrap();
            let id = ledger.reserve(product, order, qty, Utc::now()).unwrap();
            ledger.release(id).unwrap();
            prop_assert_eq!(ledger.available(product).unwrap(), before);

            let id2 = ledger.reserve(product, order, qty, Utc::now()).unwrap();
            prop_assert_eq!(ledger.available(product).unwrap(), before - i64::from(qty));
            ledger.release(id2).unwrap();
            prop_assert_eq!(ledger.available(product).unwrap(), before);
        }
    }
}
