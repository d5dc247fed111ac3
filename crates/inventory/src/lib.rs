//! Inventory ledger: atomic stock reservations.
//!
//! This crate contains the one piece of state that must never oversell: the
//! per-product available count. Reservations are ephemeral holds, convertible
//! to permanent decrements (`commit`) or returnable to available stock
//! (`release`).

pub mod ledger;

pub use ledger::{
    InventoryLedger, LedgerError, ReservationId, StockReservation, DEFAULT_RESERVATION_TTL_MINUTES,
};
