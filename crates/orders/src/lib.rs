//! Order domain module.
//!
//! This crate contains the order lifecycle state machine, implemented purely
//! as deterministic domain logic (no IO, no HTTP, no storage). The
//! fulfillment service in `medipaw-infra` is the only writer of order state.

pub mod order;

pub use order::{
    ApplyGating, BeginPayment, CancelActor, CancelOrder, CompleteFulfillment, ConfirmPayment,
    CreateOrder, FailPayment, FulfillmentStatus, MarkOutOfStock, Order, OrderCommand, OrderEvent,
    OrderId, OrderLine, PaymentStatus,
};
