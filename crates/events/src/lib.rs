//! Domain events and the per-order status broadcast seam.

pub mod broadcast;
pub mod event;

pub use broadcast::{OrderTopics, StatusSink, StatusUpdate};
pub use event::{execute, Event};
