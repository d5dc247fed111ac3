//! Product catalog: the read-mostly snapshot source for order creation.
//!
//! Order lines copy `price` and `requires_prescription` out of the catalog at
//! order time; later product edits never retroactively alter placed orders.

pub mod product;

pub use product::{Catalog, Product, ProductId, ProductKind};
