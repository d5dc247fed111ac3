use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use medipaw_core::{AggregateId, DomainError, DomainResult};

/// Product identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(pub AggregateId);

impl ProductId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for ProductId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// The two storefront departments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductKind {
    Medicine,
    Pet,
}

/// Catalog entry.
///
/// `price` is in the smallest currency unit (e.g. cents). `stock` is the
/// initial on-hand quantity used to seed the inventory ledger; the ledger is
/// authoritative once the process is running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    pub price: u64,
    pub stock: u32,
    pub requires_prescription: bool,
    pub kind: ProductKind,
}

impl Product {
    pub fn new(
        id: ProductId,
        name: impl Into<String>,
        price: u64,
        stock: u32,
        requires_prescription: bool,
        kind: ProductKind,
    ) -> DomainResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }
        if price == 0 {
            return Err(DomainError::validation("price must be positive"));
        }
        Ok(Self {
            id,
            name,
            price,
            stock,
            requires_prescription,
            kind,
        })
    }
}

/// In-memory product registry.
///
/// Constructed at the process entry point and passed by handle to the
/// components that need price/flag snapshots.
#[derive(Debug, Default)]
pub struct Catalog {
    products: RwLock<HashMap<ProductId, Product>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, product: Product) -> DomainResult<()> {
        let mut products = self
            .products
            .write()
            .map_err(|_| DomainError::transient("catalog lock poisoned"))?;
        products.insert(product.id, product);
        Ok(())
    }

    pub fn get(&self, id: ProductId) -> Option<Product> {
        self.products
            .read()
            .ok()
            .and_then(|products| products.get(&id).cloned())
    }

    pub fn all(&self) -> Vec<Product> {
        self.products
            .read()
            .map(|products| products.values().cloned().collect())
            .unwrap_or_default()
    }
}
