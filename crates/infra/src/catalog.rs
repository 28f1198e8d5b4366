//! Read-only lookups the engine consumes: catalog resolution and supplier records.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;

use procura_core::Money;
use procura_suppliers::{CatalogEntry, CatalogItemId, Supplier, SupplierId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("catalog item {0} not found")]
    NotFound(CatalogItemId),

    /// Lookup failed but may succeed when retried.
    #[error("catalog lookup failed transiently: {0}")]
    Transient(String),
}

impl CatalogError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CatalogError::Transient(_))
    }
}

/// Resolves a catalog reference to its supplier, unit price and availability.
///
/// Treated as a fast synchronous lookup; the engine retries
/// [`CatalogError::Transient`] a bounded number of times.
pub trait CatalogResolver: Send + Sync {
    fn resolve(&self, item_id: CatalogItemId) -> Result<CatalogEntry, CatalogError>;
}

impl<C> CatalogResolver for Arc<C>
where
    C: CatalogResolver + ?Sized,
{
    fn resolve(&self, item_id: CatalogItemId) -> Result<CatalogEntry, CatalogError> {
        (**self).resolve(item_id)
    }
}

/// Supplier records (threshold, auto-validation flag).
pub trait SupplierDirectory: Send + Sync {
    fn supplier(&self, supplier_id: SupplierId) -> Option<Supplier>;
}

impl<D> SupplierDirectory for Arc<D>
where
    D: SupplierDirectory + ?Sized,
{
    fn supplier(&self, supplier_id: SupplierId) -> Option<Supplier> {
        (**self).supplier(supplier_id)
    }
}

/// In-memory catalog for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    entries: RwLock<HashMap<CatalogItemId, CatalogEntry>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: CatalogEntry) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.item_id, entry);
    }

    /// Add an available item and return its id.
    pub fn add_item(
        &self,
        supplier_id: SupplierId,
        designation: impl Into<String>,
        unit_price: Money,
    ) -> CatalogItemId {
        let item_id = CatalogItemId::generate();
        self.insert(CatalogEntry {
            item_id,
            supplier_id,
            designation: designation.into(),
            unit_price,
            available: true,
        });
        item_id
    }

    pub fn set_available(&self, item_id: CatalogItemId, available: bool) {
        if let Some(entry) = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&item_id)
        {
            entry.available = available;
        }
    }
}

impl CatalogResolver for InMemoryCatalog {
    fn resolve(&self, item_id: CatalogItemId) -> Result<CatalogEntry, CatalogError> {
        self.entries
            .read()
            .map_err(|_| CatalogError::Transient("catalog lock poisoned".to_string()))?
            .get(&item_id)
            .cloned()
            .ok_or(CatalogError::NotFound(item_id))
    }
}

/// In-memory supplier directory for tests/dev.
#[derive(Debug, Default)]
pub struct InMemorySupplierDirectory {
    suppliers: RwLock<HashMap<SupplierId, Supplier>>,
}

impl InMemorySupplierDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, supplier: Supplier) {
        self.suppliers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(supplier.id, supplier);
    }
}

impl SupplierDirectory for InMemorySupplierDirectory {
    fn supplier(&self, supplier_id: SupplierId) -> Option<Supplier> {
        self.suppliers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&supplier_id)
            .cloned()
    }
}
