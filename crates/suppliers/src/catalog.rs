use serde::{Deserialize, Serialize};

use procura_core::{Money, domain_id};

use crate::supplier::SupplierId;

domain_id!(
    /// Catalog item identifier.
    CatalogItemId
);

/// Result of resolving a catalog reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub item_id: CatalogItemId,
    /// Supplier whose catalog the item belongs to.
    pub supplier_id: SupplierId,
    pub designation: String,
    pub unit_price: Money,
    pub available: bool,
}
