use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use procura_core::{Entity, Money, domain_id};
use procura_requests::{LineReference, MaterialRequestId};
use procura_suppliers::CatalogItemId;

domain_id!(
    /// Allocation identifier (unique across grouped orders).
    AllocationId
);

/// Allocation lifecycle. Allocations are never deleted, only cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    Allocated,
    PartiallyDelivered,
    Delivered,
    Cancelled,
}

/// What a supplier-order item consolidates on.
///
/// Free-text items are keyed on their normalised label so that two requests
/// asking for the same hand-described article end up on one line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ItemKey {
    Catalog(CatalogItemId),
    FreeText(String),
}

impl ItemKey {
    pub fn for_reference(reference: &LineReference) -> Self {
        match reference {
            LineReference::Catalog { item_id } => ItemKey::Catalog(*item_id),
            LineReference::FreeText(item) => {
                let normalized = item
                    .label()
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .join(" ")
                    .to_lowercase();
                ItemKey::FreeText(normalized)
            }
        }
    }
}

/// Reservation of a request line's quantity in a grouped order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: AllocationId,
    pub request_id: MaterialRequestId,
    pub line_no: u32,
    pub item_key: ItemKey,
    pub designation: String,
    pub allocated_quantity: u32,
    pub delivered_quantity: u32,
    /// Unit price used for the grouped-order amount.
    pub estimated_price: Money,
    /// Unit price recorded on receipt, when the supplier invoiced differently.
    pub actual_price: Option<Money>,
    pub status: AllocationStatus,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    /// Supplier-order line this allocation feeds, once finalized.
    pub supplier_order_line: Option<u32>,
    /// Insertion order within the grouped order; FIFO tie-breaker.
    pub sequence: u32,
}

impl Allocation {
    pub fn is_active(&self) -> bool {
        self.status != AllocationStatus::Cancelled
    }

    /// `estimated_price × allocated_quantity`.
    pub fn amount(&self) -> Money {
        self.estimated_price.times(self.allocated_quantity)
    }

    pub fn remaining_to_deliver(&self) -> u32 {
        self.allocated_quantity - self.delivered_quantity
    }

    /// FIFO key: creation time, then insertion order.
    pub fn fifo_key(&self) -> (DateTime<Utc>, u32) {
        (self.created_at, self.sequence)
    }
}

impl Entity for Allocation {
    type Id = AllocationId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
