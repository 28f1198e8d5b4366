//! Purchasing domain module (event-sourced).
//!
//! Grouped orders pool allocations per supplier until the free-shipping
//! threshold is met; a validated grouped order becomes one supplier order whose
//! items consolidate every contributing allocation. Pure deterministic domain
//! logic (no IO, no storage).

pub mod allocation;
pub mod grouped_order;
pub mod supplier_order;

pub use allocation::{Allocation, AllocationId, AllocationStatus, ItemKey};
pub use grouped_order::{
    AcknowledgeThresholdAlert, AddAllocation, AllocationAdded, AllocationCancelled,
    AllocationDelivered, AllocationLink, AllocationQuantityChanged, CancelAllocation,
    CancelGroupedOrder, ChangeAllocationQuantity, DistributeDelivery, GroupedOrder,
    GroupedOrderCancelled, GroupedOrderCommand, GroupedOrderEvent, GroupedOrderId,
    GroupedOrderOpened, GroupedOrderOrdered, GroupedOrderStatus, GroupedOrderValidated,
    MarkOrdered, OpenGroupedOrder, ReceiptAccounted, ReleasedAllocation, ReserveSupplierOrder,
    SupplierOrderReserved, ThresholdAlertAcknowledged, ThresholdReached, Validate, Validation,
};
pub use supplier_order::{
    ConsolidatedItem, ItemReceived, PlaceSupplierOrder, ReceiveItem, SupplierOrder,
    SupplierOrderCommand, SupplierOrderEvent, SupplierOrderId, SupplierOrderItem,
    SupplierOrderPlaced, SupplierOrderStatus, consolidate,
};
