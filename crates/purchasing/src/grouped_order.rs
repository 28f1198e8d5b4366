use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use procura_core::{Aggregate, AggregateRoot, DomainError, Money, domain_id};
use procura_events::Event;
use procura_requests::MaterialRequestId;
use procura_suppliers::SupplierId;

use crate::allocation::{Allocation, AllocationId, AllocationStatus, ItemKey};
use crate::supplier_order::SupplierOrderId;

domain_id!(
    /// Grouped order identifier.
    GroupedOrderId
);

/// Grouped order lifecycle.
///
/// `Open -> ThresholdReached -> Validated -> Ordered`, plus `Open -> Validated`
/// (manual override) and `{Open, ThresholdReached} -> Cancelled`. Nothing
/// leaves `Ordered` or `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupedOrderStatus {
    Open,
    ThresholdReached,
    Validated,
    Ordered,
    Cancelled,
}

impl GroupedOrderStatus {
    /// Open for new allocations (and for removing existing ones).
    pub fn accepts_allocations(self) -> bool {
        matches!(
            self,
            GroupedOrderStatus::Open | GroupedOrderStatus::ThresholdReached
        )
    }
}

/// Who validated the grouped order, and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validation {
    pub validated_by: String,
    pub validated_at: DateTime<Utc>,
    pub notes: Option<String>,
    pub automatic: bool,
    /// Validated while the amount was under the supplier threshold.
    pub below_threshold: bool,
}

/// Aggregate root: GroupedOrder.
///
/// Owns its allocations and the running amount. While the order accepts
/// allocations, `current_amount` equals the sum of `amount()` over active
/// allocations; from validation on both are frozen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupedOrder {
    id: GroupedOrderId,
    supplier_id: Option<SupplierId>,
    order_number: String,
    status: GroupedOrderStatus,
    current_amount: Money,
    auto_validate_on_threshold: bool,
    threshold_reached_at: Option<DateTime<Utc>>,
    threshold_alert_sent: bool,
    validation: Option<Validation>,
    allocations: Vec<Allocation>,
    supplier_order_id: Option<SupplierOrderId>,
    /// Cumulative received quantity already spread, per supplier-order line.
    received_accounted: BTreeMap<u32, u32>,
    cancellation_reason: Option<String>,
    created_at: Option<DateTime<Utc>>,
    ordered_at: Option<DateTime<Utc>>,
    next_sequence: u32,
    version: u64,
    created: bool,
}

impl GroupedOrder {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: GroupedOrderId) -> Self {
        Self {
            id,
            supplier_id: None,
            order_number: String::new(),
            status: GroupedOrderStatus::Open,
            current_amount: Money::ZERO,
            auto_validate_on_threshold: false,
            threshold_reached_at: None,
            threshold_alert_sent: false,
            validation: None,
            allocations: Vec::new(),
            supplier_order_id: None,
            received_accounted: BTreeMap::new(),
            cancellation_reason: None,
            created_at: None,
            ordered_at: None,
            next_sequence: 1,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> GroupedOrderId {
        self.id
    }

    pub fn exists(&self) -> bool {
        self.created
    }

    pub fn supplier_id(&self) -> Option<SupplierId> {
        self.supplier_id
    }

    pub fn order_number(&self) -> &str {
        &self.order_number
    }

    pub fn status(&self) -> GroupedOrderStatus {
        self.status
    }

    pub fn current_amount(&self) -> Money {
        self.current_amount
    }

    pub fn auto_validate_on_threshold(&self) -> bool {
        self.auto_validate_on_threshold
    }

    pub fn threshold_reached_at(&self) -> Option<DateTime<Utc>> {
        self.threshold_reached_at
    }

    pub fn threshold_alert_sent(&self) -> bool {
        self.threshold_alert_sent
    }

    /// Threshold crossed but the notifier has not acknowledged the alert yet.
    pub fn threshold_alert_pending(&self) -> bool {
        self.threshold_reached_at.is_some() && !self.threshold_alert_sent
    }

    pub fn validation(&self) -> Option<&Validation> {
        self.validation.as_ref()
    }

    pub fn supplier_order_id(&self) -> Option<SupplierOrderId> {
        self.supplier_order_id
    }

    pub fn cancellation_reason(&self) -> Option<&str> {
        self.cancellation_reason.as_deref()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn ordered_at(&self) -> Option<DateTime<Utc>> {
        self.ordered_at
    }

    /// Every allocation ever made, cancelled ones included.
    pub fn allocations(&self) -> &[Allocation] {
        &self.allocations
    }

    pub fn allocation(&self, allocation_id: AllocationId) -> Option<&Allocation> {
        self.allocations.iter().find(|a| a.id == allocation_id)
    }

    pub fn active_allocations(&self) -> impl Iterator<Item = &Allocation> {
        self.allocations.iter().filter(|a| a.is_active())
    }

    pub fn active_allocation_for_line(
        &self,
        request_id: MaterialRequestId,
        line_no: u32,
    ) -> Option<&Allocation> {
        self.active_allocations()
            .find(|a| a.request_id == request_id && a.line_no == line_no)
    }

    /// Active allocations feeding one supplier-order line, oldest first.
    pub fn allocations_for_supplier_order_line(&self, line_no: u32) -> Vec<&Allocation> {
        let mut feeding: Vec<&Allocation> = self
            .active_allocations()
            .filter(|a| a.supplier_order_line == Some(line_no))
            .collect();
        feeding.sort_by_key(|a| a.fifo_key());
        feeding
    }

    /// Received units of a supplier-order line already spread over allocations
    /// (over-delivered units included).
    pub fn received_accounted(&self, supplier_order_line: u32) -> u32 {
        self.received_accounted
            .get(&supplier_order_line)
            .copied()
            .unwrap_or(0)
    }

    /// Total active allocated quantity of one item.
    pub fn item_quantity(&self, item_key: &ItemKey) -> u64 {
        self.active_allocations()
            .filter(|a| &a.item_key == item_key)
            .map(|a| u64::from(a.allocated_quantity))
            .sum()
    }

    /// Sum of active allocation amounts, computed from scratch.
    pub fn recomputed_amount(&self) -> Money {
        self.active_allocations().map(Allocation::amount).sum()
    }

    /// Amount still missing to reach `threshold` (zero once reached).
    pub fn remaining_to_threshold(&self, threshold: Option<Money>) -> Option<Money> {
        threshold
            .filter(|t| t.is_positive())
            .map(|t| self.current_amount.remaining_to(t))
    }
}

impl AggregateRoot for GroupedOrder {
    type Id = GroupedOrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: OpenGroupedOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenGroupedOrder {
    pub grouped_order_id: GroupedOrderId,
    pub supplier_id: SupplierId,
    pub auto_validate_on_threshold: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AddAllocation.
///
/// `threshold` is the supplier's current free-shipping threshold;
/// `system_validator` is stamped on an automatic validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddAllocation {
    pub grouped_order_id: GroupedOrderId,
    pub allocation_id: AllocationId,
    pub request_id: MaterialRequestId,
    pub line_no: u32,
    pub item_key: ItemKey,
    pub designation: String,
    pub quantity: u32,
    pub estimated_price: Money,
    pub threshold: Option<Money>,
    pub system_validator: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ChangeAllocationQuantity.
///
/// Resizes an active allocation of an open order. The new amount goes through
/// the same threshold check as [`AddAllocation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeAllocationQuantity {
    pub grouped_order_id: GroupedOrderId,
    pub allocation_id: AllocationId,
    pub quantity: u32,
    pub threshold: Option<Money>,
    pub system_validator: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelAllocation (remove one allocation from an open order).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelAllocation {
    pub grouped_order_id: GroupedOrderId,
    pub allocation_id: AllocationId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Validate (manual).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validate {
    pub grouped_order_id: GroupedOrderId,
    pub validated_by: String,
    pub notes: Option<String>,
    pub threshold: Option<Money>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AcknowledgeThresholdAlert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcknowledgeThresholdAlert {
    pub grouped_order_id: GroupedOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReserveSupplierOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveSupplierOrder {
    pub grouped_order_id: GroupedOrderId,
    pub supplier_order_id: SupplierOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Back-link from an allocation to the supplier-order line it feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationLink {
    pub allocation_id: AllocationId,
    pub supplier_order_line: u32,
}

/// Command: MarkOrdered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkOrdered {
    pub grouped_order_id: GroupedOrderId,
    pub supplier_order_id: SupplierOrderId,
    pub links: Vec<AllocationLink>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelGroupedOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelGroupedOrder {
    pub grouped_order_id: GroupedOrderId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: DistributeDelivery.
///
/// `received_total` is the supplier-order line's cumulative received quantity.
/// Only the part not yet accounted for is spread over the allocations feeding
/// the line, oldest first, capping each at its allocated quantity. Sending the
/// same total twice is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributeDelivery {
    pub grouped_order_id: GroupedOrderId,
    pub supplier_order_line: u32,
    pub received_total: u32,
    pub actual_price: Option<Money>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupedOrderCommand {
    OpenGroupedOrder(OpenGroupedOrder),
    AddAllocation(AddAllocation),
    ChangeAllocationQuantity(ChangeAllocationQuantity),
    CancelAllocation(CancelAllocation),
    Validate(Validate),
    AcknowledgeThresholdAlert(AcknowledgeThresholdAlert),
    ReserveSupplierOrder(ReserveSupplierOrder),
    MarkOrdered(MarkOrdered),
    Cancel(CancelGroupedOrder),
    DistributeDelivery(DistributeDelivery),
}

/// Event: GroupedOrderOpened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupedOrderOpened {
    pub grouped_order_id: GroupedOrderId,
    pub supplier_id: SupplierId,
    pub order_number: String,
    pub auto_validate_on_threshold: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Event: AllocationAdded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationAdded {
    pub grouped_order_id: GroupedOrderId,
    pub allocation_id: AllocationId,
    pub request_id: MaterialRequestId,
    pub line_no: u32,
    pub item_key: ItemKey,
    pub designation: String,
    pub quantity: u32,
    pub estimated_price: Money,
    pub sequence: u32,
    pub amount_after: Money,
    pub occurred_at: DateTime<Utc>,
}

/// Event: AllocationQuantityChanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationQuantityChanged {
    pub grouped_order_id: GroupedOrderId,
    pub allocation_id: AllocationId,
    pub request_id: MaterialRequestId,
    pub line_no: u32,
    pub previous_quantity: u32,
    pub quantity: u32,
    pub amount_after: Money,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ThresholdReached (raised once per grouped order).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdReached {
    pub grouped_order_id: GroupedOrderId,
    pub amount: Money,
    pub threshold: Money,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ThresholdAlertAcknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdAlertAcknowledged {
    pub grouped_order_id: GroupedOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: AllocationCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationCancelled {
    pub grouped_order_id: GroupedOrderId,
    pub allocation_id: AllocationId,
    pub request_id: MaterialRequestId,
    pub line_no: u32,
    pub quantity: u32,
    pub amount_after: Money,
    pub occurred_at: DateTime<Utc>,
}

/// Event: GroupedOrderValidated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupedOrderValidated {
    pub grouped_order_id: GroupedOrderId,
    pub validated_by: String,
    pub notes: Option<String>,
    pub automatic: bool,
    pub below_threshold: bool,
    pub amount: Money,
    pub occurred_at: DateTime<Utc>,
}

/// Event: SupplierOrderReserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplierOrderReserved {
    pub grouped_order_id: GroupedOrderId,
    pub supplier_order_id: SupplierOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: GroupedOrderOrdered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupedOrderOrdered {
    pub grouped_order_id: GroupedOrderId,
    pub supplier_order_id: SupplierOrderId,
    pub links: Vec<AllocationLink>,
    pub occurred_at: DateTime<Utc>,
}

/// Allocation released by a grouped-order cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasedAllocation {
    pub allocation_id: AllocationId,
    pub request_id: MaterialRequestId,
    pub line_no: u32,
    pub quantity: u32,
}

/// Event: GroupedOrderCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupedOrderCancelled {
    pub grouped_order_id: GroupedOrderId,
    pub reason: Option<String>,
    pub released: Vec<ReleasedAllocation>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: AllocationDelivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationDelivered {
    pub grouped_order_id: GroupedOrderId,
    pub allocation_id: AllocationId,
    pub request_id: MaterialRequestId,
    pub line_no: u32,
    pub quantity: u32,
    pub actual_price: Option<Money>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ReceiptAccounted (closes one distribution batch).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptAccounted {
    pub grouped_order_id: GroupedOrderId,
    pub supplier_order_line: u32,
    pub received_total: u32,
    pub distributed: u32,
    /// Received beyond what the allocations could absorb.
    pub excess: u32,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupedOrderEvent {
    GroupedOrderOpened(GroupedOrderOpened),
    AllocationAdded(AllocationAdded),
    AllocationQuantityChanged(AllocationQuantityChanged),
    ThresholdReached(ThresholdReached),
    ThresholdAlertAcknowledged(ThresholdAlertAcknowledged),
    AllocationCancelled(AllocationCancelled),
    GroupedOrderValidated(GroupedOrderValidated),
    SupplierOrderReserved(SupplierOrderReserved),
    GroupedOrderOrdered(GroupedOrderOrdered),
    GroupedOrderCancelled(GroupedOrderCancelled),
    AllocationDelivered(AllocationDelivered),
    ReceiptAccounted(ReceiptAccounted),
}

impl Event for GroupedOrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            GroupedOrderEvent::GroupedOrderOpened(_) => "purchasing.grouped_order.opened",
            GroupedOrderEvent::AllocationAdded(_) => "purchasing.grouped_order.allocation_added",
            GroupedOrderEvent::AllocationQuantityChanged(_) => {
                "purchasing.grouped_order.allocation_quantity_changed"
            }
            GroupedOrderEvent::ThresholdReached(_) => "purchasing.grouped_order.threshold_reached",
            GroupedOrderEvent::ThresholdAlertAcknowledged(_) => {
                "purchasing.grouped_order.threshold_alert_acknowledged"
            }
            GroupedOrderEvent::AllocationCancelled(_) => {
                "purchasing.grouped_order.allocation_cancelled"
            }
            GroupedOrderEvent::GroupedOrderValidated(_) => "purchasing.grouped_order.validated",
            GroupedOrderEvent::SupplierOrderReserved(_) => {
                "purchasing.grouped_order.supplier_order_reserved"
            }
            GroupedOrderEvent::GroupedOrderOrdered(_) => "purchasing.grouped_order.ordered",
            GroupedOrderEvent::GroupedOrderCancelled(_) => "purchasing.grouped_order.cancelled",
            GroupedOrderEvent::AllocationDelivered(_) => {
                "purchasing.grouped_order.allocation_delivered"
            }
            GroupedOrderEvent::ReceiptAccounted(_) => "purchasing.grouped_order.receipt_accounted",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            GroupedOrderEvent::GroupedOrderOpened(e) => e.occurred_at,
            GroupedOrderEvent::AllocationAdded(e) => e.occurred_at,
            GroupedOrderEvent::AllocationQuantityChanged(e) => e.occurred_at,
            GroupedOrderEvent::ThresholdReached(e) => e.occurred_at,
            GroupedOrderEvent::ThresholdAlertAcknowledged(e) => e.occurred_at,
            GroupedOrderEvent::AllocationCancelled(e) => e.occurred_at,
            GroupedOrderEvent::GroupedOrderValidated(e) => e.occurred_at,
            GroupedOrderEvent::SupplierOrderReserved(e) => e.occurred_at,
            GroupedOrderEvent::GroupedOrderOrdered(e) => e.occurred_at,
            GroupedOrderEvent::GroupedOrderCancelled(e) => e.occurred_at,
            GroupedOrderEvent::AllocationDelivered(e) => e.occurred_at,
            GroupedOrderEvent::ReceiptAccounted(e) => e.occurred_at,
        }
    }
}

impl Aggregate for GroupedOrder {
    type Command = GroupedOrderCommand;
    type Event = GroupedOrderEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            GroupedOrderEvent::GroupedOrderOpened(e) => {
                self.id = e.grouped_order_id;
                self.supplier_id = Some(e.supplier_id);
                self.order_number = e.order_number.clone();
                self.status = GroupedOrderStatus::Open;
                self.current_amount = Money::ZERO;
                self.auto_validate_on_threshold = e.auto_validate_on_threshold;
                self.allocations.clear();
                self.created_at = Some(e.occurred_at);
                self.created = true;
            }
            GroupedOrderEvent::AllocationAdded(e) => {
                let allocation = Allocation {
                    id: e.allocation_id,
                    request_id: e.request_id,
                    line_no: e.line_no,
                    item_key: e.item_key.clone(),
                    designation: e.designation.clone(),
                    allocated_quantity: e.quantity,
                    delivered_quantity: 0,
                    estimated_price: e.estimated_price,
                    actual_price: None,
                    status: AllocationStatus::Allocated,
                    created_at: e.occurred_at,
                    delivered_at: None,
                    supplier_order_line: None,
                    sequence: e.sequence,
                };
                self.current_amount += allocation.amount();
                self.next_sequence = self.next_sequence.max(e.sequence + 1);
                self.allocations.push(allocation);
            }
            GroupedOrderEvent::AllocationQuantityChanged(e) => {
                if let Some(allocation) = self.allocation_mut(e.allocation_id) {
                    allocation.allocated_quantity = e.quantity;
                }
                self.current_amount = self.recomputed_amount();
            }
            GroupedOrderEvent::ThresholdReached(e) => {
                self.status = GroupedOrderStatus::ThresholdReached;
                self.threshold_reached_at = Some(e.occurred_at);
            }
            GroupedOrderEvent::ThresholdAlertAcknowledged(_) => {
                self.threshold_alert_sent = true;
            }
            GroupedOrderEvent::AllocationCancelled(e) => {
                if let Some(allocation) = self.allocation_mut(e.allocation_id) {
                    allocation.status = AllocationStatus::Cancelled;
                    let amount = allocation.amount();
                    self.current_amount -= amount;
                }
            }
            GroupedOrderEvent::GroupedOrderValidated(e) => {
                self.status = GroupedOrderStatus::Validated;
                self.validation = Some(Validation {
                    validated_by: e.validated_by.clone(),
                    validated_at: e.occurred_at,
                    notes: e.notes.clone(),
                    automatic: e.automatic,
                    below_threshold: e.below_threshold,
                });
            }
            GroupedOrderEvent::SupplierOrderReserved(e) => {
                self.supplier_order_id = Some(e.supplier_order_id);
            }
            GroupedOrderEvent::GroupedOrderOrdered(e) => {
                for link in &e.links {
                    if let Some(allocation) = self.allocation_mut(link.allocation_id) {
                        allocation.supplier_order_line = Some(link.supplier_order_line);
                    }
                }
                self.supplier_order_id = Some(e.supplier_order_id);
                self.status = GroupedOrderStatus::Ordered;
                self.ordered_at = Some(e.occurred_at);
            }
            GroupedOrderEvent::GroupedOrderCancelled(e) => {
                for released in &e.released {
                    if let Some(allocation) = self.allocation_mut(released.allocation_id) {
                        allocation.status = AllocationStatus::Cancelled;
                    }
                }
                self.current_amount = self.recomputed_amount();
                self.status = GroupedOrderStatus::Cancelled;
                self.cancellation_reason = e.reason.clone();
            }
            GroupedOrderEvent::AllocationDelivered(e) => {
                if let Some(allocation) = self.allocation_mut(e.allocation_id) {
                    allocation.delivered_quantity =
                        allocation.delivered_quantity.saturating_add(e.quantity);
                    if e.actual_price.is_some() {
                        allocation.actual_price = e.actual_price;
                    }
                    if allocation.delivered_quantity >= allocation.allocated_quantity {
                        allocation.status = AllocationStatus::Delivered;
                        allocation.delivered_at = Some(e.occurred_at);
                    } else {
                        allocation.status = AllocationStatus::PartiallyDelivered;
                    }
                }
            }
            GroupedOrderEvent::ReceiptAccounted(e) => {
                self.received_accounted
                    .insert(e.supplier_order_line, e.received_total);
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            GroupedOrderCommand::OpenGroupedOrder(cmd) => self.handle_open(cmd),
            GroupedOrderCommand::AddAllocation(cmd) => self.handle_add_allocation(cmd),
            GroupedOrderCommand::ChangeAllocationQuantity(cmd) => self.handle_change_quantity(cmd),
            GroupedOrderCommand::CancelAllocation(cmd) => self.handle_cancel_allocation(cmd),
            GroupedOrderCommand::Validate(cmd) => self.handle_validate(cmd),
            GroupedOrderCommand::AcknowledgeThresholdAlert(cmd) => self.handle_acknowledge(cmd),
            GroupedOrderCommand::ReserveSupplierOrder(cmd) => self.handle_reserve(cmd),
            GroupedOrderCommand::MarkOrdered(cmd) => self.handle_mark_ordered(cmd),
            GroupedOrderCommand::Cancel(cmd) => self.handle_cancel(cmd),
            GroupedOrderCommand::DistributeDelivery(cmd) => self.handle_distribute(cmd),
        }
    }
}

impl GroupedOrder {
    fn allocation_mut(&mut self, allocation_id: AllocationId) -> Option<&mut Allocation> {
        self.allocations.iter_mut().find(|a| a.id == allocation_id)
    }

    fn ensure_exists(&self, grouped_order_id: GroupedOrderId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.id != grouped_order_id {
            return Err(DomainError::invariant("grouped_order_id mismatch"));
        }
        Ok(())
    }

    fn ensure_accepting(&self, to: GroupedOrderStatus) -> Result<(), DomainError> {
        if !self.status.accepts_allocations() {
            return Err(DomainError::transition("grouped order", self.status, to));
        }
        Ok(())
    }

    fn handle_open(&self, cmd: &OpenGroupedOrder) -> Result<Vec<GroupedOrderEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("grouped order already exists"));
        }

        Ok(vec![GroupedOrderEvent::GroupedOrderOpened(
            GroupedOrderOpened {
                grouped_order_id: cmd.grouped_order_id,
                supplier_id: cmd.supplier_id,
                order_number: format!("GRP-{}", cmd.occurred_at.timestamp_millis()),
                auto_validate_on_threshold: cmd.auto_validate_on_threshold,
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_add_allocation(
        &self,
        cmd: &AddAllocation,
    ) -> Result<Vec<GroupedOrderEvent>, DomainError> {
        self.ensure_exists(cmd.grouped_order_id)?;
        if !self.status.accepts_allocations() {
            return Err(DomainError::invariant(
                "grouped order no longer accepts allocations",
            ));
        }

        if cmd.quantity == 0 {
            return Err(DomainError::validation("allocated quantity must be positive"));
        }
        if cmd.estimated_price.cents() < 0 {
            return Err(DomainError::validation("estimated price cannot be negative"));
        }
        if self.allocation(cmd.allocation_id).is_some() {
            return Err(DomainError::conflict("allocation id already used"));
        }
        if self
            .active_allocation_for_line(cmd.request_id, cmd.line_no)
            .is_some()
        {
            return Err(DomainError::conflict(
                "request line already has an active allocation in this grouped order",
            ));
        }

        self.ensure_item_fits(&cmd.item_key, 0, cmd.quantity)?;

        let amount_after = self.current_amount + cmd.estimated_price.times(cmd.quantity);
        let mut events = vec![GroupedOrderEvent::AllocationAdded(AllocationAdded {
            grouped_order_id: cmd.grouped_order_id,
            allocation_id: cmd.allocation_id,
            request_id: cmd.request_id,
            line_no: cmd.line_no,
            item_key: cmd.item_key.clone(),
            designation: cmd.designation.clone(),
            quantity: cmd.quantity,
            estimated_price: cmd.estimated_price,
            sequence: self.next_sequence,
            amount_after,
            occurred_at: cmd.occurred_at,
        })];
        events.extend(self.threshold_events(
            amount_after,
            cmd.threshold,
            &cmd.system_validator,
            cmd.occurred_at,
        ));

        Ok(events)
    }

    /// Events following a new amount: the crossing, then auto-validation.
    ///
    /// Crossing happens at most once: only an `Open` order can cross.
    fn threshold_events(
        &self,
        amount_after: Money,
        threshold: Option<Money>,
        system_validator: &str,
        occurred_at: DateTime<Utc>,
    ) -> Vec<GroupedOrderEvent> {
        let crossed = threshold.filter(|t| {
            t.is_positive() && amount_after >= *t && self.status == GroupedOrderStatus::Open
        });
        let Some(threshold) = crossed else {
            return vec![];
        };

        let mut events = vec![GroupedOrderEvent::ThresholdReached(ThresholdReached {
            grouped_order_id: self.id,
            amount: amount_after,
            threshold,
            occurred_at,
        })];
        if self.auto_validate_on_threshold {
            events.push(GroupedOrderEvent::GroupedOrderValidated(
                GroupedOrderValidated {
                    grouped_order_id: self.id,
                    validated_by: system_validator.to_string(),
                    notes: None,
                    automatic: true,
                    below_threshold: false,
                    amount: amount_after,
                    occurred_at,
                },
            ));
        }
        events
    }

    /// The item's consolidated quantity must stay within a supplier-order line.
    fn ensure_item_fits(
        &self,
        item_key: &ItemKey,
        replaced: u32,
        added: u32,
    ) -> Result<(), DomainError> {
        let total = self.item_quantity(item_key) - u64::from(replaced) + u64::from(added);
        if total > u64::from(u32::MAX) {
            return Err(DomainError::validation(format!(
                "grouped order would hold {total} units of one item, above {}",
                u32::MAX
            )));
        }
        Ok(())
    }

    fn handle_change_quantity(
        &self,
        cmd: &ChangeAllocationQuantity,
    ) -> Result<Vec<GroupedOrderEvent>, DomainError> {
        self.ensure_exists(cmd.grouped_order_id)?;

        let allocation = self
            .allocation(cmd.allocation_id)
            .filter(|a| a.is_active())
            .ok_or_else(DomainError::not_found)?;
        if !self.status.accepts_allocations() {
            return Err(DomainError::invariant(
                "allocations of a validated grouped order are frozen",
            ));
        }
        if cmd.quantity == 0 {
            return Err(DomainError::validation(
                "allocated quantity must be positive; remove the allocation instead",
            ));
        }
        if cmd.quantity == allocation.allocated_quantity {
            return Ok(vec![]);
        }
        self.ensure_item_fits(
            &allocation.item_key,
            allocation.allocated_quantity,
            cmd.quantity,
        )?;

        let amount_after = self.current_amount - allocation.amount()
            + allocation.estimated_price.times(cmd.quantity);
        let mut events = vec![GroupedOrderEvent::AllocationQuantityChanged(
            AllocationQuantityChanged {
                grouped_order_id: cmd.grouped_order_id,
                allocation_id: allocation.id,
                request_id: allocation.request_id,
                line_no: allocation.line_no,
                previous_quantity: allocation.allocated_quantity,
                quantity: cmd.quantity,
                amount_after,
                occurred_at: cmd.occurred_at,
            },
        )];
        events.extend(self.threshold_events(
            amount_after,
            cmd.threshold,
            &cmd.system_validator,
            cmd.occurred_at,
        ));

        Ok(events)
    }

    fn handle_cancel_allocation(
        &self,
        cmd: &CancelAllocation,
    ) -> Result<Vec<GroupedOrderEvent>, DomainError> {
        self.ensure_exists(cmd.grouped_order_id)?;

        let allocation = self
            .allocation(cmd.allocation_id)
            .ok_or_else(DomainError::not_found)?;
        if !allocation.is_active() {
            return Ok(vec![]);
        }
        if !self.status.accepts_allocations() {
            return Err(DomainError::invariant(
                "allocations of a validated grouped order are frozen",
            ));
        }

        Ok(vec![GroupedOrderEvent::AllocationCancelled(
            AllocationCancelled {
                grouped_order_id: cmd.grouped_order_id,
                allocation_id: allocation.id,
                request_id: allocation.request_id,
                line_no: allocation.line_no,
                quantity: allocation.allocated_quantity,
                amount_after: self.current_amount - allocation.amount(),
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_validate(&self, cmd: &Validate) -> Result<Vec<GroupedOrderEvent>, DomainError> {
        self.ensure_exists(cmd.grouped_order_id)?;
        self.ensure_accepting(GroupedOrderStatus::Validated)?;

        if cmd.validated_by.trim().is_empty() {
            return Err(DomainError::validation("validator identity is required"));
        }
        if self.active_allocations().next().is_none() {
            return Err(DomainError::validation(
                "cannot validate a grouped order without allocations",
            ));
        }

        let below_threshold = cmd
            .threshold
            .filter(|t| t.is_positive())
            .is_some_and(|t| self.current_amount < t);

        Ok(vec![GroupedOrderEvent::GroupedOrderValidated(
            GroupedOrderValidated {
                grouped_order_id: cmd.grouped_order_id,
                validated_by: cmd.validated_by.clone(),
                notes: cmd.notes.clone(),
                automatic: false,
                below_threshold,
                amount: self.current_amount,
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_acknowledge(
        &self,
        cmd: &AcknowledgeThresholdAlert,
    ) -> Result<Vec<GroupedOrderEvent>, DomainError> {
        self.ensure_exists(cmd.grouped_order_id)?;

        if self.threshold_alert_sent {
            return Ok(vec![]);
        }
        if self.threshold_reached_at.is_none() {
            return Err(DomainError::invariant("threshold has not been reached"));
        }

        Ok(vec![GroupedOrderEvent::ThresholdAlertAcknowledged(
            ThresholdAlertAcknowledged {
                grouped_order_id: cmd.grouped_order_id,
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_reserve(
        &self,
        cmd: &ReserveSupplierOrder,
    ) -> Result<Vec<GroupedOrderEvent>, DomainError> {
        self.ensure_exists(cmd.grouped_order_id)?;

        match self.supplier_order_id {
            Some(existing) if existing == cmd.supplier_order_id => return Ok(vec![]),
            Some(_) => {
                return Err(DomainError::conflict(
                    "a different supplier order is already reserved",
                ));
            }
            None => {}
        }
        if self.status != GroupedOrderStatus::Validated {
            return Err(DomainError::invariant(
                "only validated grouped orders can be finalized",
            ));
        }

        Ok(vec![GroupedOrderEvent::SupplierOrderReserved(
            SupplierOrderReserved {
                grouped_order_id: cmd.grouped_order_id,
                supplier_order_id: cmd.supplier_order_id,
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_mark_ordered(
        &self,
        cmd: &MarkOrdered,
    ) -> Result<Vec<GroupedOrderEvent>, DomainError> {
        self.ensure_exists(cmd.grouped_order_id)?;

        if self.status == GroupedOrderStatus::Ordered
            && self.supplier_order_id == Some(cmd.supplier_order_id)
        {
            return Ok(vec![]);
        }
        if self.status != GroupedOrderStatus::Validated {
            return Err(DomainError::transition(
                "grouped order",
                self.status,
                GroupedOrderStatus::Ordered,
            ));
        }
        if self
            .supplier_order_id
            .is_some_and(|reserved| reserved != cmd.supplier_order_id)
        {
            return Err(DomainError::conflict(
                "supplier order does not match the reservation",
            ));
        }
        let unlinked = self
            .active_allocations()
            .any(|a| !cmd.links.iter().any(|l| l.allocation_id == a.id));
        if unlinked {
            return Err(DomainError::invariant(
                "every active allocation must be linked to a supplier-order line",
            ));
        }

        Ok(vec![GroupedOrderEvent::GroupedOrderOrdered(
            GroupedOrderOrdered {
                grouped_order_id: cmd.grouped_order_id,
                supplier_order_id: cmd.supplier_order_id,
                links: cmd.links.clone(),
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_cancel(
        &self,
        cmd: &CancelGroupedOrder,
    ) -> Result<Vec<GroupedOrderEvent>, DomainError> {
        self.ensure_exists(cmd.grouped_order_id)?;
        self.ensure_accepting(GroupedOrderStatus::Cancelled)?;

        let released = self
            .active_allocations()
            .map(|a| ReleasedAllocation {
                allocation_id: a.id,
                request_id: a.request_id,
                line_no: a.line_no,
                quantity: a.allocated_quantity,
            })
            .collect();

        Ok(vec![GroupedOrderEvent::GroupedOrderCancelled(
            GroupedOrderCancelled {
                grouped_order_id: cmd.grouped_order_id,
                reason: cmd.reason.clone(),
                released,
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_distribute(
        &self,
        cmd: &DistributeDelivery,
    ) -> Result<Vec<GroupedOrderEvent>, DomainError> {
        self.ensure_exists(cmd.grouped_order_id)?;

        if self.status != GroupedOrderStatus::Ordered {
            return Err(DomainError::invariant(
                "deliveries are only recorded against ordered grouped orders",
            ));
        }
        let accounted = self.received_accounted(cmd.supplier_order_line);
        if cmd.received_total <= accounted {
            return Ok(vec![]);
        }

        let unaccounted = cmd.received_total - accounted;
        let mut remaining = unaccounted;
        let mut events = Vec::new();
        for allocation in self.allocations_for_supplier_order_line(cmd.supplier_order_line) {
            if remaining == 0 {
                break;
            }
            let share = remaining.min(allocation.remaining_to_deliver());
            if share == 0 {
                continue;
            }
            remaining -= share;
            events.push(GroupedOrderEvent::AllocationDelivered(AllocationDelivered {
                grouped_order_id: cmd.grouped_order_id,
                allocation_id: allocation.id,
                request_id: allocation.request_id,
                line_no: allocation.line_no,
                quantity: share,
                actual_price: cmd.actual_price,
                occurred_at: cmd.occurred_at,
            }));
        }
        events.push(GroupedOrderEvent::ReceiptAccounted(ReceiptAccounted {
            grouped_order_id: cmd.grouped_order_id,
            supplier_order_line: cmd.supplier_order_line,
            received_total: cmd.received_total,
            distributed: unaccounted - remaining,
            excess: remaining,
            occurred_at: cmd.occurred_at,
        }));

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use procura_events::execute;
    use procura_suppliers::CatalogItemId;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn run(order: &mut GroupedOrder, cmd: GroupedOrderCommand) -> Vec<GroupedOrderEvent> {
        execute(order, &cmd).unwrap()
    }

    fn open(auto: bool) -> GroupedOrder {
        let id = GroupedOrderId::generate();
        let mut order = GroupedOrder::empty(id);
        run(
            &mut order,
            GroupedOrderCommand::OpenGroupedOrder(OpenGroupedOrder {
                grouped_order_id: id,
                supplier_id: SupplierId::generate(),
                auto_validate_on_threshold: auto,
                occurred_at: now(),
            }),
        );
        order
    }

    fn add_cmd(
        order: &GroupedOrder,
        item: CatalogItemId,
        quantity: u32,
        unit: i64,
        threshold: Option<Money>,
    ) -> GroupedOrderCommand {
        GroupedOrderCommand::AddAllocation(AddAllocation {
            grouped_order_id: order.id_typed(),
            allocation_id: AllocationId::generate(),
            request_id: MaterialRequestId::generate(),
            line_no: 1,
            item_key: ItemKey::Catalog(item),
            designation: "Moving head".to_string(),
            quantity,
            estimated_price: Money::from_units(unit),
            threshold,
            system_validator: "system:auto".to_string(),
            occurred_at: now(),
        })
    }

    fn threshold() -> Option<Money> {
        Some(Money::from_units(500))
    }

    #[test]
    fn open_assigns_grp_number() {
        let order = open(false);
        assert!(order.order_number().starts_with("GRP-"));
        assert_eq!(order.status(), GroupedOrderStatus::Open);
        assert_eq!(order.version(), 1);
    }

    #[test]
    fn amount_below_threshold_stays_open() {
        let mut order = open(true);
        let item = CatalogItemId::generate();
        let events = { let cmd = add_cmd(&order, item, 3, 100, threshold()); run(&mut order, cmd) };

        assert_eq!(events.len(), 1);
        assert_eq!(order.current_amount(), Money::from_units(300));
        assert_eq!(order.status(), GroupedOrderStatus::Open);
        assert_eq!(
            order.remaining_to_threshold(threshold()),
            Some(Money::from_units(200))
        );
    }

    #[test]
    fn crossing_without_auto_validation_stops_at_threshold_reached() {
        let mut order = open(false);
        let item = CatalogItemId::generate();
        { let cmd = add_cmd(&order, item, 3, 100, threshold()); run(&mut order, cmd) };
        let events = { let cmd = add_cmd(&order, item, 3, 100, threshold()); run(&mut order, cmd) };

        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], GroupedOrderEvent::ThresholdReached(_)));
        assert_eq!(order.status(), GroupedOrderStatus::ThresholdReached);
        assert!(order.threshold_alert_pending());
        assert!(!order.threshold_alert_sent());
    }

    #[test]
    fn crossing_with_auto_validation_validates_in_the_same_batch() {
        let mut order = open(true);
        let item = CatalogItemId::generate();
        { let cmd = add_cmd(&order, item, 3, 100, threshold()); run(&mut order, cmd) };
        let events = { let cmd = add_cmd(&order, item, 3, 100, threshold()); run(&mut order, cmd) };

        assert_eq!(events.len(), 3);
        assert_eq!(order.status(), GroupedOrderStatus::Validated);
        let validation = order.validation().unwrap();
        assert!(validation.automatic);
        assert_eq!(validation.validated_by, "system:auto");
        assert_eq!(order.current_amount(), Money::from_units(600));
    }

    #[test]
    fn threshold_is_raised_only_once() {
        let mut order = open(false);
        let item = CatalogItemId::generate();
        { let cmd = add_cmd(&order, item, 6, 100, threshold()); run(&mut order, cmd) };
        let events = { let cmd = add_cmd(&order, item, 1, 100, threshold()); run(&mut order, cmd) };
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn zero_threshold_never_triggers() {
        let mut order = open(true);
        let item = CatalogItemId::generate();
        let events = { let cmd = add_cmd(&order, item, 100, 100, Some(Money::ZERO)); run(&mut order, cmd) };
        assert_eq!(events.len(), 1);
        assert_eq!(order.status(), GroupedOrderStatus::Open);
    }

    #[test]
    fn acknowledge_is_idempotent_and_requires_crossing() {
        let mut order = open(false);
        let ack = GroupedOrderCommand::AcknowledgeThresholdAlert(AcknowledgeThresholdAlert {
            grouped_order_id: order.id_typed(),
            occurred_at: now(),
        });
        assert!(order.handle(&ack).is_err());

        let item = CatalogItemId::generate();
        { let cmd = add_cmd(&order, item, 5, 100, threshold()); run(&mut order, cmd) };
        run(&mut order, ack.clone());
        assert!(order.threshold_alert_sent());
        assert!(order.handle(&ack).unwrap().is_empty());
    }

    #[test]
    fn duplicate_line_allocation_is_a_conflict() {
        let mut order = open(false);
        let item = CatalogItemId::generate();
        let cmd = add_cmd(&order, item, 2, 10, None);
        run(&mut order, cmd.clone());

        let GroupedOrderCommand::AddAllocation(mut again) = cmd else {
            unreachable!()
        };
        again.allocation_id = AllocationId::generate();
        let err = order
            .handle(&GroupedOrderCommand::AddAllocation(again))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn manual_validation_below_threshold_is_flagged() {
        let mut order = open(false);
        let item = CatalogItemId::generate();
        { let cmd = add_cmd(&order, item, 1, 100, threshold()); run(&mut order, cmd) };
        { let cmd = GroupedOrderCommand::Validate(Validate {
                grouped_order_id: order.id_typed(),
                validated_by: "buyer".to_string(),
                notes: Some("urgent install".to_string()),
                threshold: threshold(),
                occurred_at: now(),
            }); run(&mut order, cmd) };
        let validation = order.validation().unwrap();
        assert!(validation.below_threshold);
        assert!(!validation.automatic);
        assert_eq!(order.status(), GroupedOrderStatus::Validated);
    }

    #[test]
    fn validation_requires_an_active_allocation() {
        let order = open(false);
        let err = order
            .handle(&GroupedOrderCommand::Validate(Validate {
                grouped_order_id: order.id_typed(),
                validated_by: "buyer".to_string(),
                notes: None,
                threshold: None,
                occurred_at: now(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn validated_order_rejects_new_allocations() {
        let mut order = open(true);
        let item = CatalogItemId::generate();
        { let cmd = add_cmd(&order, item, 6, 100, threshold()); run(&mut order, cmd) };
        assert_eq!(order.status(), GroupedOrderStatus::Validated);

        let err = order
            .handle(&add_cmd(&order, item, 1, 100, threshold()))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn cancel_releases_every_active_allocation() {
        let mut order = open(false);
        let item = CatalogItemId::generate();
        { let cmd = add_cmd(&order, item, 2, 50, None); run(&mut order, cmd) };
        { let cmd = add_cmd(&order, item, 1, 50, None); run(&mut order, cmd) };

        let events = { let cmd = GroupedOrderCommand::Cancel(CancelGroupedOrder {
                grouped_order_id: order.id_typed(),
                reason: Some("supplier closed".to_string()),
                occurred_at: now(),
            }); run(&mut order, cmd) };
        let GroupedOrderEvent::GroupedOrderCancelled(cancelled) = &events[0] else {
            panic!("expected GroupedOrderCancelled");
        };
        assert_eq!(cancelled.released.len(), 2);
        assert_eq!(order.status(), GroupedOrderStatus::Cancelled);
        assert_eq!(order.current_amount(), Money::ZERO);
        assert!(order.active_allocations().next().is_none());
        assert_eq!(order.allocations().len(), 2);
    }

    #[test]
    fn removing_one_allocation_recomputes_amount() {
        let mut order = open(false);
        let item = CatalogItemId::generate();
        { let cmd = add_cmd(&order, item, 2, 50, None); run(&mut order, cmd) };
        { let cmd = add_cmd(&order, item, 1, 70, None); run(&mut order, cmd) };
        let first = order.allocations()[0].id;

        { let cmd = GroupedOrderCommand::CancelAllocation(CancelAllocation {
                grouped_order_id: order.id_typed(),
                allocation_id: first,
                occurred_at: now(),
            }); run(&mut order, cmd) };
        assert_eq!(order.current_amount(), Money::from_units(70));
        assert_eq!(order.current_amount(), order.recomputed_amount());
    }

    fn ordered_with_two_allocations() -> GroupedOrder {
        let mut order = open(true);
        let item = CatalogItemId::generate();
        { let cmd = add_cmd(&order, item, 3, 100, threshold()); run(&mut order, cmd) };
        { let cmd = add_cmd(&order, item, 3, 100, threshold()); run(&mut order, cmd) };
        let supplier_order_id = SupplierOrderId::generate();
        let links = order
            .active_allocations()
            .map(|a| AllocationLink {
                allocation_id: a.id,
                supplier_order_line: 1,
            })
            .collect();
        { let cmd = GroupedOrderCommand::MarkOrdered(MarkOrdered {
                grouped_order_id: order.id_typed(),
                supplier_order_id,
                links,
                occurred_at: now(),
            }); run(&mut order, cmd) };
        order
    }

    fn distribute(order: &GroupedOrder, received_total: u32) -> GroupedOrderCommand {
        GroupedOrderCommand::DistributeDelivery(DistributeDelivery {
            grouped_order_id: order.id_typed(),
            supplier_order_line: 1,
            received_total,
            actual_price: None,
            occurred_at: now(),
        })
    }

    #[test]
    fn delivery_fills_oldest_allocation_first() {
        let mut order = ordered_with_two_allocations();
        { let cmd = distribute(&order, 4); run(&mut order, cmd) };

        let allocations = order.allocations_for_supplier_order_line(1);
        assert_eq!(allocations[0].delivered_quantity, 3);
        assert_eq!(allocations[0].status, AllocationStatus::Delivered);
        assert!(allocations[0].delivered_at.is_some());
        assert_eq!(allocations[1].delivered_quantity, 1);
        assert_eq!(allocations[1].status, AllocationStatus::PartiallyDelivered);
    }

    #[test]
    fn delivery_caps_each_allocation() {
        let mut order = ordered_with_two_allocations();
        let events = { let cmd = distribute(&order, 10); run(&mut order, cmd) };

        let distributed: u32 = events
            .iter()
            .map(|e| match e {
                GroupedOrderEvent::AllocationDelivered(d) => d.quantity,
                _ => 0,
            })
            .sum();
        assert_eq!(distributed, 6);
        assert!(
            order
                .active_allocations()
                .all(|a| a.delivered_quantity == a.allocated_quantity)
        );
        assert_eq!(order.received_accounted(1), 10);
        assert!(matches!(
            events.last(),
            Some(GroupedOrderEvent::ReceiptAccounted(r)) if r.distributed == 6 && r.excess == 4
        ));
        assert!(order.handle(&distribute(&order, 1)).unwrap().is_empty());
    }

    #[test]
    fn receipt_totals_only_spread_the_unaccounted_part() {
        let mut order = ordered_with_two_allocations();
        { let cmd = distribute(&order, 2); run(&mut order, cmd) };

        // The same total again changes nothing.
        assert!(order.handle(&distribute(&order, 2)).unwrap().is_empty());

        let events = { let cmd = distribute(&order, 5); run(&mut order, cmd) };
        let shares: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                GroupedOrderEvent::AllocationDelivered(d) => Some(d.quantity),
                _ => None,
            })
            .collect();
        assert_eq!(shares, vec![1, 2]);

        let allocations = order.allocations_for_supplier_order_line(1);
        assert_eq!(allocations[0].delivered_quantity, 3);
        assert_eq!(allocations[1].delivered_quantity, 2);
        assert_eq!(order.received_accounted(1), 5);
    }

    fn change_cmd(
        order: &GroupedOrder,
        allocation_id: AllocationId,
        quantity: u32,
    ) -> GroupedOrderCommand {
        GroupedOrderCommand::ChangeAllocationQuantity(ChangeAllocationQuantity {
            grouped_order_id: order.id_typed(),
            allocation_id,
            quantity,
            threshold: threshold(),
            system_validator: "system:auto".to_string(),
            occurred_at: now(),
        })
    }

    #[test]
    fn changing_quantity_recomputes_amount() {
        let mut order = open(false);
        let item = CatalogItemId::generate();
        { let cmd = add_cmd(&order, item, 3, 50, threshold()); run(&mut order, cmd) };
        let allocation_id = order.allocations()[0].id;

        let events = { let cmd = change_cmd(&order, allocation_id, 2); run(&mut order, cmd) };
        assert!(matches!(
            &events[..],
            [GroupedOrderEvent::AllocationQuantityChanged(c)]
                if c.previous_quantity == 3 && c.quantity == 2
        ));
        assert_eq!(order.current_amount(), Money::from_units(100));
        assert_eq!(order.current_amount(), order.recomputed_amount());

        assert!(order.handle(&change_cmd(&order, allocation_id, 2)).unwrap().is_empty());
    }

    #[test]
    fn growing_an_allocation_can_cross_the_threshold() {
        let mut order = open(true);
        let item = CatalogItemId::generate();
        { let cmd = add_cmd(&order, item, 3, 100, threshold()); run(&mut order, cmd) };
        let allocation_id = order.allocations()[0].id;

        let events = { let cmd = change_cmd(&order, allocation_id, 6); run(&mut order, cmd) };
        assert_eq!(events.len(), 3);
        assert!(matches!(events[1], GroupedOrderEvent::ThresholdReached(_)));
        assert_eq!(order.status(), GroupedOrderStatus::Validated);
        assert_eq!(order.current_amount(), Money::from_units(600));

        let frozen = order.handle(&change_cmd(&order, allocation_id, 1)).unwrap_err();
        assert!(matches!(frozen, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn changing_quantity_needs_an_active_allocation() {
        let mut order = open(false);
        let item = CatalogItemId::generate();
        { let cmd = add_cmd(&order, item, 3, 50, None); run(&mut order, cmd) };
        let allocation_id = order.allocations()[0].id;

        let err = order.handle(&change_cmd(&order, allocation_id, 0)).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        { let cmd = GroupedOrderCommand::CancelAllocation(CancelAllocation {
                grouped_order_id: order.id_typed(),
                allocation_id,
                occurred_at: now(),
            }); run(&mut order, cmd) };
        let err = order.handle(&change_cmd(&order, allocation_id, 4)).unwrap_err();
        assert!(matches!(err, DomainError::NotFound));
    }

    #[test]
    fn one_item_cannot_outgrow_a_supplier_order_line() {
        let mut order = open(false);
        let item = CatalogItemId::generate();
        { let cmd = add_cmd(&order, item, 3_000_000_000, 0, None); run(&mut order, cmd) };

        let err = order
            .handle(&add_cmd(&order, item, 3_000_000_000, 0, None))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        // A different item is unaffected.
        let other = CatalogItemId::generate();
        { let cmd = add_cmd(&order, other, 3_000_000_000, 0, None); run(&mut order, cmd) };
        { let cmd = add_cmd(&order, item, 1_000_000_000, 0, None); run(&mut order, cmd) };
        assert_eq!(order.active_allocations().count(), 3);
        assert_eq!(order.item_quantity(&ItemKey::Catalog(item)), 4_000_000_000);

        let first = order.allocations()[0].id;
        let err = order
            .handle(&change_cmd(&order, first, u32::MAX))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn mark_ordered_is_idempotent() {
        let order = ordered_with_two_allocations();
        let again = GroupedOrderCommand::MarkOrdered(MarkOrdered {
            grouped_order_id: order.id_typed(),
            supplier_order_id: order.supplier_order_id().unwrap(),
            links: vec![],
            occurred_at: now(),
        });
        assert!(order.handle(&again).unwrap().is_empty());
    }
}

#[cfg(test)]
mod proptest_tests {
    use super::*;
    use proptest::prelude::*;
    use procura_suppliers::CatalogItemId;

    proptest! {
        #[test]
        fn amount_tracks_active_allocations(
            ops in prop::collection::vec((1u32..10, 1i64..50_000, any::<bool>()), 1..30),
            threshold_units in prop::option::of(1i64..5_000),
        ) {
            let id = GroupedOrderId::generate();
            let at = Utc::now();
            let mut order = GroupedOrder::empty(id);
            let open = GroupedOrderCommand::OpenGroupedOrder(OpenGroupedOrder {
                grouped_order_id: id,
                supplier_id: SupplierId::generate(),
                auto_validate_on_threshold: false,
                occurred_at: at,
            });
            for e in order.handle(&open).unwrap() {
                order.apply(&e);
            }

            let threshold = threshold_units.map(Money::from_units);
            let mut crossings = 0;
            for (quantity, cents, cancel_first) in ops {
                if cancel_first {
                    let first = order.active_allocations().next().map(|a| a.id);
                    if let Some(first) = first {
                        let cmd = GroupedOrderCommand::CancelAllocation(CancelAllocation {
                            grouped_order_id: id,
                            allocation_id: first,
                            occurred_at: at,
                        });
                        for e in order.handle(&cmd).unwrap() {
                            order.apply(&e);
                        }
                    }
                }
                let cmd = GroupedOrderCommand::AddAllocation(AddAllocation {
                    grouped_order_id: id,
                    allocation_id: AllocationId::generate(),
                    request_id: MaterialRequestId::generate(),
                    line_no: 1,
                    item_key: ItemKey::Catalog(CatalogItemId::generate()),
                    designation: "x".to_string(),
                    quantity,
                    estimated_price: Money::from_cents(cents),
                    threshold,
                    system_validator: "system:auto".to_string(),
                    occurred_at: at,
                });
                for e in order.handle(&cmd).unwrap() {
                    if matches!(e, GroupedOrderEvent::ThresholdReached(_)) {
                        crossings += 1;
                    }
                    order.apply(&e);
                }

                prop_assert_eq!(order.current_amount(), order.recomputed_amount());
                if let Some(t) = threshold {
                    if order.current_amount() >= t {
                        prop_assert_ne!(order.status(), GroupedOrderStatus::Open);
                    }
                }
            }
            prop_assert!(crossings <= 1);
        }
    }
}
