use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use procura_core::{Aggregate, AggregateRoot, DomainError, Money, domain_id};
use procura_events::Event;
use procura_suppliers::SupplierId;

use crate::allocation::{Allocation, AllocationId, ItemKey};
use crate::grouped_order::GroupedOrderId;

domain_id!(
    /// Supplier (purchase) order identifier.
    SupplierOrderId
);

/// Receipt progress of a supplier order. Dispatch to the supplier happens
/// outside the engine; the order stays `Pending` until goods arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupplierOrderStatus {
    Pending,
    PartiallyReceived,
    Received,
}

/// One line of a supplier order: every allocation of one item, summed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplierOrderItem {
    pub line_no: u32,
    pub item_key: ItemKey,
    pub designation: String,
    pub quantity: u32,
    pub unit_price: Money,
    /// Everything physically received, excess included.
    pub quantity_received: u32,
    pub allocation_ids: Vec<AllocationId>,
}

impl SupplierOrderItem {
    pub fn is_fully_received(&self) -> bool {
        self.quantity_received >= self.quantity
    }

    pub fn line_amount(&self) -> Money {
        self.unit_price.times(self.quantity)
    }
}

/// Item produced by [`consolidate`], before it becomes a supplier-order line.
pub type ConsolidatedItem = SupplierOrderItem;

/// Group active allocations by item, in order of first appearance.
///
/// Quantities are summed; the unit price is the quantity-weighted average of
/// the contributing estimated prices. A per-item total that does not fit a
/// `u32` is refused rather than wrapped.
pub fn consolidate<'a, I>(allocations: I) -> Result<Vec<ConsolidatedItem>, DomainError>
where
    I: IntoIterator<Item = &'a Allocation>,
{
    let mut ordered: Vec<&Allocation> = allocations.into_iter().filter(|a| a.is_active()).collect();
    ordered.sort_by_key(|a| a.sequence);

    let mut items: Vec<(ConsolidatedItem, Vec<(Money, u32)>)> = Vec::new();
    for allocation in ordered {
        let position = items
            .iter()
            .position(|(item, _)| item.item_key == allocation.item_key);
        let (item, prices) = match position {
            Some(index) => &mut items[index],
            None => {
                let line_no = u32::try_from(items.len() + 1)
                    .map_err(|_| DomainError::validation("too many supplier-order lines"))?;
                items.push((
                    SupplierOrderItem {
                        line_no,
                        item_key: allocation.item_key.clone(),
                        designation: allocation.designation.clone(),
                        quantity: 0,
                        unit_price: Money::ZERO,
                        quantity_received: 0,
                        allocation_ids: Vec::new(),
                    },
                    Vec::new(),
                ));
                let last = items.len() - 1;
                &mut items[last]
            }
        };
        item.quantity = item
            .quantity
            .checked_add(allocation.allocated_quantity)
            .ok_or_else(|| {
                DomainError::validation(format!(
                    "consolidated quantity of {} exceeds {}",
                    item.designation,
                    u32::MAX
                ))
            })?;
        item.allocation_ids.push(allocation.id);
        prices.push((allocation.estimated_price, allocation.allocated_quantity));
    }

    Ok(items
        .into_iter()
        .map(|(mut item, prices)| {
            item.unit_price = Money::weighted_average(prices).unwrap_or(Money::ZERO);
            item
        })
        .collect())
}

/// Aggregate root: SupplierOrder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupplierOrder {
    id: SupplierOrderId,
    grouped_order_id: Option<GroupedOrderId>,
    supplier_id: Option<SupplierId>,
    order_number: String,
    status: SupplierOrderStatus,
    items: Vec<SupplierOrderItem>,
    total_amount: Money,
    created_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl SupplierOrder {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: SupplierOrderId) -> Self {
        Self {
            id,
            grouped_order_id: None,
            supplier_id: None,
            order_number: String::new(),
            status: SupplierOrderStatus::Pending,
            items: Vec::new(),
            total_amount: Money::ZERO,
            created_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> SupplierOrderId {
        self.id
    }

    pub fn exists(&self) -> bool {
        self.created
    }

    pub fn grouped_order_id(&self) -> Option<GroupedOrderId> {
        self.grouped_order_id
    }

    pub fn supplier_id(&self) -> Option<SupplierId> {
        self.supplier_id
    }

    pub fn order_number(&self) -> &str {
        &self.order_number
    }

    pub fn status(&self) -> SupplierOrderStatus {
        self.status
    }

    pub fn items(&self) -> &[SupplierOrderItem] {
        &self.items
    }

    pub fn item(&self, line_no: u32) -> Option<&SupplierOrderItem> {
        self.items.iter().find(|i| i.line_no == line_no)
    }

    pub fn total_amount(&self) -> Money {
        self.total_amount
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }
}

impl AggregateRoot for SupplierOrder {
    type Id = SupplierOrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: PlaceSupplierOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceSupplierOrder {
    pub supplier_order_id: SupplierOrderId,
    pub grouped_order_id: GroupedOrderId,
    pub supplier_id: SupplierId,
    pub items: Vec<SupplierOrderItem>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReceiveItem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveItem {
    pub supplier_order_id: SupplierOrderId,
    pub line_no: u32,
    pub quantity: u32,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupplierOrderCommand {
    Place(PlaceSupplierOrder),
    ReceiveItem(ReceiveItem),
}

/// Event: SupplierOrderPlaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplierOrderPlaced {
    pub supplier_order_id: SupplierOrderId,
    pub grouped_order_id: GroupedOrderId,
    pub supplier_id: SupplierId,
    pub order_number: String,
    pub items: Vec<SupplierOrderItem>,
    pub total_amount: Money,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ItemReceived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemReceived {
    pub supplier_order_id: SupplierOrderId,
    pub line_no: u32,
    pub quantity: u32,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupplierOrderEvent {
    SupplierOrderPlaced(SupplierOrderPlaced),
    ItemReceived(ItemReceived),
}

impl Event for SupplierOrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            SupplierOrderEvent::SupplierOrderPlaced(_) => "purchasing.supplier_order.placed",
            SupplierOrderEvent::ItemReceived(_) => "purchasing.supplier_order.item_received",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            SupplierOrderEvent::SupplierOrderPlaced(e) => e.occurred_at,
            SupplierOrderEvent::ItemReceived(e) => e.occurred_at,
        }
    }
}

impl Aggregate for SupplierOrder {
    type Command = SupplierOrderCommand;
    type Event = SupplierOrderEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            SupplierOrderEvent::SupplierOrderPlaced(e) => {
                self.id = e.supplier_order_id;
                self.grouped_order_id = Some(e.grouped_order_id);
                self.supplier_id = Some(e.supplier_id);
                self.order_number = e.order_number.clone();
                self.items = e.items.clone();
                self.total_amount = e.total_amount;
                self.status = SupplierOrderStatus::Pending;
                self.created_at = Some(e.occurred_at);
                self.created = true;
            }
            SupplierOrderEvent::ItemReceived(e) => {
                if let Some(item) = self.items.iter_mut().find(|i| i.line_no == e.line_no) {
                    item.quantity_received = item.quantity_received.saturating_add(e.quantity);
                }
                self.status = if self.items.iter().all(SupplierOrderItem::is_fully_received) {
                    SupplierOrderStatus::Received
                } else {
                    SupplierOrderStatus::PartiallyReceived
                };
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            SupplierOrderCommand::Place(cmd) => self.handle_place(cmd),
            SupplierOrderCommand::ReceiveItem(cmd) => self.handle_receive(cmd),
        }
    }
}

impl SupplierOrder {
    fn handle_place(
        &self,
        cmd: &PlaceSupplierOrder,
    ) -> Result<Vec<SupplierOrderEvent>, DomainError> {
        if self.created {
            if self.grouped_order_id == Some(cmd.grouped_order_id) {
                return Ok(vec![]);
            }
            return Err(DomainError::conflict("supplier order already exists"));
        }
        if cmd.items.is_empty() {
            return Err(DomainError::validation(
                "a supplier order needs at least one item",
            ));
        }
        if cmd.items.iter().any(|i| i.quantity == 0) {
            return Err(DomainError::validation("item quantity must be positive"));
        }

        let total_amount = cmd.items.iter().map(SupplierOrderItem::line_amount).sum();
        Ok(vec![SupplierOrderEvent::SupplierOrderPlaced(
            SupplierOrderPlaced {
                supplier_order_id: cmd.supplier_order_id,
                grouped_order_id: cmd.grouped_order_id,
                supplier_id: cmd.supplier_id,
                order_number: format!("PO-{}", cmd.occurred_at.timestamp_millis()),
                items: cmd.items.clone(),
                total_amount,
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_receive(&self, cmd: &ReceiveItem) -> Result<Vec<SupplierOrderEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.id != cmd.supplier_order_id {
            return Err(DomainError::invariant("supplier_order_id mismatch"));
        }
        if cmd.quantity == 0 {
            return Err(DomainError::validation("received quantity must be positive"));
        }
        let item = self.item(cmd.line_no).ok_or_else(DomainError::not_found)?;
        if item.quantity_received.checked_add(cmd.quantity).is_none() {
            return Err(DomainError::validation(format!(
                "line {} has already received {}; {} more overflows the receipt counter",
                cmd.line_no, item.quantity_received, cmd.quantity
            )));
        }

        Ok(vec![SupplierOrderEvent::ItemReceived(ItemReceived {
            supplier_order_id: cmd.supplier_order_id,
            line_no: cmd.line_no,
            quantity: cmd.quantity,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::AllocationStatus;
    use procura_events::execute;
    use procura_requests::MaterialRequestId;
    use procura_suppliers::CatalogItemId;

    fn allocation(key: ItemKey, sequence: u32, quantity: u32, cents: i64) -> Allocation {
        Allocation {
            id: AllocationId::generate(),
            request_id: MaterialRequestId::generate(),
            line_no: 1,
            item_key: key,
            designation: "item".to_string(),
            allocated_quantity: quantity,
            delivered_quantity: 0,
            estimated_price: Money::from_cents(cents),
            actual_price: None,
            status: AllocationStatus::Allocated,
            created_at: Utc::now(),
            delivered_at: None,
            supplier_order_line: None,
            sequence,
        }
    }

    #[test]
    fn consolidate_sums_quantities_per_item() {
        let a = ItemKey::Catalog(CatalogItemId::generate());
        let b = ItemKey::FreeText("gaffer tape".to_string());
        let allocations = vec![
            allocation(a.clone(), 1, 3, 10_000),
            allocation(b.clone(), 2, 5, 700),
            allocation(a.clone(), 3, 3, 10_000),
        ];

        let items = consolidate(&allocations).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].item_key, a);
        assert_eq!(items[0].quantity, 6);
        assert_eq!(items[0].line_no, 1);
        assert_eq!(items[0].allocation_ids.len(), 2);
        assert_eq!(items[1].item_key, b);
        assert_eq!(items[1].line_no, 2);
    }

    #[test]
    fn consolidate_uses_weighted_average_price() {
        let key = ItemKey::Catalog(CatalogItemId::generate());
        let allocations = vec![
            allocation(key.clone(), 1, 1, 100),
            allocation(key.clone(), 2, 2, 201),
        ];
        // (100 + 402) / 3 = 167.33.. -> 167
        assert_eq!(consolidate(&allocations).unwrap()[0].unit_price, Money::from_cents(167));
    }

    #[test]
    fn consolidate_skips_cancelled_allocations() {
        let key = ItemKey::Catalog(CatalogItemId::generate());
        let mut cancelled = allocation(key.clone(), 1, 4, 100);
        cancelled.status = AllocationStatus::Cancelled;
        let allocations = vec![cancelled, allocation(key, 2, 1, 100)];

        let items = consolidate(&allocations).unwrap();
        assert_eq!(items[0].quantity, 1);
        assert_eq!(items[0].allocation_ids, vec![allocations[1].id]);
    }

    fn placed(items: Vec<SupplierOrderItem>) -> SupplierOrder {
        let id = SupplierOrderId::generate();
        let mut order = SupplierOrder::empty(id);
        let cmd = SupplierOrderCommand::Place(PlaceSupplierOrder {
            supplier_order_id: id,
            grouped_order_id: GroupedOrderId::generate(),
            supplier_id: SupplierId::generate(),
            items,
            occurred_at: Utc::now(),
        });
        execute(&mut order, &cmd).unwrap();
        order
    }

    fn receive_cmd(order: &SupplierOrder, line_no: u32, quantity: u32) -> SupplierOrderCommand {
        SupplierOrderCommand::ReceiveItem(ReceiveItem {
            supplier_order_id: order.id_typed(),
            line_no,
            quantity,
            occurred_at: Utc::now(),
        })
    }

    fn receive(order: &mut SupplierOrder, line_no: u32, quantity: u32) {
        let cmd = receive_cmd(order, line_no, quantity);
        execute(order, &cmd).unwrap();
    }

    #[test]
    fn receipt_moves_status_forward_and_counts_excess() {
        let key = ItemKey::Catalog(CatalogItemId::generate());
        let items = consolidate(&[allocation(key, 1, 6, 10_000)]).unwrap();
        let mut order = placed(items);
        assert_eq!(order.status(), SupplierOrderStatus::Pending);
        assert_eq!(order.total_amount(), Money::from_units(600));

        receive(&mut order, 1, 4);
        assert_eq!(order.status(), SupplierOrderStatus::PartiallyReceived);

        receive(&mut order, 1, 10);
        assert_eq!(order.status(), SupplierOrderStatus::Received);
        assert_eq!(order.item(1).unwrap().quantity_received, 14);
    }

    #[test]
    fn placing_twice_for_the_same_grouped_order_is_a_no_op() {
        let key = ItemKey::Catalog(CatalogItemId::generate());
        let order = placed(consolidate(&[allocation(key, 1, 1, 100)]).unwrap());
        let again = SupplierOrderCommand::Place(PlaceSupplierOrder {
            supplier_order_id: order.id_typed(),
            grouped_order_id: order.grouped_order_id().unwrap(),
            supplier_id: order.supplier_id().unwrap(),
            items: order.items().to_vec(),
            occurred_at: Utc::now(),
        });
        assert!(order.handle(&again).unwrap().is_empty());
    }

    #[test]
    fn receiving_an_unknown_line_is_not_found() {
        let key = ItemKey::Catalog(CatalogItemId::generate());
        let order = placed(consolidate(&[allocation(key, 1, 1, 100)]).unwrap());
        let cmd = SupplierOrderCommand::ReceiveItem(ReceiveItem {
            supplier_order_id: order.id_typed(),
            line_no: 9,
            quantity: 1,
            occurred_at: Utc::now(),
        });
        assert_eq!(order.handle(&cmd).unwrap_err(), DomainError::NotFound);
    }

    #[test]
    fn consolidation_refuses_a_quantity_that_overflows() {
        let key = ItemKey::Catalog(CatalogItemId::generate());
        let allocations = vec![
            allocation(key.clone(), 1, 3_000_000_000, 100),
            allocation(key, 2, 3_000_000_000, 100),
        ];
        let err = consolidate(&allocations).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn receipts_beyond_the_counter_range_are_refused() {
        let key = ItemKey::Catalog(CatalogItemId::generate());
        let mut order = placed(consolidate(&[allocation(key, 1, 2, 100)]).unwrap());
        receive(&mut order, 1, 4_000_000_000);

        let err = order.handle(&receive_cmd(&order, 1, 4_000_000_000)).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert_eq!(order.item(1).unwrap().quantity_received, 4_000_000_000);

        // Replaying a history recorded before the check cannot wrap either.
        let mut replayed = order.clone();
        replayed.apply(&SupplierOrderEvent::ItemReceived(ItemReceived {
            supplier_order_id: order.id_typed(),
            line_no: 1,
            quantity: 4_000_000_000,
            occurred_at: Utc::now(),
        }));
        assert_eq!(replayed.item(1).unwrap().quantity_received, u32::MAX);
    }
}
