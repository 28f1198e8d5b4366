use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use serde_json::Value as JsonValue;
use thiserror::Error;

use procura_core::AggregateId;
use procura_events::EventEnvelope;
use procura_purchasing::{GroupedOrderEvent, GroupedOrderId};
use procura_requests::MaterialRequestId;
use procura_suppliers::SupplierId;

use crate::engine::GROUPED_ORDER;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("failed to deserialize grouped order event: {0}")]
    Deserialize(#[from] serde_json::Error),
    #[error("grouped order {aggregate_id}: missing events (last={last}, found={found})")]
    Gap {
        aggregate_id: AggregateId,
        last: u64,
        found: u64,
    },
}

#[derive(Debug, Default)]
struct IndexState {
    cursors: HashMap<AggregateId, u64>,
    suppliers: HashMap<GroupedOrderId, SupplierId>,
    open_by_supplier: HashMap<SupplierId, BTreeSet<GroupedOrderId>>,
    by_request: HashMap<MaterialRequestId, BTreeSet<GroupedOrderId>>,
}

impl IndexState {
    fn close(&mut self, grouped_order_id: GroupedOrderId) {
        let Some(supplier_id) = self.suppliers.get(&grouped_order_id) else {
            return;
        };
        if let Some(open) = self.open_by_supplier.get_mut(supplier_id) {
            open.remove(&grouped_order_id);
            if open.is_empty() {
                self.open_by_supplier.remove(supplier_id);
            }
        }
    }
}

/// Which grouped orders a supplier has open, and which orders a request has
/// allocations in.
///
/// Answers the allocation engine's "where does this line go" and the ledger's
/// "what does this request hold" without loading every grouped order. Stale
/// answers are possible while a writer is between append and feed; callers
/// load the aggregate they are pointed at and decide on that.
#[derive(Debug, Default)]
pub struct GroupedOrderIndex {
    state: RwLock<IndexState>,
    primed: AtomicBool,
}

impl GroupedOrderIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` once every existing stream has been fed at least once.
    pub fn is_primed(&self) -> bool {
        self.primed.load(Ordering::Acquire)
    }

    pub fn mark_primed(&self) {
        self.primed.store(true, Ordering::Release);
    }

    /// Last sequence number applied for one grouped order (0 when unseen).
    pub fn cursor(&self, aggregate_id: AggregateId) -> u64 {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .cursors
            .get(&aggregate_id)
            .copied()
            .unwrap_or(0)
    }

    /// The oldest grouped order of `supplier_id` still accepting allocations.
    pub fn open_order(&self, supplier_id: SupplierId) -> Option<GroupedOrderId> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .open_by_supplier
            .get(&supplier_id)
            .and_then(|open| open.first().copied())
    }

    /// Grouped orders that ever received an allocation of `request_id`.
    pub fn orders_for_request(&self, request_id: MaterialRequestId) -> Vec<GroupedOrderId> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_request
            .get(&request_id)
            .map(|orders| orders.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn apply_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), IndexError> {
        if envelope.aggregate_type() != GROUPED_ORDER {
            return Ok(());
        }

        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        let last = state.cursors.get(&aggregate_id).copied().unwrap_or(0);
        if seq <= last {
            return Ok(());
        }
        if seq != last + 1 {
            return Err(IndexError::Gap {
                aggregate_id,
                last,
                found: seq,
            });
        }

        let event: GroupedOrderEvent = serde_json::from_value(envelope.payload().clone())?;
        match event {
            GroupedOrderEvent::GroupedOrderOpened(e) => {
                state.suppliers.insert(e.grouped_order_id, e.supplier_id);
                state
                    .open_by_supplier
                    .entry(e.supplier_id)
                    .or_default()
                    .insert(e.grouped_order_id);
            }
            GroupedOrderEvent::AllocationAdded(e) => {
                state
                    .by_request
                    .entry(e.request_id)
                    .or_default()
                    .insert(e.grouped_order_id);
            }
            GroupedOrderEvent::GroupedOrderValidated(e) => state.close(e.grouped_order_id),
            GroupedOrderEvent::GroupedOrderOrdered(e) => state.close(e.grouped_order_id),
            GroupedOrderEvent::GroupedOrderCancelled(e) => state.close(e.grouped_order_id),
            _ => {}
        }

        state.cursors.insert(aggregate_id, seq);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use procura_core::Money;
    use procura_purchasing::{
        AllocationAdded, AllocationId, GroupedOrderCancelled, GroupedOrderOpened, ItemKey,
    };
    use procura_suppliers::CatalogItemId;
    use uuid::Uuid;

    fn envelope(seq: u64, event: &GroupedOrderEvent, id: GroupedOrderId) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            Uuid::now_v7(),
            id.aggregate_id(),
            GROUPED_ORDER.to_string(),
            "purchasing.grouped_order.test".to_string(),
            seq,
            Utc::now(),
            serde_json::to_value(event).unwrap(),
        )
    }

    fn opened(id: GroupedOrderId, supplier_id: SupplierId) -> GroupedOrderEvent {
        GroupedOrderEvent::GroupedOrderOpened(GroupedOrderOpened {
            grouped_order_id: id,
            supplier_id,
            order_number: "GRP-1".to_string(),
            auto_validate_on_threshold: false,
            occurred_at: Utc::now(),
        })
    }

    fn added(id: GroupedOrderId, request_id: MaterialRequestId) -> GroupedOrderEvent {
        GroupedOrderEvent::AllocationAdded(AllocationAdded {
            grouped_order_id: id,
            allocation_id: AllocationId::generate(),
            request_id,
            line_no: 1,
            item_key: ItemKey::Catalog(CatalogItemId::generate()),
            designation: "Truss clamp".to_string(),
            quantity: 2,
            estimated_price: Money::from_units(10),
            sequence: 1,
            amount_after: Money::from_units(20),
            occurred_at: Utc::now(),
        })
    }

    fn cancelled(id: GroupedOrderId) -> GroupedOrderEvent {
        GroupedOrderEvent::GroupedOrderCancelled(GroupedOrderCancelled {
            grouped_order_id: id,
            reason: Some("supplier closed".to_string()),
            released: vec![],
            occurred_at: Utc::now(),
        })
    }

    #[test]
    fn tracks_open_orders_and_request_membership() {
        let index = GroupedOrderIndex::new();
        let supplier = SupplierId::generate();
        let request = MaterialRequestId::generate();
        let id = GroupedOrderId::generate();

        index.apply_envelope(&envelope(1, &opened(id, supplier), id)).unwrap();
        index.apply_envelope(&envelope(2, &added(id, request), id)).unwrap();
        assert_eq!(index.open_order(supplier), Some(id));
        assert_eq!(index.orders_for_request(request), vec![id]);

        index.apply_envelope(&envelope(3, &cancelled(id), id)).unwrap();
        assert_eq!(index.open_order(supplier), None);
        assert_eq!(index.orders_for_request(request), vec![id]);
        assert_eq!(index.cursor(id.aggregate_id()), 3);
    }

    #[test]
    fn duplicates_are_ignored_and_gaps_reported() {
        let index = GroupedOrderIndex::new();
        let supplier = SupplierId::generate();
        let id = GroupedOrderId::generate();
        let first = envelope(1, &opened(id, supplier), id);

        index.apply_envelope(&first).unwrap();
        index.apply_envelope(&first).unwrap();
        assert_eq!(index.cursor(id.aggregate_id()), 1);

        let err = index
            .apply_envelope(&envelope(3, &cancelled(id), id))
            .unwrap_err();
        assert!(matches!(err, IndexError::Gap { last: 1, found: 3, .. }));
        assert_eq!(index.open_order(supplier), Some(id));
    }

    #[test]
    fn an_unseen_stream_must_start_at_its_first_event() {
        let index = GroupedOrderIndex::new();
        let id = GroupedOrderId::generate();
        let err = index
            .apply_envelope(&envelope(2, &cancelled(id), id))
            .unwrap_err();
        assert!(matches!(err, IndexError::Gap { last: 0, found: 2, .. }));
    }

    #[test]
    fn other_streams_are_skipped() {
        let index = GroupedOrderIndex::new();
        let id = GroupedOrderId::generate();
        let foreign = EventEnvelope::new(
            Uuid::now_v7(),
            id.aggregate_id(),
            "requests.material_request".to_string(),
            "requests.material_request.created".to_string(),
            7,
            Utc::now(),
            JsonValue::Null,
        );
        index.apply_envelope(&foreign).unwrap();
        assert_eq!(index.cursor(id.aggregate_id()), 0);
    }

    #[test]
    fn oldest_open_order_wins() {
        let index = GroupedOrderIndex::new();
        let supplier = SupplierId::generate();
        let older = GroupedOrderId::generate();
        let newer = GroupedOrderId::generate();
        index.apply_envelope(&envelope(1, &opened(newer, supplier), newer)).unwrap();
        index.apply_envelope(&envelope(1, &opened(older, supplier), older)).unwrap();
        assert_eq!(index.open_order(supplier), Some(older));
    }
}
