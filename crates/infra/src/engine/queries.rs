//! Read accessors.
//!
//! Aggregates are rebuilt from their streams on every call. Lookups by
//! supplier or by request go through the grouped-order index first, then load
//! only the orders it points at. The handful of queries the core needs are
//! spelled out here instead of a generic finder surface.

use serde_json::Value as JsonValue;

use procura_events::{EventBus, EventEnvelope};
use procura_purchasing::{
    Allocation, GroupedOrder, GroupedOrderId, GroupedOrderStatus, SupplierOrder, SupplierOrderId,
};
use procura_requests::{MaterialRequest, MaterialRequestId, RequestLine};
use procura_suppliers::SupplierId;

use super::{
    GROUPED_ORDER, MATERIAL_REQUEST, ProcurementEngine, new_grouped_order, new_request,
};
use crate::command_dispatcher::DispatchError;
use crate::error::{EngineError, EngineResult};
use crate::event_store::EventStore;

/// An approved request line with quantity still to allocate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingLine {
    pub request_id: MaterialRequestId,
    pub line: RequestLine,
}

/// An allocation together with the grouped order holding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationView {
    pub grouped_order_id: GroupedOrderId,
    pub supplier_id: SupplierId,
    pub grouped_order_status: GroupedOrderStatus,
    pub allocation: Allocation,
}

impl<S, B> ProcurementEngine<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn request(&self, request_id: MaterialRequestId) -> EngineResult<MaterialRequest> {
        self.load_request(request_id)
    }

    pub fn grouped_order(&self, grouped_order_id: GroupedOrderId) -> EngineResult<GroupedOrder> {
        self.load_grouped_order(grouped_order_id)
    }

    pub fn supplier_order(
        &self,
        supplier_order_id: SupplierOrderId,
    ) -> EngineResult<SupplierOrder> {
        self.load_supplier_order(supplier_order_id)
    }

    /// Every material request, oldest first.
    pub fn requests(&self) -> EngineResult<Vec<MaterialRequest>> {
        self.store()
            .stream_ids(MATERIAL_REQUEST)
            .map_err(DispatchError::from)?
            .into_iter()
            .map(|id| self.dispatcher.load(id, new_request).map_err(EngineError::from))
            .collect()
    }

    /// Every grouped order, oldest first.
    pub fn grouped_orders(&self) -> EngineResult<Vec<GroupedOrder>> {
        self.store()
            .stream_ids(GROUPED_ORDER)
            .map_err(DispatchError::from)?
            .into_iter()
            .map(|id| self.dispatcher.load(id, new_grouped_order).map_err(EngineError::from))
            .collect()
    }

    /// The grouped order of `supplier_id` that still accepts allocations.
    pub fn open_grouped_order(&self, supplier_id: SupplierId) -> EngineResult<Option<GroupedOrder>> {
        let index = self.grouped_order_index()?;
        while let Some(grouped_order_id) = index.open_order(supplier_id) {
            let order = self.load_grouped_order(grouped_order_id)?;
            if order.status().accepts_allocations() {
                return Ok(Some(order));
            }
            // The index missed the order closing; bring it up to date and look again.
            let cursor = index.cursor(grouped_order_id.aggregate_id());
            self.catch_up_grouped_order(grouped_order_id.aggregate_id())?;
            if index.cursor(grouped_order_id.aggregate_id()) == cursor {
                return Err(EngineError::rejected(format!(
                    "grouped order index disagrees with stream of {grouped_order_id}"
                )));
            }
        }
        Ok(None)
    }

    pub fn grouped_orders_with_status(
        &self,
        status: GroupedOrderStatus,
    ) -> EngineResult<Vec<GroupedOrder>> {
        Ok(self
            .grouped_orders()?
            .into_iter()
            .filter(|order| order.status() == status)
            .collect())
    }

    /// Lines of approved requests with quantity still to allocate, grouped by
    /// request, oldest request first.
    pub fn unallocated_approved_lines(&self) -> EngineResult<Vec<PendingLine>> {
        Ok(self
            .requests()?
            .iter()
            .flat_map(|request| {
                let request_id = request.id_typed();
                request.unallocated_lines().map(move |line| PendingLine {
                    request_id,
                    line: line.clone(),
                })
            })
            .collect())
    }

    /// Every allocation (cancelled ones included) made for a request.
    pub fn allocations_for_request(
        &self,
        request_id: MaterialRequestId,
    ) -> EngineResult<Vec<AllocationView>> {
        let mut views = Vec::new();
        for grouped_order_id in self.grouped_order_index()?.orders_for_request(request_id) {
            let order = self.load_grouped_order(grouped_order_id)?;
            let Some(supplier_id) = order.supplier_id() else {
                continue;
            };
            views.extend(
                order
                    .allocations()
                    .iter()
                    .filter(|a| a.request_id == request_id)
                    .map(|a| AllocationView {
                        grouped_order_id: order.id_typed(),
                        supplier_id,
                        grouped_order_status: order.status(),
                        allocation: a.clone(),
                    }),
            );
        }
        Ok(views)
    }

    /// Allocations feeding one supplier-order line, in delivery (FIFO) order.
    pub fn allocations_for_supplier_order_item(
        &self,
        supplier_order_id: SupplierOrderId,
        line_no: u32,
    ) -> EngineResult<Vec<Allocation>> {
        let supplier_order = self.load_supplier_order(supplier_order_id)?;
        let grouped_order_id = supplier_order.grouped_order_id().ok_or_else(|| {
            EngineError::not_found(format!("grouped order of supplier order {supplier_order_id}"))
        })?;
        let order = self.load_grouped_order(grouped_order_id)?;
        Ok(order
            .allocations_for_supplier_order_line(line_no)
            .into_iter()
            .cloned()
            .collect())
    }
}
