//! Procurement engine services.
//!
//! ```text
//! Request Intake ─► Allocation Engine ─► Grouped-Order Ledger ─► Order Finalizer ─► Delivery Tracker
//!                                                                                        │
//!                            request lines / allocations ◄───────────────────────────────┘
//! ```
//!
//! [`ProcurementEngine`] wires the event store, the bus and the external ports
//! together. Every state change goes through the [`CommandDispatcher`], so each
//! step is one optimistic append against one aggregate stream. Work that
//! touches a supplier's open grouped order (allocation, validation, cancellation,
//! finalization) runs under that supplier's lock; receipts run under a lock per
//! supplier-order line. Nothing else contends.
//!
//! Grouped-order commits also feed a [`GroupedOrderIndex`], which answers "which
//! order is open for this supplier" and "which orders hold this request"
//! without replaying every grouped-order stream.

mod allocation;
mod delivery;
mod finalizer;
mod intake;
mod ledger;
mod queries;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use procura_core::{AggregateId, DomainResult};
use procura_events::{EventBus, EventEnvelope};
use procura_purchasing::{
    GroupedOrder, GroupedOrderCommand, GroupedOrderId, SupplierOrder, SupplierOrderCommand,
    SupplierOrderId,
};
use procura_requests::{MaterialRequest, MaterialRequestCommand, MaterialRequestId};
use procura_suppliers::SupplierId;

use crate::catalog::{CatalogResolver, SupplierDirectory};
use crate::command_dispatcher::{CommandDispatcher, Committed, DispatchError};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::event_store::{EventStore, StoredEvent};
use crate::locks::KeyedLocks;
use crate::notifier::{Notifier, ProcurementNotice};
use crate::projections::{GroupedOrderIndex, IndexError};

pub use allocation::{AllocationReport, LineAllocation, LineReport};
pub use delivery::{DeliveredShare, DeliveryReport};
pub use intake::NewRequest;
pub use queries::{AllocationView, PendingLine};

/// Stream type of material requests.
pub const MATERIAL_REQUEST: &str = "requests.material_request";
/// Stream type of grouped orders.
pub const GROUPED_ORDER: &str = "purchasing.grouped_order";
/// Stream type of supplier orders.
pub const SUPPLIER_ORDER: &str = "purchasing.supplier_order";

/// The request-to-order consolidation engine.
///
/// Safe to share between threads (`Arc<ProcurementEngine<..>>`); callers are
/// expected to invoke it concurrently.
pub struct ProcurementEngine<S, B> {
    dispatcher: CommandDispatcher<S, B>,
    catalog: Arc<dyn CatalogResolver>,
    suppliers: Arc<dyn SupplierDirectory>,
    notifier: Arc<dyn Notifier>,
    config: EngineConfig,
    supplier_locks: KeyedLocks<SupplierId>,
    delivery_locks: KeyedLocks<(SupplierOrderId, u32)>,
    grouped_order_index: GroupedOrderIndex,
}

impl<S, B> ProcurementEngine<S, B> {
    pub fn new(
        store: S,
        bus: B,
        catalog: Arc<dyn CatalogResolver>,
        suppliers: Arc<dyn SupplierDirectory>,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> Self {
        let dispatcher =
            CommandDispatcher::new(store, bus).with_retry_policy(config.dispatch_retry.clone());
        Self {
            dispatcher,
            catalog,
            suppliers,
            notifier,
            config,
            supplier_locks: KeyedLocks::new(),
            delivery_locks: KeyedLocks::new(),
            grouped_order_index: GroupedOrderIndex::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        self.dispatcher.store()
    }

    pub fn bus(&self) -> &B {
        self.dispatcher.bus()
    }
}

fn new_request(id: AggregateId) -> MaterialRequest {
    MaterialRequest::empty(MaterialRequestId::new(id))
}

fn new_grouped_order(id: AggregateId) -> GroupedOrder {
    GroupedOrder::empty(GroupedOrderId::new(id))
}

fn new_supplier_order(id: AggregateId) -> SupplierOrder {
    SupplierOrder::empty(SupplierOrderId::new(id))
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

impl<S, B> ProcurementEngine<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    fn load_request(&self, request_id: MaterialRequestId) -> EngineResult<MaterialRequest> {
        let request = self
            .dispatcher
            .load(request_id.aggregate_id(), new_request)?;
        if !request.exists() {
            return Err(EngineError::not_found(format!("material request {request_id}")));
        }
        Ok(request)
    }

    fn load_grouped_order(&self, grouped_order_id: GroupedOrderId) -> EngineResult<GroupedOrder> {
        let order = self
            .dispatcher
            .load(grouped_order_id.aggregate_id(), new_grouped_order)?;
        if !order.exists() {
            return Err(EngineError::not_found(format!("grouped order {grouped_order_id}")));
        }
        Ok(order)
    }

    fn load_supplier_order(
        &self,
        supplier_order_id: SupplierOrderId,
    ) -> EngineResult<SupplierOrder> {
        let order = self
            .dispatcher
            .load(supplier_order_id.aggregate_id(), new_supplier_order)?;
        if !order.exists() {
            return Err(EngineError::not_found(format!(
                "supplier order {supplier_order_id}"
            )));
        }
        Ok(order)
    }

    /// Supplier owning a grouped order (the key of its lock).
    fn grouped_order_supplier(&self, grouped_order_id: GroupedOrderId) -> EngineResult<SupplierId> {
        self.load_grouped_order(grouped_order_id)?
            .supplier_id()
            .ok_or_else(|| EngineError::not_found(format!("supplier of grouped order {grouped_order_id}")))
    }

    /// Decide against the current request state, retrying lost races.
    fn run_request(
        &self,
        request_id: MaterialRequestId,
        mut decide: impl FnMut(&MaterialRequest) -> DomainResult<Option<MaterialRequestCommand>>,
    ) -> EngineResult<Committed<MaterialRequest>> {
        Ok(self.dispatcher.execute(
            request_id.aggregate_id(),
            MATERIAL_REQUEST,
            new_request,
            |request| decide(request).map_err(DispatchError::from),
        )?)
    }

    fn send_request(
        &self,
        request_id: MaterialRequestId,
        command: MaterialRequestCommand,
    ) -> EngineResult<Committed<MaterialRequest>> {
        self.run_request(request_id, |_| Ok(Some(command.clone())))
    }

    fn run_grouped_order(
        &self,
        grouped_order_id: GroupedOrderId,
        mut decide: impl FnMut(&GroupedOrder) -> DomainResult<Option<GroupedOrderCommand>>,
    ) -> EngineResult<Committed<GroupedOrder>> {
        let committed = self.dispatcher.execute(
            grouped_order_id.aggregate_id(),
            GROUPED_ORDER,
            new_grouped_order,
            |order| decide(order).map_err(DispatchError::from),
        )?;
        self.index_grouped_order(grouped_order_id, &committed.stored)?;
        Ok(committed)
    }

    /// Feed freshly stored grouped-order events to the index, replaying the
    /// stream when the index missed some.
    fn index_grouped_order(
        &self,
        grouped_order_id: GroupedOrderId,
        stored: &[StoredEvent],
    ) -> EngineResult<()> {
        for event in stored {
            match self.grouped_order_index.apply_envelope(&event.to_envelope()) {
                Ok(()) => {}
                Err(IndexError::Gap { last, found, .. }) => {
                    debug!(%grouped_order_id, last, found, "grouped order index behind, catching up");
                    return self.catch_up_grouped_order(grouped_order_id.aggregate_id());
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn catch_up_grouped_order(&self, aggregate_id: AggregateId) -> EngineResult<()> {
        let cursor = self.grouped_order_index.cursor(aggregate_id);
        let history = self
            .store()
            .load_stream(aggregate_id)
            .map_err(DispatchError::from)?;
        for event in history.iter().filter(|e| e.sequence_number > cursor) {
            self.grouped_order_index.apply_envelope(&event.to_envelope())?;
        }
        Ok(())
    }

    /// The grouped-order index, built from every existing stream on first use.
    fn grouped_order_index(&self) -> EngineResult<&GroupedOrderIndex> {
        if !self.grouped_order_index.is_primed() {
            let ids = self
                .store()
                .stream_ids(GROUPED_ORDER)
                .map_err(DispatchError::from)?;
            for id in ids {
                self.catch_up_grouped_order(id)?;
            }
            self.grouped_order_index.mark_primed();
        }
        Ok(&self.grouped_order_index)
    }

    fn send_grouped_order(
        &self,
        grouped_order_id: GroupedOrderId,
        command: GroupedOrderCommand,
    ) -> EngineResult<Committed<GroupedOrder>> {
        self.run_grouped_order(grouped_order_id, |_| Ok(Some(command.clone())))
    }

    fn run_supplier_order(
        &self,
        supplier_order_id: SupplierOrderId,
        mut decide: impl FnMut(&SupplierOrder) -> DomainResult<Option<SupplierOrderCommand>>,
    ) -> EngineResult<Committed<SupplierOrder>> {
        Ok(self.dispatcher.execute(
            supplier_order_id.aggregate_id(),
            SUPPLIER_ORDER,
            new_supplier_order,
            |order| decide(order).map_err(DispatchError::from),
        )?)
    }

    fn send_supplier_order(
        &self,
        supplier_order_id: SupplierOrderId,
        command: SupplierOrderCommand,
    ) -> EngineResult<Committed<SupplierOrder>> {
        self.run_supplier_order(supplier_order_id, |_| Ok(Some(command.clone())))
    }

    /// Hand a notice to the notifier. A refusal is logged, never fatal.
    fn notify(&self, notice: ProcurementNotice) -> bool {
        let kind = notice.kind();
        match self.notifier.notify(notice) {
            Ok(()) => true,
            Err(err) => {
                warn!(notice = kind, error = %err, "notifier did not accept notice");
                false
            }
        }
    }
}
