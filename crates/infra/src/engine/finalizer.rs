//! Order Finalizer: turns a validated grouped order into one supplier order.
//!
//! Steps, each idempotent on its own:
//!
//! 1. reserve a supplier-order id on the grouped order (a retry reuses it);
//! 2. place the supplier order, one item per distinct item key, unless a
//!    previous attempt already did;
//! 3. link every active allocation to its supplier-order line and move the
//!    grouped order to `Ordered`.
//!
//! A failure anywhere leaves the grouped order `Validated`; running
//! [`ProcurementEngine::finalize`] again picks up where it stopped.

use serde_json::Value as JsonValue;
use tracing::{debug, info};

use procura_events::{EventBus, EventEnvelope};
use procura_purchasing::{
    AllocationLink, GroupedOrderCommand, GroupedOrderId, GroupedOrderStatus, MarkOrdered,
    PlaceSupplierOrder, ReserveSupplierOrder, SupplierOrderCommand, SupplierOrderId, consolidate,
};

use super::{ProcurementEngine, now};
use crate::error::{EngineError, EngineResult};
use crate::event_store::EventStore;
use crate::notifier::ProcurementNotice;

impl<S, B> ProcurementEngine<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Finalize one validated grouped order. On an already ordered grouped
    /// order this returns the existing supplier order.
    pub fn finalize(&self, grouped_order_id: GroupedOrderId) -> EngineResult<SupplierOrderId> {
        let supplier_id = self.grouped_order_supplier(grouped_order_id)?;
        self.supplier_locks
            .run(&supplier_id, || self.finalize_locked(grouped_order_id))
    }

    /// Finalize every grouped order still sitting in `Validated`.
    pub fn finalize_validated(
        &self,
    ) -> EngineResult<Vec<(GroupedOrderId, EngineResult<SupplierOrderId>)>> {
        let validated = self.grouped_orders_with_status(GroupedOrderStatus::Validated)?;
        Ok(validated
            .into_iter()
            .map(|order| {
                let grouped_order_id = order.id_typed();
                (grouped_order_id, self.finalize(grouped_order_id))
            })
            .collect())
    }

    /// Runs under the supplier's lock.
    pub(super) fn finalize_locked(
        &self,
        grouped_order_id: GroupedOrderId,
    ) -> EngineResult<SupplierOrderId> {
        let order = self.load_grouped_order(grouped_order_id)?;
        match order.status() {
            GroupedOrderStatus::Validated => {}
            GroupedOrderStatus::Ordered => {
                debug!(%grouped_order_id, "grouped order already ordered");
                return order.supplier_order_id().ok_or_else(|| {
                    EngineError::not_found(format!(
                        "supplier order of grouped order {grouped_order_id}"
                    ))
                });
            }
            other => {
                return Err(EngineError::InvalidTransition {
                    entity: "grouped order",
                    from: format!("{other:?}"),
                    to: format!("{:?}", GroupedOrderStatus::Ordered),
                });
            }
        }

        let candidate = SupplierOrderId::generate();
        let reserved = self.run_grouped_order(grouped_order_id, |order| {
            if order.supplier_order_id().is_some() {
                return Ok(None);
            }
            Ok(Some(GroupedOrderCommand::ReserveSupplierOrder(
                ReserveSupplierOrder {
                    grouped_order_id,
                    supplier_order_id: candidate,
                    occurred_at: now(),
                },
            )))
        })?;
        let order = reserved.aggregate;
        let supplier_id = order.supplier_id().ok_or_else(|| {
            EngineError::not_found(format!("supplier of grouped order {grouped_order_id}"))
        })?;
        let supplier_order_id = order.supplier_order_id().ok_or_else(|| {
            EngineError::rejected("supplier order reservation was not recorded")
        })?;

        let items = consolidate(order.active_allocations())?;
        let placed = self.run_supplier_order(supplier_order_id, |supplier_order| {
            if supplier_order.exists() {
                return Ok(None);
            }
            Ok(Some(SupplierOrderCommand::Place(PlaceSupplierOrder {
                supplier_order_id,
                grouped_order_id,
                supplier_id,
                items: items.clone(),
                occurred_at: now(),
            })))
        })?;
        let supplier_order = placed.aggregate;
        if placed.events.is_empty() {
            debug!(%grouped_order_id, %supplier_order_id, "supplier order already placed, reusing it");
        } else {
            info!(
                %grouped_order_id,
                %supplier_order_id,
                %supplier_id,
                items = supplier_order.items().len(),
                total = supplier_order.total_amount().cents(),
                "supplier order placed"
            );
        }

        let links: Vec<AllocationLink> = supplier_order
            .items()
            .iter()
            .flat_map(|item| {
                item.allocation_ids.iter().map(move |&allocation_id| AllocationLink {
                    allocation_id,
                    supplier_order_line: item.line_no,
                })
            })
            .collect();
        self.send_grouped_order(
            grouped_order_id,
            GroupedOrderCommand::MarkOrdered(MarkOrdered {
                grouped_order_id,
                supplier_order_id,
                links,
                occurred_at: now(),
            }),
        )?;
        info!(%grouped_order_id, %supplier_order_id, "grouped order ordered");

        self.notify(ProcurementNotice::SupplierOrderReady {
            supplier_order_id,
            grouped_order_id,
            supplier_id,
            order_number: supplier_order.order_number().to_string(),
            total_amount: supplier_order.total_amount(),
            items: supplier_order.items().to_vec(),
        });

        Ok(supplier_order_id)
    }
}
