//! Delivery Tracker: records receipts and fans them out to allocations and
//! request lines, oldest allocation first.
//!
//! Every step carries cumulative totals: the supplier-order line's received
//! total goes to the grouped order, and each allocation's delivered total goes
//! to its request line. A step that is repeated after an interruption finds
//! the total already accounted for and does nothing, so
//! [`ProcurementEngine::reconcile_deliveries`] can finish any receipt that
//! stopped half-way.

use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{error, info, warn};

use procura_core::Money;
use procura_events::{EventBus, EventEnvelope};
use procura_purchasing::{
    AllocationId, DistributeDelivery, GroupedOrderCommand, GroupedOrderEvent, GroupedOrderId,
    ReceiveItem, SupplierOrderCommand, SupplierOrderId,
};
use procura_requests::{MaterialRequestCommand, MaterialRequestId, RecordDelivery};

use super::{ProcurementEngine, now};
use crate::error::{EngineError, EngineResult};
use crate::event_store::EventStore;
use crate::notifier::ProcurementNotice;

/// Part of a receipt credited to one allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveredShare {
    pub allocation_id: AllocationId,
    pub request_id: MaterialRequestId,
    pub line_no: u32,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub supplier_order_id: SupplierOrderId,
    pub line_no: u32,
    /// Units accounted for by this call: the receipt itself, plus anything an
    /// interrupted earlier receipt left unaccounted.
    pub received: u32,
    /// In FIFO order.
    pub shares: Vec<DeliveredShare>,
    /// Received beyond what the allocations could absorb.
    pub over_delivered: u32,
}

impl DeliveryReport {
    pub fn distributed(&self) -> u32 {
        self.shares
            .iter()
            .fold(0u32, |sum, s| sum.saturating_add(s.quantity))
    }
}

impl<S, B> ProcurementEngine<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Record `quantity` units received against one supplier-order line.
    ///
    /// The quantity is spread over the allocations feeding the line, oldest
    /// first, each capped at its allocated quantity. Anything left over is
    /// reported as over-delivery (logged and notified), never dropped.
    pub fn receive_delivery(
        &self,
        supplier_order_id: SupplierOrderId,
        line_no: u32,
        quantity: u32,
        actual_price: Option<Money>,
    ) -> EngineResult<DeliveryReport> {
        if quantity == 0 {
            return Err(EngineError::Validation(
                "received quantity must be positive".to_string(),
            ));
        }
        if actual_price.is_some_and(|p| p.cents() < 0) {
            return Err(EngineError::Validation(
                "actual price cannot be negative".to_string(),
            ));
        }

        self.delivery_locks.run(&(supplier_order_id, line_no), || {
            self.receive_locked(supplier_order_id, line_no, quantity, actual_price)
        })
    }

    /// Finish the fan-out of every line of a supplier order.
    ///
    /// Receipts already recorded on the supplier order but not yet spread over
    /// allocations, or spread but not yet recorded on request lines, are
    /// carried through. Lines with nothing outstanding yield an empty report.
    pub fn reconcile_deliveries(
        &self,
        supplier_order_id: SupplierOrderId,
    ) -> EngineResult<Vec<DeliveryReport>> {
        let supplier_order = self.load_supplier_order(supplier_order_id)?;
        let grouped_order_id = supplier_order.grouped_order_id().ok_or_else(|| {
            EngineError::not_found(format!("grouped order of supplier order {supplier_order_id}"))
        })?;

        let mut reports = Vec::with_capacity(supplier_order.items().len());
        for item in supplier_order.items() {
            let line_no = item.line_no;
            let report = self.delivery_locks.run(&(supplier_order_id, line_no), || {
                // Re-read under the lock: a receipt may have landed meanwhile.
                let received_total = self
                    .load_supplier_order(supplier_order_id)?
                    .item(line_no)
                    .map_or(0, |i| i.quantity_received);
                self.settle_line(supplier_order_id, grouped_order_id, line_no, received_total, None)
            })?;
            if report.received > 0 {
                info!(%supplier_order_id, line_no, accounted = report.received, "interrupted delivery reconciled");
            }
            reports.push(report);
        }
        Ok(reports)
    }

    fn receive_locked(
        &self,
        supplier_order_id: SupplierOrderId,
        line_no: u32,
        quantity: u32,
        actual_price: Option<Money>,
    ) -> EngineResult<DeliveryReport> {
        let supplier_order = self.load_supplier_order(supplier_order_id)?;
        if supplier_order.item(line_no).is_none() {
            return Err(EngineError::not_found(format!(
                "line {line_no} of supplier order {supplier_order_id}"
            )));
        }
        let grouped_order_id = supplier_order.grouped_order_id().ok_or_else(|| {
            EngineError::not_found(format!("grouped order of supplier order {supplier_order_id}"))
        })?;

        let received = self.send_supplier_order(
            supplier_order_id,
            SupplierOrderCommand::ReceiveItem(ReceiveItem {
                supplier_order_id,
                line_no,
                quantity,
                occurred_at: now(),
            }),
        )?;
        let received_total = received
            .aggregate
            .item(line_no)
            .map_or(0, |item| item.quantity_received);

        self.settle_line(
            supplier_order_id,
            grouped_order_id,
            line_no,
            received_total,
            actual_price,
        )
    }

    /// Bring the grouped order and the request lines up to `received_total`.
    fn settle_line(
        &self,
        supplier_order_id: SupplierOrderId,
        grouped_order_id: GroupedOrderId,
        line_no: u32,
        received_total: u32,
        actual_price: Option<Money>,
    ) -> EngineResult<DeliveryReport> {
        let distributed = self.send_grouped_order(
            grouped_order_id,
            GroupedOrderCommand::DistributeDelivery(DistributeDelivery {
                grouped_order_id,
                supplier_order_line: line_no,
                received_total,
                actual_price,
                occurred_at: now(),
            }),
        )?;

        let mut shares = Vec::new();
        let mut accounted = 0;
        let mut excess = 0;
        for event in &distributed.events {
            match event {
                GroupedOrderEvent::AllocationDelivered(delivered) => shares.push(DeliveredShare {
                    allocation_id: delivered.allocation_id,
                    request_id: delivered.request_id,
                    line_no: delivered.line_no,
                    quantity: delivered.quantity,
                }),
                GroupedOrderEvent::ReceiptAccounted(receipt) => {
                    accounted = receipt.distributed.saturating_add(receipt.excess);
                    excess = receipt.excess;
                }
                _ => {}
            }
        }

        // Every allocation of the line, not only this batch's shares, so that
        // totals an interrupted call never recorded are caught up as well.
        let mut first_failure = None;
        for allocation in distributed
            .aggregate
            .allocations_for_supplier_order_line(line_no)
            .into_iter()
            .filter(|a| a.delivered_quantity > 0)
        {
            let recorded = self.send_request(
                allocation.request_id,
                MaterialRequestCommand::RecordDelivery(RecordDelivery {
                    request_id: allocation.request_id,
                    line_no: allocation.line_no,
                    allocation_id: allocation.id.aggregate_id(),
                    delivered_total: allocation.delivered_quantity,
                    occurred_at: now(),
                }),
            );
            if let Err(err) = recorded {
                error!(
                    %supplier_order_id,
                    line_no,
                    allocation_id = %allocation.id,
                    request_id = %allocation.request_id,
                    request_line = allocation.line_no,
                    delivered_total = allocation.delivered_quantity,
                    error = %err,
                    "delivered quantity not recorded on request line"
                );
                first_failure.get_or_insert(err);
            }
        }
        if let Some(err) = first_failure {
            return Err(err);
        }

        let report = DeliveryReport {
            supplier_order_id,
            line_no,
            received: accounted,
            shares,
            over_delivered: excess,
        };

        if report.over_delivered > 0 {
            warn!(
                %supplier_order_id,
                line_no,
                received = report.received,
                distributed = report.distributed(),
                excess = report.over_delivered,
                "over-delivery: received more than was allocated"
            );
            self.notify(ProcurementNotice::OverDelivery {
                supplier_order_id,
                line_no,
                received: report.received,
                excess: report.over_delivered,
            });
        } else if report.received > 0 {
            info!(%supplier_order_id, line_no, received = report.received, allocations = report.shares.len(), "delivery recorded");
        }

        Ok(report)
    }
}
