//! Grouped-Order Ledger operations driven from outside the allocation path:
//! manual validation, cancellation, allocation removal and resizing, and
//! threshold alerts.
//!
//! Amount bookkeeping and the threshold crossing itself are decided inside the
//! `GroupedOrder` aggregate; this module sequences the follow-up on request
//! lines and the notifier.

use serde_json::Value as JsonValue;
use tracing::{error, info, warn};

use procura_core::Money;
use procura_events::{EventBus, EventEnvelope};
use procura_purchasing::{
    AcknowledgeThresholdAlert, AllocationId, CancelAllocation, CancelGroupedOrder, GroupedOrder,
    GroupedOrderCommand, GroupedOrderEvent, GroupedOrderId, GroupedOrderStatus, Validate,
};
use procura_requests::{MaterialRequestCommand, MaterialRequestId, ReleaseAllocation};

use super::{LineAllocation, ProcurementEngine, now};
use crate::error::{EngineError, EngineResult};
use crate::event_store::EventStore;
use crate::notifier::ProcurementNotice;

impl<S, B> ProcurementEngine<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// `Open | ThresholdReached → Validated`, recording who validated.
    ///
    /// Validating below the supplier's threshold is allowed but flagged,
    /// logged and notified. Validation does not finalize; call
    /// [`Self::finalize`] for that.
    pub fn validate_grouped_order(
        &self,
        grouped_order_id: GroupedOrderId,
        validated_by: impl Into<String>,
        notes: Option<String>,
    ) -> EngineResult<GroupedOrder> {
        let validated_by = validated_by.into();
        let supplier_id = self.grouped_order_supplier(grouped_order_id)?;
        let threshold = self
            .suppliers
            .supplier(supplier_id)
            .and_then(|s| s.threshold());

        self.supplier_locks.run(&supplier_id, || {
            let committed = self.send_grouped_order(
                grouped_order_id,
                GroupedOrderCommand::Validate(Validate {
                    grouped_order_id,
                    validated_by: validated_by.clone(),
                    notes: notes.clone(),
                    threshold,
                    occurred_at: now(),
                }),
            )?;
            let order = committed.aggregate;
            let amount = order.current_amount();

            match threshold.filter(|_| order.validation().is_some_and(|v| v.below_threshold)) {
                Some(threshold) => {
                    warn!(
                        %grouped_order_id,
                        %supplier_id,
                        amount = amount.cents(),
                        threshold = threshold.cents(),
                        %validated_by,
                        "grouped order validated below the free-shipping threshold"
                    );
                    self.notify(ProcurementNotice::ValidatedBelowThreshold {
                        grouped_order_id,
                        supplier_id,
                        amount,
                        threshold,
                        validated_by: validated_by.clone(),
                    });
                }
                None => {
                    info!(%grouped_order_id, %supplier_id, amount = amount.cents(), %validated_by, "grouped order validated");
                }
            }
            Ok(order)
        })
    }

    /// Cancel a grouped order that is still open. Every active allocation is
    /// cancelled and its quantity released on the request line, making the
    /// line eligible for allocation again.
    ///
    /// Cancelling an already cancelled order repeats the releases, which
    /// completes a cancellation that stopped half-way and changes nothing
    /// otherwise.
    pub fn cancel_grouped_order(
        &self,
        grouped_order_id: GroupedOrderId,
        reason: Option<String>,
    ) -> EngineResult<GroupedOrder> {
        let supplier_id = self.grouped_order_supplier(grouped_order_id)?;

        self.supplier_locks.run(&supplier_id, || {
            let committed = self.run_grouped_order(grouped_order_id, |order| {
                if order.status() == GroupedOrderStatus::Cancelled {
                    return Ok(None);
                }
                Ok(Some(GroupedOrderCommand::Cancel(CancelGroupedOrder {
                    grouped_order_id,
                    reason: reason.clone(),
                    occurred_at: now(),
                })))
            })?;
            let resumed = committed.events.is_empty();
            let order = committed.aggregate;

            let mut first_failure = None;
            for allocation in order.allocations() {
                if let Err(err) =
                    self.release_on_request(allocation.request_id, allocation.line_no, allocation.id)
                {
                    error!(
                        %grouped_order_id,
                        allocation_id = %allocation.id,
                        request_id = %allocation.request_id,
                        line_no = allocation.line_no,
                        error = %err,
                        "failed to release cancelled allocation on its request line"
                    );
                    first_failure.get_or_insert(err);
                }
            }

            if resumed {
                info!(%grouped_order_id, %supplier_id, "grouped order already cancelled, releases repeated");
            } else {
                info!(%grouped_order_id, %supplier_id, allocations = order.allocations().len(), "grouped order cancelled");
            }
            match first_failure {
                Some(err) => Err(err),
                None => Ok(order),
            }
        })
    }

    /// Take one allocation out of an open grouped order and release its
    /// quantity on the request line. Removing a cancelled allocation only
    /// repeats the release.
    pub fn remove_allocation(
        &self,
        grouped_order_id: GroupedOrderId,
        allocation_id: AllocationId,
    ) -> EngineResult<GroupedOrder> {
        let supplier_id = self.grouped_order_supplier(grouped_order_id)?;

        self.supplier_locks.run(&supplier_id, || {
            let committed = self.send_grouped_order(
                grouped_order_id,
                GroupedOrderCommand::CancelAllocation(CancelAllocation {
                    grouped_order_id,
                    allocation_id,
                    occurred_at: now(),
                }),
            )?;
            let order = committed.aggregate;
            let allocation = order
                .allocation(allocation_id)
                .ok_or_else(|| EngineError::not_found(format!("allocation {allocation_id}")))?;

            self.release_on_request(allocation.request_id, allocation.line_no, allocation_id)?;
            for event in &committed.events {
                if let GroupedOrderEvent::AllocationCancelled(cancelled) = event {
                    info!(
                        %grouped_order_id,
                        %allocation_id,
                        request_id = %cancelled.request_id,
                        line_no = cancelled.line_no,
                        amount = cancelled.amount_after.cents(),
                        "allocation removed from grouped order"
                    );
                }
            }
            Ok(order)
        })
    }

    /// Resize an allocation of an open grouped order; the request line's
    /// reservation follows. Growing can cross the threshold exactly like a new
    /// allocation (alert, auto-validation, finalization).
    pub fn change_allocation_quantity(
        &self,
        grouped_order_id: GroupedOrderId,
        allocation_id: AllocationId,
        quantity: u32,
    ) -> EngineResult<LineAllocation> {
        let supplier_id = self.grouped_order_supplier(grouped_order_id)?;
        let supplier = self
            .suppliers
            .supplier(supplier_id)
            .ok_or_else(|| EngineError::not_found(format!("supplier {supplier_id}")))?;

        self.supplier_locks.run(&supplier_id, || {
            let order = self.load_grouped_order(grouped_order_id)?;
            let allocation = order
                .allocation(allocation_id)
                .filter(|a| a.is_active())
                .ok_or_else(|| EngineError::not_found(format!("allocation {allocation_id}")))?;
            if !order.status().accepts_allocations() {
                return Err(EngineError::rejected(format!(
                    "grouped order {grouped_order_id} is {:?}; its allocations are frozen",
                    order.status()
                )));
            }
            let (request_id, line_no) = (allocation.request_id, allocation.line_no);
            let previous = allocation.allocated_quantity;

            // The request line is charged before growing and relieved after
            // shrinking, so it never holds less than the grouped order.
            let resized = if quantity > previous {
                self.record_holding(request_id, line_no, allocation_id, quantity)?;
                match self.top_up_allocation(grouped_order_id, allocation_id, quantity, &supplier) {
                    Ok(Some(committed)) => committed,
                    outcome => {
                        if let Err(undo_err) =
                            self.record_holding(request_id, line_no, allocation_id, previous)
                        {
                            error!(%request_id, line_no, %allocation_id, error = %undo_err, "failed to undo reservation");
                        }
                        return Err(outcome.err().unwrap_or_else(|| {
                            EngineError::rejected(format!(
                                "grouped order {grouped_order_id} stopped accepting allocations"
                            ))
                        }));
                    }
                }
            } else {
                let committed = self
                    .top_up_allocation(grouped_order_id, allocation_id, quantity, &supplier)?
                    .ok_or_else(|| {
                        EngineError::rejected(format!(
                            "grouped order {grouped_order_id} stopped accepting allocations"
                        ))
                    })?;
                self.record_holding(request_id, line_no, allocation_id, quantity)?;
                committed
            };

            if !resized.events.is_empty() {
                info!(%grouped_order_id, %allocation_id, %request_id, line_no, previous, quantity, "allocation resized");
            }
            Ok(self.after_allocation(&supplier, allocation_id, quantity, resized))
        })
    }

    /// Record that the notifier accepted the threshold alert.
    pub fn acknowledge_threshold_alert(
        &self,
        grouped_order_id: GroupedOrderId,
    ) -> EngineResult<GroupedOrder> {
        let committed = self.send_grouped_order(
            grouped_order_id,
            GroupedOrderCommand::AcknowledgeThresholdAlert(AcknowledgeThresholdAlert {
                grouped_order_id,
                occurred_at: now(),
            }),
        )?;
        Ok(committed.aggregate)
    }

    /// Re-send threshold alerts the notifier has not accepted yet.
    /// Returns how many were acknowledged.
    pub fn resend_pending_threshold_alerts(&self) -> EngineResult<usize> {
        let mut acknowledged = 0;
        for order in self.grouped_orders()? {
            if !order.threshold_alert_pending() {
                continue;
            }
            let Some(supplier_id) = order.supplier_id() else {
                continue;
            };
            let Some(threshold) = self
                .suppliers
                .supplier(supplier_id)
                .and_then(|s| s.threshold())
            else {
                warn!(grouped_order_id = %order.id_typed(), %supplier_id, "supplier no longer has a threshold, alert left pending");
                continue;
            };
            if self.send_threshold_alert(&order, order.current_amount(), threshold) {
                acknowledged += 1;
            }
        }
        Ok(acknowledged)
    }

    /// Amount still missing before the supplier's threshold; `None` without one.
    pub fn remaining_to_threshold(
        &self,
        grouped_order_id: GroupedOrderId,
    ) -> EngineResult<Option<Money>> {
        let order = self.load_grouped_order(grouped_order_id)?;
        let threshold = order
            .supplier_id()
            .and_then(|id| self.suppliers.supplier(id))
            .and_then(|s| s.threshold());
        Ok(order.remaining_to_threshold(threshold))
    }

    /// Notify a threshold crossing and acknowledge it once accepted.
    pub(super) fn send_threshold_alert(
        &self,
        order: &GroupedOrder,
        amount: Money,
        threshold: Money,
    ) -> bool {
        let grouped_order_id = order.id_typed();
        let Some(supplier_id) = order.supplier_id() else {
            return false;
        };

        let accepted = self.notify(ProcurementNotice::ThresholdReached {
            grouped_order_id,
            supplier_id,
            order_number: order.order_number().to_string(),
            amount,
            threshold,
        });
        if !accepted {
            return false;
        }

        match self.acknowledge_threshold_alert(grouped_order_id) {
            Ok(_) => true,
            Err(err) => {
                error!(%grouped_order_id, error = %err, "threshold alert sent but not acknowledged");
                false
            }
        }
    }

    /// Release allocations of a request (or one of its lines) that still sit
    /// in open grouped orders. Allocations in validated or ordered grouped
    /// orders block the release; nothing is released in that case.
    pub(super) fn release_open_allocations(
        &self,
        request_id: MaterialRequestId,
        line_no: Option<u32>,
    ) -> EngineResult<usize> {
        let held: Vec<_> = self
            .allocations_for_request(request_id)?
            .into_iter()
            .filter(|view| view.allocation.is_active())
            .filter(|view| line_no.is_none_or(|n| view.allocation.line_no == n))
            .collect();

        if let Some(frozen) = held
            .iter()
            .find(|view| !view.grouped_order_status.accepts_allocations())
        {
            return Err(EngineError::rejected(format!(
                "line {} is held by grouped order {} which is {:?}",
                frozen.allocation.line_no,
                frozen.grouped_order_id,
                frozen.grouped_order_status
            )));
        }

        for view in &held {
            self.remove_allocation(view.grouped_order_id, view.allocation.id)?;
        }
        Ok(held.len())
    }

    /// Give back what `allocation_id` still holds undelivered on a request line.
    pub(super) fn release_on_request(
        &self,
        request_id: MaterialRequestId,
        line_no: u32,
        allocation_id: AllocationId,
    ) -> EngineResult<()> {
        self.send_request(
            request_id,
            MaterialRequestCommand::ReleaseAllocation(ReleaseAllocation {
                request_id,
                line_no,
                allocation_id: allocation_id.aggregate_id(),
                occurred_at: now(),
            }),
        )?;
        Ok(())
    }
}
