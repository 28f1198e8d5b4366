//! Allocation Engine: places approved request lines into per-supplier grouped orders.
//!
//! For one line:
//!
//! 1. resolve the supplier (catalog lookup or the manually assigned supplier),
//!    outside any lock;
//! 2. under the supplier's lock, pick the supplier's open grouped order
//!    (opening one if none exists), reserve the pending quantity on the request
//!    line for the allocation, then add the allocation to the grouped order. A
//!    line that already has an active allocation in that order tops it up
//!    instead of adding a second one;
//! 3. act on what the grouped order decided: notify a threshold crossing,
//!    finalize synchronously after an auto-validation.
//!
//! The reservation in step 2 is what makes a re-run a no-op: once the line has
//! nothing pending there is nothing to allocate. If the grouped order refuses
//! the allocation, the reservation is undone again.

use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};

use procura_core::{DomainError, DomainResult, Money};
use procura_events::{EventBus, EventEnvelope};
use procura_purchasing::{
    AddAllocation, AllocationId, ChangeAllocationQuantity, GroupedOrder, GroupedOrderCommand,
    GroupedOrderEvent, GroupedOrderId, GroupedOrderStatus, ItemKey, OpenGroupedOrder,
    SupplierOrderId,
};
use procura_requests::{
    LineReference, MarkLineUnresolvable, MaterialRequest, MaterialRequestCommand,
    MaterialRequestId, RecordAllocation, RequestLine, RequestStatus,
};
use procura_suppliers::{Supplier, SupplierId};

use super::{ProcurementEngine, now};
use crate::catalog::CatalogError;
use crate::command_dispatcher::Committed;
use crate::error::{EngineError, EngineResult};
use crate::event_store::EventStore;
use crate::notifier::ProcurementNotice;

/// Outcome of allocating one request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineAllocation {
    /// Nothing was pending; no state changed.
    AlreadyAllocated,
    Allocated {
        allocation_id: AllocationId,
        grouped_order_id: GroupedOrderId,
        supplier_id: SupplierId,
        /// Quantity the allocation holds after this call.
        quantity: u32,
        /// Grouped-order amount right after the allocation.
        amount_after: Money,
        /// Grouped-order status once this call returns.
        status: GroupedOrderStatus,
        /// Set when the allocation triggered auto-validation and finalization succeeded.
        supplier_order_id: Option<SupplierOrderId>,
    },
}

#[derive(Debug)]
pub struct LineReport {
    pub line_no: u32,
    pub outcome: EngineResult<LineAllocation>,
}

/// Per-line outcomes of one allocation pass over a request.
#[derive(Debug)]
pub struct AllocationReport {
    pub request_id: MaterialRequestId,
    pub lines: Vec<LineReport>,
}

impl AllocationReport {
    pub fn allocated(&self) -> impl Iterator<Item = &LineAllocation> {
        self.lines
            .iter()
            .filter_map(|l| l.outcome.as_ref().ok())
            .filter(|o| matches!(o, LineAllocation::Allocated { .. }))
    }

    pub fn failures(&self) -> impl Iterator<Item = (u32, &EngineError)> {
        self.lines
            .iter()
            .filter_map(|l| l.outcome.as_ref().err().map(|e| (l.line_no, e)))
    }

    pub fn is_complete(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Where a line goes and at what price.
#[derive(Debug, Clone)]
struct Resolution {
    supplier: Supplier,
    item_key: ItemKey,
    designation: String,
    unit_price: Money,
}

/// The line to allocate, or `None` when nothing is pending.
fn allocatable_line(request: &MaterialRequest, line_no: u32) -> DomainResult<Option<&RequestLine>> {
    if request.status() != RequestStatus::Approved {
        return Err(DomainError::invariant(format!(
            "only approved requests are allocated (request is {:?})",
            request.status()
        )));
    }
    let line = request
        .line(line_no)
        .ok_or_else(|| DomainError::validation(format!("request has no line {line_no}")))?;
    if line.cancelled {
        return Err(DomainError::invariant(format!("line {line_no} is cancelled")));
    }
    if line.quantity_pending() == 0 {
        return Ok(None);
    }
    Ok(Some(line))
}

impl<S, B> ProcurementEngine<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Allocate the pending quantity of one approved request line.
    ///
    /// Resolution failures mark the line unresolvable (and notify) before the
    /// error is returned. Re-running on a fully allocated line is a no-op.
    pub fn allocate_line(
        &self,
        request_id: MaterialRequestId,
        line_no: u32,
    ) -> EngineResult<LineAllocation> {
        let request = self.load_request(request_id)?;
        let Some(line) = allocatable_line(&request, line_no)? else {
            debug!(%request_id, line_no, "line already fully allocated");
            return Ok(LineAllocation::AlreadyAllocated);
        };

        let resolution = match self.resolve_line(request_id, line) {
            Ok(resolution) => resolution,
            Err(err) if err.is_resolution_failure() => {
                self.mark_unresolvable(request_id, line_no, &err)?;
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let supplier_id = resolution.supplier.id;
        self.supplier_locks.run(&supplier_id, || {
            self.allocate_locked(request_id, line_no, &resolution)
        })
    }

    /// Allocate every line of an approved request that still has quantity pending.
    ///
    /// One line failing does not stop the others.
    pub fn allocate_request(&self, request_id: MaterialRequestId) -> EngineResult<AllocationReport> {
        let request = self.load_request(request_id)?;
        if request.status() != RequestStatus::Approved {
            return Err(EngineError::rejected(format!(
                "only approved requests are allocated (request {request_id} is {:?})",
                request.status()
            )));
        }

        let line_numbers: Vec<u32> = request.unallocated_lines().map(|l| l.line_no).collect();
        let lines = line_numbers
            .into_iter()
            .map(|line_no| LineReport {
                line_no,
                outcome: self.allocate_line(request_id, line_no),
            })
            .collect();

        Ok(AllocationReport { request_id, lines })
    }

    /// Allocation pass over every approved request.
    ///
    /// Lines already marked unresolvable are skipped until a supplier is
    /// assigned or they are retried through [`Self::allocate_line`].
    pub fn allocate_pending(&self) -> EngineResult<Vec<AllocationReport>> {
        let mut reports: Vec<AllocationReport> = Vec::new();

        for pending in self.unallocated_approved_lines()? {
            if pending.line.unresolvable.is_some() {
                continue;
            }
            let report = LineReport {
                line_no: pending.line.line_no,
                outcome: self.allocate_line(pending.request_id, pending.line.line_no),
            };
            match reports.last_mut() {
                Some(last) if last.request_id == pending.request_id => last.lines.push(report),
                _ => reports.push(AllocationReport {
                    request_id: pending.request_id,
                    lines: vec![report],
                }),
            }
        }

        Ok(reports)
    }

    fn resolve_line(
        &self,
        request_id: MaterialRequestId,
        line: &RequestLine,
    ) -> EngineResult<Resolution> {
        let unresolved = |reason: &str| EngineError::SupplierUnresolved {
            request_id,
            line_no: line.line_no,
            reason: reason.to_string(),
        };

        match &line.reference {
            LineReference::Catalog { item_id } => {
                let entry = self
                    .config
                    .catalog_retry
                    .run(
                        |attempt| {
                            self.catalog.resolve(*item_id).inspect_err(|err| {
                                if err.is_transient() {
                                    debug!(%item_id, attempt, error = %err, "catalog lookup failed");
                                }
                            })
                        },
                        CatalogError::is_transient,
                    )
                    .map_err(|(err, attempts)| match err {
                        CatalogError::NotFound(id) => EngineError::CatalogItemNotFound(id),
                        CatalogError::Transient(reason) => {
                            EngineError::CatalogUnavailable { attempts, reason }
                        }
                    })?;

                if !entry.available {
                    return Err(EngineError::CatalogItemUnavailable(*item_id));
                }
                let supplier = self
                    .active_supplier(entry.supplier_id)
                    .ok_or_else(|| unresolved("catalog supplier is unknown or inactive"))?;

                Ok(Resolution {
                    supplier,
                    item_key: ItemKey::Catalog(*item_id),
                    designation: entry.designation,
                    unit_price: entry.unit_price,
                })
            }
            LineReference::FreeText(item) => {
                let supplier_id = line
                    .supplier_id
                    .ok_or_else(|| unresolved("no supplier assigned"))?;
                let supplier = self
                    .active_supplier(supplier_id)
                    .ok_or_else(|| unresolved("assigned supplier is unknown or inactive"))?;

                Ok(Resolution {
                    supplier,
                    item_key: ItemKey::for_reference(&line.reference),
                    designation: item.label(),
                    unit_price: item.estimated_price.unwrap_or(Money::ZERO),
                })
            }
        }
    }

    fn active_supplier(&self, supplier_id: SupplierId) -> Option<Supplier> {
        self.suppliers.supplier(supplier_id).filter(|s| s.active)
    }

    fn mark_unresolvable(
        &self,
        request_id: MaterialRequestId,
        line_no: u32,
        cause: &EngineError,
    ) -> EngineResult<()> {
        let reason = cause.to_string();
        warn!(%request_id, line_no, %reason, "request line is unresolvable");

        let committed = self.send_request(
            request_id,
            MaterialRequestCommand::MarkLineUnresolvable(MarkLineUnresolvable {
                request_id,
                line_no,
                reason: reason.clone(),
                occurred_at: now(),
            }),
        )?;
        if !committed.events.is_empty() {
            self.notify(ProcurementNotice::LineUnresolvable {
                request_id,
                line_no,
                reason,
            });
        }
        Ok(())
    }

    /// Runs under the supplier's lock.
    fn allocate_locked(
        &self,
        request_id: MaterialRequestId,
        line_no: u32,
        resolution: &Resolution,
    ) -> EngineResult<LineAllocation> {
        let supplier = &resolution.supplier;
        let attempts = self.config.dispatch_retry.max_attempts;

        for _ in 0..attempts {
            let target = match self.open_grouped_order(supplier.id)? {
                Some(order) => order,
                None => self.open_new_grouped_order(supplier)?,
            };
            let grouped_order_id = target.id_typed();
            let existing = target
                .active_allocation_for_line(request_id, line_no)
                .map(|a| a.id);
            let allocation_id = existing.unwrap_or_else(AllocationId::generate);

            let Some((previous, quantity)) =
                self.reserve_line(request_id, line_no, supplier.id, allocation_id)?
            else {
                return Ok(LineAllocation::AlreadyAllocated);
            };

            let joined = match existing {
                Some(_) => self.top_up_allocation(grouped_order_id, allocation_id, quantity, supplier),
                None => self.add_allocation(
                    grouped_order_id,
                    allocation_id,
                    request_id,
                    line_no,
                    quantity,
                    resolution,
                ),
            };
            match joined {
                Ok(Some(committed)) => {
                    info!(
                        %grouped_order_id,
                        supplier_id = %supplier.id,
                        %request_id,
                        line_no,
                        quantity,
                        topped_up = existing.is_some(),
                        amount = committed.aggregate.current_amount().cents(),
                        "allocation recorded in grouped order"
                    );
                    return Ok(self.after_allocation(supplier, allocation_id, quantity, committed));
                }
                Ok(None) => {
                    debug!(%grouped_order_id, supplier_id = %supplier.id, "grouped order stopped accepting allocations, looking again");
                    self.undo_reservation(request_id, line_no, allocation_id, previous)?;
                    self.catch_up_grouped_order(grouped_order_id.aggregate_id())?;
                }
                Err(err) => {
                    warn!(%request_id, line_no, supplier_id = %supplier.id, error = %err, "allocation refused, undoing reservation");
                    if let Err(undo_err) =
                        self.undo_reservation(request_id, line_no, allocation_id, previous)
                    {
                        error!(%request_id, line_no, %allocation_id, error = %undo_err, "failed to undo reservation");
                    }
                    return Err(err);
                }
            }
        }

        error!(supplier_id = %supplier.id, %request_id, line_no, attempts, "no accepting grouped order found");
        Err(EngineError::AllocationContention { attempts })
    }

    /// Reserve the line's pending quantity on top of what `allocation_id`
    /// already holds. Returns the holding before and after, or `None` when
    /// nothing is pending.
    fn reserve_line(
        &self,
        request_id: MaterialRequestId,
        line_no: u32,
        supplier_id: SupplierId,
        allocation_id: AllocationId,
    ) -> EngineResult<Option<(u32, u32)>> {
        let occurred_at = now();
        let mut holding = (0, 0);
        let reserved = self.run_request(request_id, |request| {
            let Some(line) = allocatable_line(request, line_no)? else {
                return Ok(None);
            };
            if line.reference.is_free_text() && line.supplier_id != Some(supplier_id) {
                return Err(DomainError::conflict(
                    "line supplier changed while allocating",
                ));
            }
            let previous = line.holding(allocation_id.aggregate_id()).allocated;
            let quantity = previous.saturating_add(line.quantity_pending());
            holding = (previous, quantity);
            Ok(Some(MaterialRequestCommand::RecordAllocation(
                RecordAllocation {
                    request_id,
                    line_no,
                    allocation_id: allocation_id.aggregate_id(),
                    quantity,
                    occurred_at,
                },
            )))
        })?;
        Ok((!reserved.events.is_empty()).then_some(holding))
    }

    /// Put the request line's holding for `allocation_id` back to `previous`.
    fn undo_reservation(
        &self,
        request_id: MaterialRequestId,
        line_no: u32,
        allocation_id: AllocationId,
        previous: u32,
    ) -> EngineResult<()> {
        if previous == 0 {
            return self.release_on_request(request_id, line_no, allocation_id);
        }
        self.record_holding(request_id, line_no, allocation_id, previous)
    }

    /// Set what `allocation_id` holds on a request line.
    pub(super) fn record_holding(
        &self,
        request_id: MaterialRequestId,
        line_no: u32,
        allocation_id: AllocationId,
        quantity: u32,
    ) -> EngineResult<()> {
        self.send_request(
            request_id,
            MaterialRequestCommand::RecordAllocation(RecordAllocation {
                request_id,
                line_no,
                allocation_id: allocation_id.aggregate_id(),
                quantity,
                occurred_at: now(),
            }),
        )?;
        Ok(())
    }

    /// `None` when the order no longer accepts allocations.
    fn add_allocation(
        &self,
        grouped_order_id: GroupedOrderId,
        allocation_id: AllocationId,
        request_id: MaterialRequestId,
        line_no: u32,
        quantity: u32,
        resolution: &Resolution,
    ) -> EngineResult<Option<Committed<GroupedOrder>>> {
        let supplier = &resolution.supplier;
        let occurred_at = now();
        let committed = self.run_grouped_order(grouped_order_id, |order| {
            if !order.status().accepts_allocations() {
                return Ok(None);
            }
            Ok(Some(GroupedOrderCommand::AddAllocation(AddAllocation {
                grouped_order_id,
                allocation_id,
                request_id,
                line_no,
                item_key: resolution.item_key.clone(),
                designation: resolution.designation.clone(),
                quantity,
                estimated_price: resolution.unit_price,
                threshold: supplier.threshold(),
                system_validator: self.config.system_validator.clone(),
                occurred_at,
            })))
        })?;
        Ok((!committed.events.is_empty()).then_some(committed))
    }

    /// Resize an allocation already in the order; `None` when the order no
    /// longer accepts allocations.
    pub(super) fn top_up_allocation(
        &self,
        grouped_order_id: GroupedOrderId,
        allocation_id: AllocationId,
        quantity: u32,
        supplier: &Supplier,
    ) -> EngineResult<Option<Committed<GroupedOrder>>> {
        let occurred_at = now();
        let mut accepting = true;
        let committed = self.run_grouped_order(grouped_order_id, |order| {
            accepting = order.status().accepts_allocations();
            if !accepting {
                return Ok(None);
            }
            Ok(Some(GroupedOrderCommand::ChangeAllocationQuantity(
                ChangeAllocationQuantity {
                    grouped_order_id,
                    allocation_id,
                    quantity,
                    threshold: supplier.threshold(),
                    system_validator: self.config.system_validator.clone(),
                    occurred_at,
                },
            )))
        })?;
        Ok(accepting.then_some(committed))
    }

    fn open_new_grouped_order(&self, supplier: &Supplier) -> EngineResult<GroupedOrder> {
        let grouped_order_id = GroupedOrderId::generate();
        let committed = self.send_grouped_order(
            grouped_order_id,
            GroupedOrderCommand::OpenGroupedOrder(OpenGroupedOrder {
                grouped_order_id,
                supplier_id: supplier.id,
                auto_validate_on_threshold: supplier.auto_validate_on_threshold,
                occurred_at: now(),
            }),
        )?;
        info!(%grouped_order_id, supplier_id = %supplier.id, "grouped order opened");
        Ok(committed.aggregate)
    }

    /// Follow-up on the events the allocation batch decided.
    pub(super) fn after_allocation(
        &self,
        supplier: &Supplier,
        allocation_id: AllocationId,
        quantity: u32,
        committed: Committed<GroupedOrder>,
    ) -> LineAllocation {
        let order = committed.aggregate;
        let grouped_order_id = order.id_typed();
        let amount_after = order.current_amount();
        let mut status = order.status();
        let mut supplier_order_id = None;

        for event in &committed.events {
            match event {
                GroupedOrderEvent::ThresholdReached(reached) => {
                    info!(
                        %grouped_order_id,
                        supplier_id = %supplier.id,
                        amount = reached.amount.cents(),
                        threshold = reached.threshold.cents(),
                        "free-shipping threshold reached"
                    );
                    self.send_threshold_alert(&order, reached.amount, reached.threshold);
                }
                GroupedOrderEvent::GroupedOrderValidated(validated) if validated.automatic => {
                    info!(%grouped_order_id, supplier_id = %supplier.id, validated_by = %validated.validated_by, "grouped order auto-validated");
                    match self.finalize_locked(grouped_order_id) {
                        Ok(id) => {
                            supplier_order_id = Some(id);
                            status = GroupedOrderStatus::Ordered;
                        }
                        Err(err) => {
                            warn!(%grouped_order_id, error = %err, "finalization failed, grouped order stays validated");
                        }
                    }
                }
                _ => {}
            }
        }

        LineAllocation::Allocated {
            allocation_id,
            grouped_order_id,
            supplier_id: supplier.id,
            quantity,
            amount_after,
            status,
            supplier_order_id,
        }
    }
}
