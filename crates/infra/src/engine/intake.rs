//! Request Intake: drafting, submission and the approval decision.
//!
//! Approval never allocates. Allocation is a separate pass
//! ([`ProcurementEngine::allocate_request`]) so it can be re-run safely.

use serde_json::Value as JsonValue;
use tracing::info;

use procura_events::{EventBus, EventEnvelope};
use procura_requests::{
    AddLine, Approve, AssignSupplier, Cancel, CancelLine, ChangeUrgency, CreateRequest, LineSpec,
    MaterialRequest, MaterialRequestCommand, MaterialRequestEvent, MaterialRequestId, Reject,
    RemoveLine, RequestContext, Requester, SetAdminNotes, Submit, Urgency,
};
use procura_suppliers::SupplierId;

use super::{ProcurementEngine, now};
use crate::error::{EngineError, EngineResult};
use crate::event_store::EventStore;

/// A material request as the requester drafts it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRequest {
    pub requester: Requester,
    pub context: RequestContext,
    pub urgency: Urgency,
    pub description: String,
    pub project_reference: Option<String>,
    pub delivery_address: Option<String>,
    pub lines: Vec<LineSpec>,
}

impl NewRequest {
    pub fn new(requester: Requester, context: RequestContext, description: impl Into<String>) -> Self {
        Self {
            requester,
            context,
            urgency: Urgency::default(),
            description: description.into(),
            project_reference: None,
            delivery_address: None,
            lines: Vec::new(),
        }
    }

    pub fn with_line(mut self, line: LineSpec) -> Self {
        self.lines.push(line);
        self
    }

    pub fn with_urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = urgency;
        self
    }

    pub fn with_project_reference(mut self, reference: impl Into<String>) -> Self {
        self.project_reference = Some(reference.into());
        self
    }

    pub fn with_delivery_address(mut self, address: impl Into<String>) -> Self {
        self.delivery_address = Some(address.into());
        self
    }
}

impl<S, B> ProcurementEngine<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Create a draft request with its initial lines.
    ///
    /// The request and its lines are recorded together: an invalid line leaves
    /// no draft behind.
    pub fn create_request(&self, draft: NewRequest) -> EngineResult<MaterialRequestId> {
        let request_id = MaterialRequestId::generate();
        let NewRequest {
            requester,
            context,
            urgency,
            description,
            project_reference,
            delivery_address,
            lines,
        } = draft;

        self.send_request(
            request_id,
            MaterialRequestCommand::CreateRequest(CreateRequest {
                request_id,
                requester,
                context,
                urgency,
                description,
                project_reference,
                delivery_address,
                lines,
                occurred_at: now(),
            }),
        )?;

        info!(%request_id, "material request drafted");
        Ok(request_id)
    }

    /// Add a line to a draft; returns its line number.
    pub fn add_line(&self, request_id: MaterialRequestId, line: LineSpec) -> EngineResult<u32> {
        let committed = self.send_request(
            request_id,
            MaterialRequestCommand::AddLine(AddLine {
                request_id,
                line,
                occurred_at: now(),
            }),
        )?;

        committed
            .events
            .iter()
            .find_map(|event| match event {
                MaterialRequestEvent::LineAdded(added) => Some(added.line_no),
                _ => None,
            })
            .ok_or_else(|| EngineError::rejected("line was not added"))
    }

    pub fn remove_line(&self, request_id: MaterialRequestId, line_no: u32) -> EngineResult<()> {
        self.send_request(
            request_id,
            MaterialRequestCommand::RemoveLine(RemoveLine {
                request_id,
                line_no,
                occurred_at: now(),
            }),
        )?;
        Ok(())
    }

    pub fn change_urgency(
        &self,
        request_id: MaterialRequestId,
        urgency: Urgency,
    ) -> EngineResult<MaterialRequest> {
        let committed = self.send_request(
            request_id,
            MaterialRequestCommand::ChangeUrgency(ChangeUrgency {
                request_id,
                urgency,
                occurred_at: now(),
            }),
        )?;
        if !committed.events.is_empty() {
            info!(%request_id, ?urgency, "request urgency changed");
        }
        Ok(committed.aggregate)
    }

    /// Replace the purchasing notes of a request; a blank text clears them.
    pub fn set_admin_notes(
        &self,
        request_id: MaterialRequestId,
        notes: impl Into<String>,
    ) -> EngineResult<MaterialRequest> {
        let committed = self.send_request(
            request_id,
            MaterialRequestCommand::SetAdminNotes(SetAdminNotes {
                request_id,
                notes: notes.into(),
                occurred_at: now(),
            }),
        )?;
        Ok(committed.aggregate)
    }

    /// `Draft → Submitted → PendingApproval`.
    pub fn submit(&self, request_id: MaterialRequestId) -> EngineResult<MaterialRequest> {
        let committed = self.send_request(
            request_id,
            MaterialRequestCommand::Submit(Submit {
                request_id,
                occurred_at: now(),
            }),
        )?;
        info!(%request_id, "material request submitted for approval");
        Ok(committed.aggregate)
    }

    pub fn approve(
        &self,
        request_id: MaterialRequestId,
        approver: impl Into<String>,
    ) -> EngineResult<MaterialRequest> {
        let approver = approver.into();
        let committed = self.send_request(
            request_id,
            MaterialRequestCommand::Approve(Approve {
                request_id,
                approver: approver.clone(),
                occurred_at: now(),
            }),
        )?;
        info!(%request_id, %approver, "material request approved");
        Ok(committed.aggregate)
    }

    pub fn reject(
        &self,
        request_id: MaterialRequestId,
        reason: impl Into<String>,
    ) -> EngineResult<MaterialRequest> {
        let reason = reason.into();
        let committed = self.send_request(
            request_id,
            MaterialRequestCommand::Reject(Reject {
                request_id,
                reason: reason.clone(),
                occurred_at: now(),
            }),
        )?;
        info!(%request_id, %reason, "material request rejected");
        Ok(committed.aggregate)
    }

    /// Point a free-text line at a supplier (clears an unresolvable mark).
    pub fn assign_supplier(
        &self,
        request_id: MaterialRequestId,
        line_no: u32,
        supplier_id: SupplierId,
    ) -> EngineResult<MaterialRequest> {
        if self.suppliers.supplier(supplier_id).is_none() {
            return Err(EngineError::Validation(format!("unknown supplier {supplier_id}")));
        }

        let committed = self.send_request(
            request_id,
            MaterialRequestCommand::AssignSupplier(AssignSupplier {
                request_id,
                line_no,
                supplier_id,
                occurred_at: now(),
            }),
        )?;
        info!(%request_id, line_no, %supplier_id, "supplier assigned to request line");
        Ok(committed.aggregate)
    }

    /// Cancel one line. Allocations waiting in open grouped orders are released
    /// first; allocations already validated or ordered block the cancellation.
    pub fn cancel_line(
        &self,
        request_id: MaterialRequestId,
        line_no: u32,
        reason: Option<String>,
    ) -> EngineResult<MaterialRequest> {
        self.release_open_allocations(request_id, Some(line_no))?;

        let committed = self.send_request(
            request_id,
            MaterialRequestCommand::CancelLine(CancelLine {
                request_id,
                line_no,
                reason,
                occurred_at: now(),
            }),
        )?;
        info!(%request_id, line_no, "request line cancelled");
        Ok(committed.aggregate)
    }

    /// Cancel the whole request, releasing open allocations like [`Self::cancel_line`].
    pub fn cancel_request(
        &self,
        request_id: MaterialRequestId,
        reason: Option<String>,
    ) -> EngineResult<MaterialRequest> {
        self.release_open_allocations(request_id, None)?;

        let committed = self.send_request(
            request_id,
            MaterialRequestCommand::Cancel(Cancel {
                request_id,
                reason,
                occurred_at: now(),
            }),
        )?;
        info!(%request_id, "material request cancelled");
        Ok(committed.aggregate)
    }
}
