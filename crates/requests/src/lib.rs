//! Material request domain module (event-sourced).
//!
//! Request Intake: validation of request lines and the approval workflow, plus
//! the per-line allocated/delivered counters the engine moves forward. Pure
//! deterministic domain logic (no IO, no storage).

pub mod request;

pub use request::{
    AddLine, AdminNotesSet, Approve, AssignSupplier, Cancel, CancelLine, ChangeUrgency,
    CreateRequest, FreeTextItem, LineAdded, LineAllocated, LineAllocationReleased, LineCancelled,
    LineDelivered, LineHolding, LineMarkedUnresolvable, LineReference, LineRemoved, LineSpec,
    LineSupplierAssigned, MarkLineUnresolvable, MaterialRequest, MaterialRequestCommand,
    MaterialRequestEvent, MaterialRequestId, RecordAllocation, RecordDelivery, Reject,
    ReleaseAllocation, RemoveLine, RequestApproved, RequestCancelled, RequestContext,
    RequestCreated, RequestLine, RequestQueuedForApproval, RequestRejected, RequestStatus,
    RequestSubmitted, Requester, SetAdminNotes, Submit, Urgency, UrgencyChanged,
};
