use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use procura_core::{Aggregate, AggregateId, AggregateRoot, DomainError, Entity, Money, domain_id};
use procura_events::Event;
use procura_suppliers::{CatalogItemId, SupplierId};

domain_id!(
    /// Material request identifier.
    MaterialRequestId
);

/// Material request status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Draft,
    Submitted,
    PendingApproval,
    Approved,
    Rejected,
    Cancelled,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Rejected | RequestStatus::Cancelled)
    }
}

/// Why the material is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestContext {
    Project,
    Installation,
    Sales,
    StockReplenishment,
    Internal,
}

impl RequestContext {
    /// Contexts that must name the project they belong to before submission.
    pub fn requires_project_reference(self) -> bool {
        matches!(self, RequestContext::Installation | RequestContext::Sales)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    pub name: String,
    pub email: String,
    pub department: Option<String>,
}

/// Item described by hand because it is not in the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeTextItem {
    pub reference: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub brand: Option<String>,
    pub model: Option<String>,
    /// Estimated unit price, used for the grouped-order amount.
    pub estimated_price: Option<Money>,
}

impl FreeTextItem {
    /// `true` when at least one identifying text is filled in.
    pub fn is_described(&self) -> bool {
        [&self.reference, &self.name, &self.description]
            .into_iter()
            .any(|field| field.as_deref().is_some_and(|s| !s.trim().is_empty()))
    }

    /// Human label: reference first, then name, then description.
    pub fn label(&self) -> String {
        [&self.reference, &self.name, &self.description]
            .into_iter()
            .filter_map(|field| field.as_deref().map(str::trim))
            .find(|s| !s.is_empty())
            .unwrap_or_default()
            .to_string()
    }
}

/// What a request line asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LineReference {
    Catalog { item_id: CatalogItemId },
    FreeText(FreeTextItem),
}

impl LineReference {
    pub fn catalog_item(&self) -> Option<CatalogItemId> {
        match self {
            LineReference::Catalog { item_id } => Some(*item_id),
            LineReference::FreeText(_) => None,
        }
    }

    pub fn is_free_text(&self) -> bool {
        matches!(self, LineReference::FreeText(_))
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        match self {
            LineReference::Catalog { .. } => Ok(()),
            LineReference::FreeText(item) => {
                if !item.is_described() {
                    return Err(DomainError::validation(
                        "line references neither a catalog item nor a free-text description",
                    ));
                }
                if item.estimated_price.is_some_and(|p| p.cents() < 0) {
                    return Err(DomainError::validation(
                        "estimated price cannot be negative",
                    ));
                }
                Ok(())
            }
        }
    }
}

/// Input for a new request line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSpec {
    pub reference: LineReference,
    pub requested_quantity: i64,
    pub priority: Option<u8>,
    pub alternatives_accepted: bool,
    /// Manually chosen supplier (free-text lines only).
    pub supplier_id: Option<SupplierId>,
}

impl LineSpec {
    pub fn catalog(item_id: CatalogItemId, requested_quantity: i64) -> Self {
        Self {
            reference: LineReference::Catalog { item_id },
            requested_quantity,
            priority: None,
            alternatives_accepted: false,
            supplier_id: None,
        }
    }

    pub fn free_text(item: FreeTextItem, requested_quantity: i64) -> Self {
        Self {
            reference: LineReference::FreeText(item),
            requested_quantity,
            priority: None,
            alternatives_accepted: false,
            supplier_id: None,
        }
    }

    pub fn with_supplier(mut self, supplier_id: SupplierId) -> Self {
        self.supplier_id = Some(supplier_id);
        self
    }

    /// Checks the line on its own and returns the requested quantity as stored.
    pub fn validate(&self) -> Result<u32, DomainError> {
        if self.requested_quantity <= 0 {
            return Err(DomainError::validation("requested quantity must be positive"));
        }
        let requested_quantity = u32::try_from(self.requested_quantity)
            .map_err(|_| DomainError::validation("requested quantity is too large"))?;
        self.reference.validate()?;
        if self.supplier_id.is_some() && !self.reference.is_free_text() {
            return Err(DomainError::validation(
                "catalog lines take their supplier from the catalog",
            ));
        }
        Ok(requested_quantity)
    }
}

/// What one allocation holds on a request line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineHolding {
    pub allocated: u32,
    pub delivered: u32,
}

impl LineHolding {
    pub fn undelivered(&self) -> u32 {
        self.allocated.saturating_sub(self.delivered)
    }
}

/// Request line with its allocation/delivery counters.
///
/// `quantity_delivered <= quantity_allocated <= requested_quantity` at all times.
/// Both counters are sums over `allocations`, keyed by allocation id, so that
/// replaying an allocation or delivery record for the same allocation is a
/// no-op instead of a double count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestLine {
    pub line_no: u32,
    pub reference: LineReference,
    pub requested_quantity: u32,
    pub quantity_allocated: u32,
    pub quantity_delivered: u32,
    pub allocations: BTreeMap<AggregateId, LineHolding>,
    pub priority: Option<u8>,
    pub alternatives_accepted: bool,
    pub supplier_id: Option<SupplierId>,
    /// Reason the allocation engine could not place this line, if any.
    pub unresolvable: Option<String>,
    pub cancelled: bool,
}

impl RequestLine {
    /// Quantity still waiting for an allocation.
    pub fn quantity_pending(&self) -> u32 {
        self.requested_quantity - self.quantity_allocated
    }

    pub fn quantity_not_delivered(&self) -> u32 {
        self.requested_quantity - self.quantity_delivered
    }

    pub fn is_fully_delivered(&self) -> bool {
        self.quantity_delivered >= self.requested_quantity
    }

    pub fn is_partially_delivered(&self) -> bool {
        self.quantity_delivered > 0 && !self.is_fully_delivered()
    }

    pub fn needs_allocation(&self) -> bool {
        !self.cancelled && self.quantity_pending() > 0
    }

    pub fn holding(&self, allocation_id: AggregateId) -> LineHolding {
        self.allocations
            .get(&allocation_id)
            .copied()
            .unwrap_or_default()
    }

    fn recount(&mut self) {
        self.allocations
            .retain(|_, h| h.allocated > 0 || h.delivered > 0);
        self.quantity_allocated = self
            .allocations
            .values()
            .fold(0u32, |sum, h| sum.saturating_add(h.allocated));
        self.quantity_delivered = self
            .allocations
            .values()
            .fold(0u32, |sum, h| sum.saturating_add(h.delivered));
    }
}

impl Entity for RequestLine {
    type Id = u32;

    fn id(&self) -> &Self::Id {
        &self.line_no
    }
}

/// Aggregate root: MaterialRequest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterialRequest {
    id: MaterialRequestId,
    request_number: String,
    requester: Option<Requester>,
    context: RequestContext,
    urgency: Urgency,
    description: String,
    project_reference: Option<String>,
    delivery_address: Option<String>,
    admin_notes: Option<String>,
    status: RequestStatus,
    lines: Vec<RequestLine>,
    next_line_no: u32,
    created_at: Option<DateTime<Utc>>,
    submitted_at: Option<DateTime<Utc>>,
    approved_at: Option<DateTime<Utc>>,
    approved_by: Option<String>,
    rejection_reason: Option<String>,
    cancellation_reason: Option<String>,
    version: u64,
    created: bool,
}

impl MaterialRequest {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: MaterialRequestId) -> Self {
        Self {
            id,
            request_number: String::new(),
            requester: None,
            context: RequestContext::Internal,
            urgency: Urgency::Normal,
            description: String::new(),
            project_reference: None,
            delivery_address: None,
            admin_notes: None,
            status: RequestStatus::Draft,
            lines: Vec::new(),
            next_line_no: 1,
            created_at: None,
            submitted_at: None,
            approved_at: None,
            approved_by: None,
            rejection_reason: None,
            cancellation_reason: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> MaterialRequestId {
        self.id
    }

    pub fn exists(&self) -> bool {
        self.created
    }

    pub fn request_number(&self) -> &str {
        &self.request_number
    }

    pub fn requester(&self) -> Option<&Requester> {
        self.requester.as_ref()
    }

    pub fn context(&self) -> RequestContext {
        self.context
    }

    pub fn urgency(&self) -> Urgency {
        self.urgency
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn project_reference(&self) -> Option<&str> {
        self.project_reference.as_deref()
    }

    pub fn delivery_address(&self) -> Option<&str> {
        self.delivery_address.as_deref()
    }

    /// Purchasing-side remarks, not visible in the requester's description.
    pub fn admin_notes(&self) -> Option<&str> {
        self.admin_notes.as_deref()
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn lines(&self) -> &[RequestLine] {
        &self.lines
    }

    pub fn line(&self, line_no: u32) -> Option<&RequestLine> {
        self.lines.iter().find(|l| l.line_no == line_no)
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        self.submitted_at
    }

    pub fn approved_at(&self) -> Option<DateTime<Utc>> {
        self.approved_at
    }

    pub fn approved_by(&self) -> Option<&str> {
        self.approved_by.as_deref()
    }

    pub fn rejection_reason(&self) -> Option<&str> {
        self.rejection_reason.as_deref()
    }

    pub fn cancellation_reason(&self) -> Option<&str> {
        self.cancellation_reason.as_deref()
    }

    /// Lines the allocation engine still has to place (approved requests only).
    pub fn unallocated_lines(&self) -> impl Iterator<Item = &RequestLine> {
        let approved = self.status == RequestStatus::Approved;
        self.lines
            .iter()
            .filter(move |l| approved && l.needs_allocation())
    }

    pub fn has_unallocated_lines(&self) -> bool {
        self.unallocated_lines().next().is_some()
    }

    /// Total requested units over active lines (saturates at `u32::MAX`).
    pub fn total_items_count(&self) -> u32 {
        self.lines
            .iter()
            .filter(|l| !l.cancelled)
            .fold(0u32, |sum, l| sum.saturating_add(l.requested_quantity))
    }

    pub fn holds_allocations(&self) -> bool {
        self.lines.iter().any(|l| l.quantity_allocated > 0)
    }
}

impl AggregateRoot for MaterialRequest {
    type Id = MaterialRequestId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateRequest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRequest {
    pub request_id: MaterialRequestId,
    pub requester: Requester,
    pub context: RequestContext,
    pub urgency: Urgency,
    pub description: String,
    pub project_reference: Option<String>,
    pub delivery_address: Option<String>,
    /// Initial lines, numbered from 1 in order. All are validated before
    /// anything is recorded.
    pub lines: Vec<LineSpec>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AddLine (only allowed in Draft).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddLine {
    pub request_id: MaterialRequestId,
    pub line: LineSpec,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RemoveLine (only allowed in Draft).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveLine {
    pub request_id: MaterialRequestId,
    pub line_no: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ChangeUrgency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeUrgency {
    pub request_id: MaterialRequestId,
    pub urgency: Urgency,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SetAdminNotes (a blank text clears the notes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetAdminNotes {
    pub request_id: MaterialRequestId,
    pub notes: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Submit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submit {
    pub request_id: MaterialRequestId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Approve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approve {
    pub request_id: MaterialRequestId,
    pub approver: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Reject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reject {
    pub request_id: MaterialRequestId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Cancel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancel {
    pub request_id: MaterialRequestId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelLine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelLine {
    pub request_id: MaterialRequestId,
    pub line_no: u32,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AssignSupplier (free-text lines).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignSupplier {
    pub request_id: MaterialRequestId,
    pub line_no: u32,
    pub supplier_id: SupplierId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkLineUnresolvable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkLineUnresolvable {
    pub request_id: MaterialRequestId,
    pub line_no: u32,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordAllocation.
///
/// `quantity` is the total the allocation now holds on the line, not an
/// increment: recording the same total twice is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordAllocation {
    pub request_id: MaterialRequestId,
    pub line_no: u32,
    pub allocation_id: AggregateId,
    pub quantity: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReleaseAllocation (an allocation was cancelled).
///
/// Gives back whatever the allocation holds and has not delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseAllocation {
    pub request_id: MaterialRequestId,
    pub line_no: u32,
    pub allocation_id: AggregateId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordDelivery.
///
/// `delivered_total` is the allocation's cumulative delivered quantity; only
/// the part above what is already recorded counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordDelivery {
    pub request_id: MaterialRequestId,
    pub line_no: u32,
    pub allocation_id: AggregateId,
    pub delivered_total: u32,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaterialRequestCommand {
    CreateRequest(CreateRequest),
    AddLine(AddLine),
    RemoveLine(RemoveLine),
    ChangeUrgency(ChangeUrgency),
    SetAdminNotes(SetAdminNotes),
    Submit(Submit),
    Approve(Approve),
    Reject(Reject),
    Cancel(Cancel),
    CancelLine(CancelLine),
    AssignSupplier(AssignSupplier),
    MarkLineUnresolvable(MarkLineUnresolvable),
    RecordAllocation(RecordAllocation),
    ReleaseAllocation(ReleaseAllocation),
    RecordDelivery(RecordDelivery),
}

/// Event: RequestCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCreated {
    pub request_id: MaterialRequestId,
    pub request_number: String,
    pub requester: Requester,
    pub context: RequestContext,
    pub urgency: Urgency,
    pub description: String,
    pub project_reference: Option<String>,
    pub delivery_address: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LineAdded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineAdded {
    pub request_id: MaterialRequestId,
    pub line_no: u32,
    pub reference: LineReference,
    pub requested_quantity: u32,
    pub priority: Option<u8>,
    pub alternatives_accepted: bool,
    pub supplier_id: Option<SupplierId>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LineRemoved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRemoved {
    pub request_id: MaterialRequestId,
    pub line_no: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Event: UrgencyChanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrgencyChanged {
    pub request_id: MaterialRequestId,
    pub from: Urgency,
    pub to: Urgency,
    pub occurred_at: DateTime<Utc>,
}

/// Event: AdminNotesSet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminNotesSet {
    pub request_id: MaterialRequestId,
    pub notes: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RequestSubmitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSubmitted {
    pub request_id: MaterialRequestId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RequestQueuedForApproval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestQueuedForApproval {
    pub request_id: MaterialRequestId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RequestApproved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestApproved {
    pub request_id: MaterialRequestId,
    pub approver: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RequestRejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRejected {
    pub request_id: MaterialRequestId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RequestCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCancelled {
    pub request_id: MaterialRequestId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LineCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineCancelled {
    pub request_id: MaterialRequestId,
    pub line_no: u32,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LineSupplierAssigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSupplierAssigned {
    pub request_id: MaterialRequestId,
    pub line_no: u32,
    pub supplier_id: SupplierId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LineMarkedUnresolvable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineMarkedUnresolvable {
    pub request_id: MaterialRequestId,
    pub line_no: u32,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LineAllocated (the allocation's holding went from `previous` to
/// `quantity`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineAllocated {
    pub request_id: MaterialRequestId,
    pub line_no: u32,
    pub allocation_id: AggregateId,
    pub quantity: u32,
    pub previous: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LineAllocationReleased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineAllocationReleased {
    pub request_id: MaterialRequestId,
    pub line_no: u32,
    pub allocation_id: AggregateId,
    pub quantity: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LineDelivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineDelivered {
    pub request_id: MaterialRequestId,
    pub line_no: u32,
    pub allocation_id: AggregateId,
    /// Newly delivered units.
    pub quantity: u32,
    pub delivered_total: u32,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaterialRequestEvent {
    RequestCreated(RequestCreated),
    LineAdded(LineAdded),
    LineRemoved(LineRemoved),
    UrgencyChanged(UrgencyChanged),
    AdminNotesSet(AdminNotesSet),
    RequestSubmitted(RequestSubmitted),
    RequestQueuedForApproval(RequestQueuedForApproval),
    RequestApproved(RequestApproved),
    RequestRejected(RequestRejected),
    RequestCancelled(RequestCancelled),
    LineCancelled(LineCancelled),
    LineSupplierAssigned(LineSupplierAssigned),
    LineMarkedUnresolvable(LineMarkedUnresolvable),
    LineAllocated(LineAllocated),
    LineAllocationReleased(LineAllocationReleased),
    LineDelivered(LineDelivered),
}

impl Event for MaterialRequestEvent {
    fn event_type(&self) -> &'static str {
        match self {
            MaterialRequestEvent::RequestCreated(_) => "requests.material_request.created",
            MaterialRequestEvent::LineAdded(_) => "requests.material_request.line_added",
            MaterialRequestEvent::LineRemoved(_) => "requests.material_request.line_removed",
            MaterialRequestEvent::UrgencyChanged(_) => "requests.material_request.urgency_changed",
            MaterialRequestEvent::AdminNotesSet(_) => "requests.material_request.admin_notes_set",
            MaterialRequestEvent::RequestSubmitted(_) => "requests.material_request.submitted",
            MaterialRequestEvent::RequestQueuedForApproval(_) => {
                "requests.material_request.queued_for_approval"
            }
            MaterialRequestEvent::RequestApproved(_) => "requests.material_request.approved",
            MaterialRequestEvent::RequestRejected(_) => "requests.material_request.rejected",
            MaterialRequestEvent::RequestCancelled(_) => "requests.material_request.cancelled",
            MaterialRequestEvent::LineCancelled(_) => "requests.material_request.line_cancelled",
            MaterialRequestEvent::LineSupplierAssigned(_) => {
                "requests.material_request.line_supplier_assigned"
            }
            MaterialRequestEvent::LineMarkedUnresolvable(_) => {
                "requests.material_request.line_unresolvable"
            }
            MaterialRequestEvent::LineAllocated(_) => "requests.material_request.line_allocated",
            MaterialRequestEvent::LineAllocationReleased(_) => {
                "requests.material_request.line_allocation_released"
            }
            MaterialRequestEvent::LineDelivered(_) => "requests.material_request.line_delivered",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            MaterialRequestEvent::RequestCreated(e) => e.occurred_at,
            MaterialRequestEvent::LineAdded(e) => e.occurred_at,
            MaterialRequestEvent::LineRemoved(e) => e.occurred_at,
            MaterialRequestEvent::UrgencyChanged(e) => e.occurred_at,
            MaterialRequestEvent::AdminNotesSet(e) => e.occurred_at,
            MaterialRequestEvent::RequestSubmitted(e) => e.occurred_at,
            MaterialRequestEvent::RequestQueuedForApproval(e) => e.occurred_at,
            MaterialRequestEvent::RequestApproved(e) => e.occurred_at,
            MaterialRequestEvent::RequestRejected(e) => e.occurred_at,
            MaterialRequestEvent::RequestCancelled(e) => e.occurred_at,
            MaterialRequestEvent::LineCancelled(e) => e.occurred_at,
            MaterialRequestEvent::LineSupplierAssigned(e) => e.occurred_at,
            MaterialRequestEvent::LineMarkedUnresolvable(e) => e.occurred_at,
            MaterialRequestEvent::LineAllocated(e) => e.occurred_at,
            MaterialRequestEvent::LineAllocationReleased(e) => e.occurred_at,
            MaterialRequestEvent::LineDelivered(e) => e.occurred_at,
        }
    }
}

impl Aggregate for MaterialRequest {
    type Command = MaterialRequestCommand;
    type Event = MaterialRequestEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            MaterialRequestEvent::RequestCreated(e) => {
                self.id = e.request_id;
                self.request_number = e.request_number.clone();
                self.requester = Some(e.requester.clone());
                self.context = e.context;
                self.urgency = e.urgency;
                self.description = e.description.clone();
                self.project_reference = e.project_reference.clone();
                self.delivery_address = e.delivery_address.clone();
                self.status = RequestStatus::Draft;
                self.lines.clear();
                self.next_line_no = 1;
                self.created_at = Some(e.occurred_at);
                self.created = true;
            }
            MaterialRequestEvent::LineAdded(e) => {
                self.lines.push(RequestLine {
                    line_no: e.line_no,
                    reference: e.reference.clone(),
                    requested_quantity: e.requested_quantity,
                    quantity_allocated: 0,
                    quantity_delivered: 0,
                    allocations: BTreeMap::new(),
                    priority: e.priority,
                    alternatives_accepted: e.alternatives_accepted,
                    supplier_id: e.supplier_id,
                    unresolvable: None,
                    cancelled: false,
                });
                self.next_line_no = self.next_line_no.max(e.line_no.saturating_add(1));
            }
            MaterialRequestEvent::LineRemoved(e) => {
                self.lines.retain(|l| l.line_no != e.line_no);
            }
            MaterialRequestEvent::UrgencyChanged(e) => {
                self.urgency = e.to;
            }
            MaterialRequestEvent::AdminNotesSet(e) => {
                self.admin_notes = e.notes.clone();
            }
            MaterialRequestEvent::RequestSubmitted(e) => {
                self.status = RequestStatus::Submitted;
                self.submitted_at = Some(e.occurred_at);
            }
            MaterialRequestEvent::RequestQueuedForApproval(_) => {
                self.status = RequestStatus::PendingApproval;
            }
            MaterialRequestEvent::RequestApproved(e) => {
                self.status = RequestStatus::Approved;
                self.approved_at = Some(e.occurred_at);
                self.approved_by = Some(e.approver.clone());
            }
            MaterialRequestEvent::RequestRejected(e) => {
                self.status = RequestStatus::Rejected;
                self.rejection_reason = Some(e.reason.clone());
            }
            MaterialRequestEvent::RequestCancelled(e) => {
                self.status = RequestStatus::Cancelled;
                self.cancellation_reason = e.reason.clone();
            }
            MaterialRequestEvent::LineCancelled(e) => {
                if let Some(line) = self.line_mut(e.line_no) {
                    line.cancelled = true;
                }
            }
            MaterialRequestEvent::LineSupplierAssigned(e) => {
                if let Some(line) = self.line_mut(e.line_no) {
                    line.supplier_id = Some(e.supplier_id);
                    line.unresolvable = None;
                }
            }
            MaterialRequestEvent::LineMarkedUnresolvable(e) => {
                if let Some(line) = self.line_mut(e.line_no) {
                    line.unresolvable = Some(e.reason.clone());
                }
            }
            MaterialRequestEvent::LineAllocated(e) => {
                if let Some(line) = self.line_mut(e.line_no) {
                    line.allocations.entry(e.allocation_id).or_default().allocated = e.quantity;
                    line.unresolvable = None;
                    line.recount();
                }
            }
            MaterialRequestEvent::LineAllocationReleased(e) => {
                if let Some(line) = self.line_mut(e.line_no) {
                    if let Some(holding) = line.allocations.get_mut(&e.allocation_id) {
                        holding.allocated = holding.allocated.saturating_sub(e.quantity);
                    }
                    line.recount();
                }
            }
            MaterialRequestEvent::LineDelivered(e) => {
                if let Some(line) = self.line_mut(e.line_no) {
                    let holding = line.allocations.entry(e.allocation_id).or_default();
                    holding.delivered = holding.delivered.max(e.delivered_total);
                    line.recount();
                }
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            MaterialRequestCommand::CreateRequest(cmd) => self.handle_create(cmd),
            MaterialRequestCommand::AddLine(cmd) => self.handle_add_line(cmd),
            MaterialRequestCommand::RemoveLine(cmd) => self.handle_remove_line(cmd),
            MaterialRequestCommand::ChangeUrgency(cmd) => self.handle_change_urgency(cmd),
            MaterialRequestCommand::SetAdminNotes(cmd) => self.handle_set_admin_notes(cmd),
            MaterialRequestCommand::Submit(cmd) => self.handle_submit(cmd),
            MaterialRequestCommand::Approve(cmd) => self.handle_approve(cmd),
            MaterialRequestCommand::Reject(cmd) => self.handle_reject(cmd),
            MaterialRequestCommand::Cancel(cmd) => self.handle_cancel(cmd),
            MaterialRequestCommand::CancelLine(cmd) => self.handle_cancel_line(cmd),
            MaterialRequestCommand::AssignSupplier(cmd) => self.handle_assign_supplier(cmd),
            MaterialRequestCommand::MarkLineUnresolvable(cmd) => self.handle_unresolvable(cmd),
            MaterialRequestCommand::RecordAllocation(cmd) => self.handle_record_allocation(cmd),
            MaterialRequestCommand::ReleaseAllocation(cmd) => self.handle_release_allocation(cmd),
            MaterialRequestCommand::RecordDelivery(cmd) => self.handle_record_delivery(cmd),
        }
    }
}

fn non_blank(value: &str) -> bool {
    !value.trim().is_empty()
}

impl MaterialRequest {
    fn line_mut(&mut self, line_no: u32) -> Option<&mut RequestLine> {
        self.lines.iter_mut().find(|l| l.line_no == line_no)
    }

    fn ensure_exists(&self, request_id: MaterialRequestId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.id != request_id {
            return Err(DomainError::invariant("request_id mismatch"));
        }
        Ok(())
    }

    fn ensure_line(&self, line_no: u32) -> Result<&RequestLine, DomainError> {
        self.line(line_no).ok_or_else(DomainError::not_found)
    }

    fn ensure_draft(&self) -> Result<(), DomainError> {
        if self.status != RequestStatus::Draft {
            return Err(DomainError::invariant(
                "lines can only be changed while the request is a draft",
            ));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateRequest) -> Result<Vec<MaterialRequestEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("material request already exists"));
        }
        if !non_blank(&cmd.requester.name) {
            return Err(DomainError::validation("requester name is required"));
        }
        if !non_blank(&cmd.requester.email) {
            return Err(DomainError::validation("requester e-mail is required"));
        }
        if !non_blank(&cmd.description) {
            return Err(DomainError::validation("description is required"));
        }
        let quantities = cmd
            .lines
            .iter()
            .enumerate()
            .map(|(index, line)| {
                line.validate().map_err(|err| match err {
                    DomainError::Validation(msg) => {
                        DomainError::validation(format!("line {}: {msg}", index + 1))
                    }
                    other => other,
                })
            })
            .collect::<Result<Vec<u32>, DomainError>>()?;

        let mut events = vec![MaterialRequestEvent::RequestCreated(RequestCreated {
            request_id: cmd.request_id,
            request_number: format!("REQ-{}", cmd.occurred_at.timestamp_millis()),
            requester: cmd.requester.clone(),
            context: cmd.context,
            urgency: cmd.urgency,
            description: cmd.description.trim().to_string(),
            project_reference: cmd.project_reference.clone(),
            delivery_address: cmd.delivery_address.clone(),
            occurred_at: cmd.occurred_at,
        })];
        for ((line_no, line), requested_quantity) in (1u32..).zip(&cmd.lines).zip(quantities) {
            events.push(line_added(
                cmd.request_id,
                line_no,
                line,
                requested_quantity,
                cmd.occurred_at,
            ));
        }

        Ok(events)
    }

    fn handle_add_line(&self, cmd: &AddLine) -> Result<Vec<MaterialRequestEvent>, DomainError> {
        self.ensure_exists(cmd.request_id)?;
        self.ensure_draft()?;

        let requested_quantity = cmd.line.validate()?;

        Ok(vec![line_added(
            cmd.request_id,
            self.next_line_no,
            &cmd.line,
            requested_quantity,
            cmd.occurred_at,
        )])
    }

    fn handle_change_urgency(
        &self,
        cmd: &ChangeUrgency,
    ) -> Result<Vec<MaterialRequestEvent>, DomainError> {
        self.ensure_exists(cmd.request_id)?;

        if self.status.is_terminal() {
            return Err(DomainError::invariant(
                "the urgency of a closed request cannot change",
            ));
        }
        if self.urgency == cmd.urgency {
            return Ok(vec![]);
        }

        Ok(vec![MaterialRequestEvent::UrgencyChanged(UrgencyChanged {
            request_id: cmd.request_id,
            from: self.urgency,
            to: cmd.urgency,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_set_admin_notes(
        &self,
        cmd: &SetAdminNotes,
    ) -> Result<Vec<MaterialRequestEvent>, DomainError> {
        self.ensure_exists(cmd.request_id)?;

        let notes = Some(cmd.notes.trim())
            .filter(|n| !n.is_empty())
            .map(str::to_string);
        if notes == self.admin_notes {
            return Ok(vec![]);
        }

        Ok(vec![MaterialRequestEvent::AdminNotesSet(AdminNotesSet {
            request_id: cmd.request_id,
            notes,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_remove_line(&self, cmd: &RemoveLine) -> Result<Vec<MaterialRequestEvent>, DomainError> {
        self.ensure_exists(cmd.request_id)?;
        self.ensure_draft()?;
        self.ensure_line(cmd.line_no)?;

        Ok(vec![MaterialRequestEvent::LineRemoved(LineRemoved {
            request_id: cmd.request_id,
            line_no: cmd.line_no,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_submit(&self, cmd: &Submit) -> Result<Vec<MaterialRequestEvent>, DomainError> {
        self.ensure_exists(cmd.request_id)?;

        if self.status != RequestStatus::Draft {
            return Err(DomainError::transition(
                "material request",
                self.status,
                RequestStatus::Submitted,
            ));
        }
        if self.lines.is_empty() {
            return Err(DomainError::validation("a request needs at least one line"));
        }
        for line in &self.lines {
            if line.requested_quantity == 0 {
                return Err(DomainError::validation("requested quantity must be positive"));
            }
            line.reference.validate()?;
        }
        if self.context.requires_project_reference()
            && !self.project_reference.as_deref().is_some_and(non_blank)
        {
            return Err(DomainError::validation(format!(
                "a project reference is required for {:?} requests",
                self.context
            )));
        }

        Ok(vec![
            MaterialRequestEvent::RequestSubmitted(RequestSubmitted {
                request_id: cmd.request_id,
                occurred_at: cmd.occurred_at,
            }),
            MaterialRequestEvent::RequestQueuedForApproval(RequestQueuedForApproval {
                request_id: cmd.request_id,
                occurred_at: cmd.occurred_at,
            }),
        ])
    }

    fn handle_approve(&self, cmd: &Approve) -> Result<Vec<MaterialRequestEvent>, DomainError> {
        self.ensure_exists(cmd.request_id)?;

        if self.status != RequestStatus::PendingApproval {
            return Err(DomainError::transition(
                "material request",
                self.status,
                RequestStatus::Approved,
            ));
        }
        if !non_blank(&cmd.approver) {
            return Err(DomainError::validation("approver is required"));
        }

        Ok(vec![MaterialRequestEvent::RequestApproved(RequestApproved {
            request_id: cmd.request_id,
            approver: cmd.approver.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_reject(&self, cmd: &Reject) -> Result<Vec<MaterialRequestEvent>, DomainError> {
        self.ensure_exists(cmd.request_id)?;

        if self.status != RequestStatus::PendingApproval {
            return Err(DomainError::transition(
                "material request",
                self.status,
                RequestStatus::Rejected,
            ));
        }
        if !non_blank(&cmd.reason) {
            return Err(DomainError::validation("a rejection reason is required"));
        }

        Ok(vec![MaterialRequestEvent::RequestRejected(RequestRejected {
            request_id: cmd.request_id,
            reason: cmd.reason.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &Cancel) -> Result<Vec<MaterialRequestEvent>, DomainError> {
        self.ensure_exists(cmd.request_id)?;

        if self.status.is_terminal() {
            return Err(DomainError::transition(
                "material request",
                self.status,
                RequestStatus::Cancelled,
            ));
        }
        if self.holds_allocations() {
            return Err(DomainError::invariant(
                "release the request's allocations before cancelling it",
            ));
        }

        Ok(vec![MaterialRequestEvent::RequestCancelled(RequestCancelled {
            request_id: cmd.request_id,
            reason: cmd.reason.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel_line(&self, cmd: &CancelLine) -> Result<Vec<MaterialRequestEvent>, DomainError> {
        self.ensure_exists(cmd.request_id)?;

        if self.status.is_terminal() {
            return Err(DomainError::invariant(
                "lines of a closed request cannot be cancelled",
            ));
        }
        let line = self.ensure_line(cmd.line_no)?;
        if line.cancelled {
            return Ok(vec![]);
        }
        if line.quantity_allocated > 0 {
            return Err(DomainError::invariant(
                "release the line's allocations before cancelling it",
            ));
        }

        Ok(vec![MaterialRequestEvent::LineCancelled(LineCancelled {
            request_id: cmd.request_id,
            line_no: cmd.line_no,
            reason: cmd.reason.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_assign_supplier(
        &self,
        cmd: &AssignSupplier,
    ) -> Result<Vec<MaterialRequestEvent>, DomainError> {
        self.ensure_exists(cmd.request_id)?;

        if self.status.is_terminal() {
            return Err(DomainError::invariant(
                "cannot assign a supplier on a closed request",
            ));
        }
        let line = self.ensure_line(cmd.line_no)?;
        if !line.reference.is_free_text() {
            return Err(DomainError::validation(
                "catalog lines take their supplier from the catalog",
            ));
        }
        if line.cancelled {
            return Err(DomainError::invariant("line is cancelled"));
        }
        if line.quantity_allocated > 0 {
            return Err(DomainError::invariant(
                "cannot change the supplier of a line with allocated quantity",
            ));
        }
        if line.supplier_id == Some(cmd.supplier_id) && line.unresolvable.is_none() {
            return Ok(vec![]);
        }

        Ok(vec![MaterialRequestEvent::LineSupplierAssigned(
            LineSupplierAssigned {
                request_id: cmd.request_id,
                line_no: cmd.line_no,
                supplier_id: cmd.supplier_id,
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_unresolvable(
        &self,
        cmd: &MarkLineUnresolvable,
    ) -> Result<Vec<MaterialRequestEvent>, DomainError> {
        self.ensure_exists(cmd.request_id)?;

        let line = self.ensure_line(cmd.line_no)?;
        if line.unresolvable.as_deref() == Some(cmd.reason.as_str()) {
            return Ok(vec![]);
        }

        Ok(vec![MaterialRequestEvent::LineMarkedUnresolvable(
            LineMarkedUnresolvable {
                request_id: cmd.request_id,
                line_no: cmd.line_no,
                reason: cmd.reason.clone(),
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_record_allocation(
        &self,
        cmd: &RecordAllocation,
    ) -> Result<Vec<MaterialRequestEvent>, DomainError> {
        self.ensure_exists(cmd.request_id)?;

        let line = self.ensure_line(cmd.line_no)?;
        if cmd.quantity == 0 {
            return Err(DomainError::validation(
                "allocated quantity must be positive; release the allocation instead",
            ));
        }
        let holding = line.holding(cmd.allocation_id);
        if cmd.quantity == holding.allocated {
            return Ok(vec![]);
        }

        if cmd.quantity > holding.allocated {
            if self.status != RequestStatus::Approved {
                return Err(DomainError::invariant(
                    "only approved requests can be allocated",
                ));
            }
            if line.cancelled {
                return Err(DomainError::invariant("line is cancelled"));
            }
            let added = cmd.quantity - holding.allocated;
            if added > line.quantity_pending() {
                return Err(DomainError::OverAllocation {
                    requested: line.requested_quantity,
                    allocated: line.quantity_allocated,
                    attempted: added,
                });
            }
        } else if cmd.quantity < holding.delivered {
            return Err(DomainError::invariant(format!(
                "allocation already delivered {} units; cannot shrink it to {}",
                holding.delivered, cmd.quantity
            )));
        }

        Ok(vec![MaterialRequestEvent::LineAllocated(LineAllocated {
            request_id: cmd.request_id,
            line_no: cmd.line_no,
            allocation_id: cmd.allocation_id,
            quantity: cmd.quantity,
            previous: holding.allocated,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_release_allocation(
        &self,
        cmd: &ReleaseAllocation,
    ) -> Result<Vec<MaterialRequestEvent>, DomainError> {
        self.ensure_exists(cmd.request_id)?;

        let line = self.ensure_line(cmd.line_no)?;
        let undelivered = line.holding(cmd.allocation_id).undelivered();
        if undelivered == 0 {
            return Ok(vec![]);
        }

        Ok(vec![MaterialRequestEvent::LineAllocationReleased(
            LineAllocationReleased {
                request_id: cmd.request_id,
                line_no: cmd.line_no,
                allocation_id: cmd.allocation_id,
                quantity: undelivered,
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_record_delivery(
        &self,
        cmd: &RecordDelivery,
    ) -> Result<Vec<MaterialRequestEvent>, DomainError> {
        self.ensure_exists(cmd.request_id)?;

        let line = self.ensure_line(cmd.line_no)?;
        let holding = line.holding(cmd.allocation_id);
        if cmd.delivered_total <= holding.delivered {
            return Ok(vec![]);
        }
        let added = cmd.delivered_total - holding.delivered;
        if cmd.delivered_total > holding.allocated {
            return Err(DomainError::OverDelivery {
                allocated: holding.allocated,
                delivered: holding.delivered,
                attempted: added,
            });
        }

        Ok(vec![MaterialRequestEvent::LineDelivered(LineDelivered {
            request_id: cmd.request_id,
            line_no: cmd.line_no,
            allocation_id: cmd.allocation_id,
            quantity: added,
            delivered_total: cmd.delivered_total,
            occurred_at: cmd.occurred_at,
        })])
    }
}

fn line_added(
    request_id: MaterialRequestId,
    line_no: u32,
    line: &LineSpec,
    requested_quantity: u32,
    occurred_at: DateTime<Utc>,
) -> MaterialRequestEvent {
    MaterialRequestEvent::LineAdded(LineAdded {
        request_id,
        line_no,
        reference: line.reference.clone(),
        requested_quantity,
        priority: line.priority,
        alternatives_accepted: line.alternatives_accepted,
        supplier_id: line.supplier_id,
        occurred_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use procura_events::execute;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn requester() -> Requester {
        Requester {
            name: "Camille".to_string(),
            email: "camille@example.com".to_string(),
            department: Some("Installations".to_string()),
        }
    }

    fn create_with(
        id: MaterialRequestId,
        context: RequestContext,
        lines: Vec<LineSpec>,
    ) -> MaterialRequestCommand {
        MaterialRequestCommand::CreateRequest(CreateRequest {
            request_id: id,
            requester: requester(),
            context,
            urgency: Urgency::High,
            description: "Stage lighting for the autumn tour".to_string(),
            project_reference: None,
            delivery_address: None,
            lines,
            occurred_at: now(),
        })
    }

    fn create_cmd(id: MaterialRequestId, context: RequestContext) -> MaterialRequestCommand {
        create_with(id, context, vec![])
    }

    fn run(req: &mut MaterialRequest, cmd: MaterialRequestCommand) -> Vec<MaterialRequestEvent> {
        execute(req, &cmd).unwrap()
    }

    fn draft_with_line(quantity: i64) -> MaterialRequest {
        let id = MaterialRequestId::new(AggregateId::new());
        let mut req = MaterialRequest::empty(id);
        run(&mut req, create_cmd(id, RequestContext::StockReplenishment));
        run(
            &mut req,
            MaterialRequestCommand::AddLine(AddLine {
                request_id: id,
                line: LineSpec::catalog(CatalogItemId::generate(), quantity),
                occurred_at: now(),
            }),
        );
        req
    }

    fn approved_with_line(quantity: i64) -> MaterialRequest {
        let mut req = draft_with_line(quantity);
        let id = req.id_typed();
        run(
            &mut req,
            MaterialRequestCommand::Submit(Submit {
                request_id: id,
                occurred_at: now(),
            }),
        );
        run(
            &mut req,
            MaterialRequestCommand::Approve(Approve {
                request_id: id,
                approver: "manager".to_string(),
                occurred_at: now(),
            }),
        );
        req
    }

    fn allocate(
        req: &mut MaterialRequest,
        allocation_id: AggregateId,
        quantity: u32,
    ) -> Result<Vec<MaterialRequestEvent>, DomainError> {
        let cmd = MaterialRequestCommand::RecordAllocation(RecordAllocation {
            request_id: req.id_typed(),
            line_no: 1,
            allocation_id,
            quantity,
            occurred_at: now(),
        });
        execute(req, &cmd)
    }

    fn release(
        req: &mut MaterialRequest,
        allocation_id: AggregateId,
    ) -> Vec<MaterialRequestEvent> {
        let cmd = MaterialRequestCommand::ReleaseAllocation(ReleaseAllocation {
            request_id: req.id_typed(),
            line_no: 1,
            allocation_id,
            occurred_at: now(),
        });
        run(req, cmd)
    }

    fn deliver(
        req: &mut MaterialRequest,
        allocation_id: AggregateId,
        delivered_total: u32,
    ) -> Result<Vec<MaterialRequestEvent>, DomainError> {
        let cmd = MaterialRequestCommand::RecordDelivery(RecordDelivery {
            request_id: req.id_typed(),
            line_no: 1,
            allocation_id,
            delivered_total,
            occurred_at: now(),
        });
        execute(req, &cmd)
    }

    #[test]
    fn create_stamps_request_number_from_creation_time() {
        let id = MaterialRequestId::generate();
        let mut req = MaterialRequest::empty(id);
        let at = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        let cmd = MaterialRequestCommand::CreateRequest(CreateRequest {
            request_id: id,
            requester: requester(),
            context: RequestContext::Internal,
            urgency: Urgency::Normal,
            description: "Cables".to_string(),
            project_reference: None,
            delivery_address: None,
            lines: vec![],
            occurred_at: at,
        });
        run(&mut req, cmd);

        assert_eq!(req.request_number(), "REQ-1700000000123");
        assert_eq!(req.status(), RequestStatus::Draft);
        assert_eq!(req.version(), 1);
    }

    #[test]
    fn create_records_initial_lines_in_one_batch() {
        let id = MaterialRequestId::generate();
        let mut req = MaterialRequest::empty(id);
        let events = run(
            &mut req,
            create_with(
                id,
                RequestContext::Internal,
                vec![
                    LineSpec::catalog(CatalogItemId::generate(), 2),
                    LineSpec::catalog(CatalogItemId::generate(), 5),
                ],
            ),
        );

        assert_eq!(events.len(), 3);
        let numbers: Vec<u32> = req.lines().iter().map(|l| l.line_no).collect();
        assert_eq!(numbers, vec![1, 2]);
        assert_eq!(req.total_items_count(), 7);
    }

    #[test]
    fn create_refuses_everything_when_one_line_is_invalid() {
        let id = MaterialRequestId::generate();
        let req = MaterialRequest::empty(id);
        let err = req
            .handle(&create_with(
                id,
                RequestContext::Internal,
                vec![
                    LineSpec::catalog(CatalogItemId::generate(), 2),
                    LineSpec::catalog(CatalogItemId::generate(), 0),
                ],
            ))
            .unwrap_err();

        assert!(matches!(err, DomainError::Validation(msg) if msg.starts_with("line 2")));
        assert!(!req.exists());
    }

    #[test]
    fn add_line_rejects_non_positive_quantity() {
        let req = draft_with_line(1);
        for quantity in [0, -3] {
            let cmd = MaterialRequestCommand::AddLine(AddLine {
                request_id: req.id_typed(),
                line: LineSpec::catalog(CatalogItemId::generate(), quantity),
                occurred_at: now(),
            });
            let err = req.handle(&cmd).unwrap_err();
            assert!(matches!(err, DomainError::Validation(_)));
        }
    }

    #[test]
    fn add_line_rejects_undescribed_free_text() {
        let req = draft_with_line(1);
        let item = FreeTextItem {
            brand: Some("Shure".to_string()),
            name: Some("   ".to_string()),
            ..FreeTextItem::default()
        };
        let cmd = MaterialRequestCommand::AddLine(AddLine {
            request_id: req.id_typed(),
            line: LineSpec::free_text(item, 2),
            occurred_at: now(),
        });
        let err = req.handle(&cmd).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn submit_moves_to_pending_approval_and_stamps_time() {
        let mut req = draft_with_line(3);
        let request_id = req.id_typed();
        let events = run(
            &mut req,
            MaterialRequestCommand::Submit(Submit {
                request_id,
                occurred_at: now(),
            }),
        );
        assert_eq!(events.len(), 2);
        assert_eq!(req.status(), RequestStatus::PendingApproval);
        assert!(req.submitted_at().is_some());
    }

    #[test]
    fn submit_requires_at_least_one_line() {
        let id = MaterialRequestId::generate();
        let mut req = MaterialRequest::empty(id);
        run(&mut req, create_cmd(id, RequestContext::Internal));
        let err = req
            .handle(&MaterialRequestCommand::Submit(Submit {
                request_id: id,
                occurred_at: now(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn installation_requests_need_a_project_reference() {
        let id = MaterialRequestId::generate();
        let mut req = MaterialRequest::empty(id);
        run(&mut req, create_cmd(id, RequestContext::Installation));
        run(
            &mut req,
            MaterialRequestCommand::AddLine(AddLine {
                request_id: id,
                line: LineSpec::catalog(CatalogItemId::generate(), 1),
                occurred_at: now(),
            }),
        );
        let err = req
            .handle(&MaterialRequestCommand::Submit(Submit {
                request_id: id,
                occurred_at: now(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(msg) if msg.contains("project reference")));
    }

    #[test]
    fn lines_are_frozen_after_submission() {
        let req = approved_with_line(2);
        let cmd = MaterialRequestCommand::RemoveLine(RemoveLine {
            request_id: req.id_typed(),
            line_no: 1,
            occurred_at: now(),
        });
        assert!(matches!(
            req.handle(&cmd).unwrap_err(),
            DomainError::InvariantViolation(_)
        ));
    }

    #[test]
    fn decision_is_single_and_not_reversible() {
        let req = approved_with_line(2);
        let err = req
            .handle(&MaterialRequestCommand::Reject(Reject {
                request_id: req.id_typed(),
                reason: "too late".to_string(),
                occurred_at: now(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition { .. }));
        assert_eq!(req.approved_by(), Some("manager"));
        assert!(req.approved_at().is_some());
    }

    #[test]
    fn urgency_changes_until_the_request_closes() {
        let mut req = draft_with_line(2);
        let change = |urgency| {
            MaterialRequestCommand::ChangeUrgency(ChangeUrgency {
                request_id: req.id_typed(),
                urgency,
                occurred_at: now(),
            })
        };
        let same = change(Urgency::High);
        let urgent = change(Urgency::Urgent);
        let low = change(Urgency::Low);

        assert!(req.handle(&same).unwrap().is_empty());
        let events = run(&mut req, urgent);
        assert!(matches!(
            &events[..],
            [MaterialRequestEvent::UrgencyChanged(e)]
                if e.from == Urgency::High && e.to == Urgency::Urgent
        ));
        assert_eq!(req.urgency(), Urgency::Urgent);

        let request_id = req.id_typed();
        run(
            &mut req,
            MaterialRequestCommand::Cancel(Cancel {
                request_id,
                reason: None,
                occurred_at: now(),
            }),
        );
        assert!(matches!(
            req.handle(&low).unwrap_err(),
            DomainError::InvariantViolation(_)
        ));
    }

    #[test]
    fn admin_notes_replace_and_clear() {
        let mut req = approved_with_line(1);
        let notes = |text: &str| {
            MaterialRequestCommand::SetAdminNotes(SetAdminNotes {
                request_id: req.id_typed(),
                notes: text.to_string(),
                occurred_at: now(),
            })
        };
        let first = notes("  call the venue before shipping ");
        let again = notes("call the venue before shipping");
        let blank = notes("   ");

        run(&mut req, first);
        assert_eq!(req.admin_notes(), Some("call the venue before shipping"));
        assert!(req.handle(&again).unwrap().is_empty());

        run(&mut req, blank);
        assert_eq!(req.admin_notes(), None);
        assert_eq!(req.description(), "Stage lighting for the autumn tour");
    }

    #[test]
    fn allocation_requires_approval() {
        let mut req = draft_with_line(2);
        assert!(matches!(
            allocate(&mut req, AggregateId::new(), 1).unwrap_err(),
            DomainError::InvariantViolation(_)
        ));
    }

    #[test]
    fn over_allocation_is_rejected_not_clamped() {
        let mut req = approved_with_line(3);
        allocate(&mut req, AggregateId::new(), 2).unwrap();
        let err = allocate(&mut req, AggregateId::new(), 2).unwrap_err();
        assert_eq!(
            err,
            DomainError::OverAllocation {
                requested: 3,
                allocated: 2,
                attempted: 2
            }
        );
        assert_eq!(req.line(1).unwrap().quantity_allocated, 2);
    }

    #[test]
    fn recording_the_same_allocation_twice_counts_once() {
        let mut req = approved_with_line(5);
        let allocation = AggregateId::new();
        allocate(&mut req, allocation, 3).unwrap();

        assert!(allocate(&mut req, allocation, 3).unwrap().is_empty());
        assert_eq!(req.line(1).unwrap().quantity_allocated, 3);

        // Growing the holding only charges the difference against pending.
        let events = allocate(&mut req, allocation, 5).unwrap();
        assert!(matches!(
            &events[..],
            [MaterialRequestEvent::LineAllocated(e)] if e.previous == 3 && e.quantity == 5
        ));
        assert_eq!(req.line(1).unwrap().quantity_allocated, 5);
        assert_eq!(req.line(1).unwrap().quantity_pending(), 0);
    }

    #[test]
    fn shrinking_an_allocation_stops_at_its_deliveries() {
        let mut req = approved_with_line(5);
        let allocation = AggregateId::new();
        allocate(&mut req, allocation, 5).unwrap();
        deliver(&mut req, allocation, 2).unwrap();

        allocate(&mut req, allocation, 3).unwrap();
        assert_eq!(req.line(1).unwrap().quantity_allocated, 3);

        let err = allocate(&mut req, allocation, 1).unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn over_delivery_is_rejected() {
        let mut req = approved_with_line(3);
        let allocation = AggregateId::new();
        allocate(&mut req, allocation, 3).unwrap();
        deliver(&mut req, allocation, 2).unwrap();
        let err = deliver(&mut req, allocation, 4).unwrap_err();
        assert!(matches!(err, DomainError::OverDelivery { delivered: 2, .. }));

        let line = req.line(1).unwrap();
        assert!(line.is_partially_delivered());
        assert_eq!(line.quantity_not_delivered(), 1);
    }

    #[test]
    fn delivery_totals_are_high_water_marks() {
        let mut req = approved_with_line(6);
        let allocation = AggregateId::new();
        allocate(&mut req, allocation, 6).unwrap();

        let events = deliver(&mut req, allocation, 4).unwrap();
        assert!(matches!(
            &events[..],
            [MaterialRequestEvent::LineDelivered(e)] if e.quantity == 4 && e.delivered_total == 4
        ));
        assert!(deliver(&mut req, allocation, 4).unwrap().is_empty());
        assert!(deliver(&mut req, allocation, 3).unwrap().is_empty());

        let events = deliver(&mut req, allocation, 6).unwrap();
        assert!(matches!(
            &events[..],
            [MaterialRequestEvent::LineDelivered(e)] if e.quantity == 2
        ));
        assert!(req.line(1).unwrap().is_fully_delivered());
    }

    #[test]
    fn delivery_counters_reach_the_full_range() {
        let mut req = approved_with_line(i64::from(u32::MAX));
        let allocation = AggregateId::new();
        allocate(&mut req, allocation, u32::MAX).unwrap();
        deliver(&mut req, allocation, u32::MAX - 1).unwrap();

        assert!(deliver(&mut req, allocation, u32::MAX).is_ok());
        assert_eq!(req.line(1).unwrap().quantity_delivered, u32::MAX);
        assert!(deliver(&mut req, AggregateId::new(), 1).is_err());
    }

    #[test]
    fn release_makes_line_eligible_again() {
        let mut req = approved_with_line(4);
        let allocation = AggregateId::new();
        allocate(&mut req, allocation, 4).unwrap();
        assert!(!req.has_unallocated_lines());

        release(&mut req, allocation);
        assert!(req.has_unallocated_lines());
        assert_eq!(req.line(1).unwrap().quantity_pending(), 4);
        assert!(req.line(1).unwrap().allocations.is_empty());

        // A second release of the same allocation has nothing left to give back.
        assert!(release(&mut req, allocation).is_empty());
    }

    #[test]
    fn release_keeps_what_was_delivered() {
        let mut req = approved_with_line(4);
        let allocation = AggregateId::new();
        allocate(&mut req, allocation, 4).unwrap();
        deliver(&mut req, allocation, 1).unwrap();

        let events = release(&mut req, allocation);
        assert!(matches!(
            &events[..],
            [MaterialRequestEvent::LineAllocationReleased(e)] if e.quantity == 3
        ));
        let line = req.line(1).unwrap();
        assert_eq!(line.quantity_allocated, 1);
        assert_eq!(line.quantity_delivered, 1);
    }

    #[test]
    fn cancel_is_refused_while_allocations_are_held() {
        let mut req = approved_with_line(2);
        let allocation = AggregateId::new();
        allocate(&mut req, allocation, 2).unwrap();
        let cancel = MaterialRequestCommand::Cancel(Cancel {
            request_id: req.id_typed(),
            reason: Some("project dropped".to_string()),
            occurred_at: now(),
        });
        assert!(req.handle(&cancel).is_err());

        release(&mut req, allocation);
        run(&mut req, cancel);
        assert_eq!(req.status(), RequestStatus::Cancelled);
        assert_eq!(req.cancellation_reason(), Some("project dropped"));
    }

    #[test]
    fn assigning_a_supplier_clears_unresolvable_mark() {
        let id = MaterialRequestId::generate();
        let mut req = MaterialRequest::empty(id);
        run(&mut req, create_cmd(id, RequestContext::Internal));
        let item = FreeTextItem {
            name: Some("Custom flight case".to_string()),
            estimated_price: Some(Money::from_units(80)),
            ..FreeTextItem::default()
        };
        run(
            &mut req,
            MaterialRequestCommand::AddLine(AddLine {
                request_id: id,
                line: LineSpec::free_text(item, 1),
                occurred_at: now(),
            }),
        );
        run(
            &mut req,
            MaterialRequestCommand::MarkLineUnresolvable(MarkLineUnresolvable {
                request_id: id,
                line_no: 1,
                reason: "no supplier assigned".to_string(),
                occurred_at: now(),
            }),
        );
        assert!(req.line(1).unwrap().unresolvable.is_some());

        let supplier = SupplierId::generate();
        run(
            &mut req,
            MaterialRequestCommand::AssignSupplier(AssignSupplier {
                request_id: id,
                line_no: 1,
                supplier_id: supplier,
                occurred_at: now(),
            }),
        );
        let line = req.line(1).unwrap();
        assert_eq!(line.supplier_id, Some(supplier));
        assert!(line.unresolvable.is_none());
    }

    #[test]
    fn cancelled_lines_do_not_count() {
        let mut req = draft_with_line(5);
        let request_id = req.id_typed();
        run(
            &mut req,
            MaterialRequestCommand::AddLine(AddLine {
                request_id,
                line: LineSpec::catalog(CatalogItemId::generate(), 2),
                occurred_at: now(),
            }),
        );
        assert_eq!(req.total_items_count(), 7);
        let request_id = req.id_typed();
        run(
            &mut req,
            MaterialRequestCommand::CancelLine(CancelLine {
                request_id,
                line_no: 2,
                reason: None,
                occurred_at: now(),
            }),
        );
        assert_eq!(req.total_items_count(), 5);
    }

    #[test]
    fn item_count_saturates_instead_of_wrapping() {
        let id = MaterialRequestId::generate();
        let mut req = MaterialRequest::empty(id);
        let big = i64::from(u32::MAX);
        run(
            &mut req,
            create_with(
                id,
                RequestContext::Internal,
                vec![
                    LineSpec::catalog(CatalogItemId::generate(), big),
                    LineSpec::catalog(CatalogItemId::generate(), big),
                ],
            ),
        );
        assert_eq!(req.total_items_count(), u32::MAX);
    }
}
