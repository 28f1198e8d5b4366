//! Errors surfaced by the engine services.

use thiserror::Error;

use procura_core::DomainError;
use procura_requests::MaterialRequestId;
use procura_suppliers::CatalogItemId;

use crate::command_dispatcher::DispatchError;
use crate::projections::IndexError;

pub type EngineResult<T> = Result<T, EngineError>;

/// Per-entity failure of an engine operation.
///
/// None of these leave the store inconsistent; the caller decides whether to
/// retry, report or ignore.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad input rejected before any state changed.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("no supplier for request {request_id} line {line_no}: {reason}")]
    SupplierUnresolved {
        request_id: MaterialRequestId,
        line_no: u32,
        reason: String,
    },

    #[error("catalog item {0} not found")]
    CatalogItemNotFound(CatalogItemId),

    #[error("catalog item {0} is unavailable")]
    CatalogItemUnavailable(CatalogItemId),

    /// The catalog kept failing transiently; nothing was marked.
    #[error("catalog unavailable after {attempts} attempts: {reason}")]
    CatalogUnavailable { attempts: u32, reason: String },

    /// Optimistic retries ran out; safe to retry later.
    #[error("allocation contention: still conflicting after {attempts} attempts")]
    AllocationContention { attempts: u32 },

    #[error(
        "over-delivery: allocated {allocated}, already delivered {delivered}, attempted {attempted}"
    )]
    OverDelivery {
        allocated: u32,
        delivered: u32,
        attempted: u32,
    },

    #[error(
        "over-allocation: requested {requested}, already allocated {allocated}, attempted {attempted}"
    )]
    OverAllocation {
        requested: u32,
        allocated: u32,
        attempted: u32,
    },

    #[error("{entity} cannot move from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// The operation conflicts with current state (frozen order, held allocations, ...).
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Dispatch(DispatchError),

    /// A stored event the grouped-order index could not read.
    #[error(transparent)]
    Index(#[from] IndexError),
}

impl EngineError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    /// Resolution failures mark the line unresolvable instead of aborting the pass.
    pub fn is_resolution_failure(&self) -> bool {
        matches!(
            self,
            EngineError::SupplierUnresolved { .. }
                | EngineError::CatalogItemNotFound(_)
                | EngineError::CatalogItemUnavailable(_)
        )
    }
}

impl From<DomainError> for EngineError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                EngineError::Validation(msg)
            }
            DomainError::InvariantViolation(msg) | DomainError::Conflict(msg) => {
                EngineError::Rejected(msg)
            }
            DomainError::InvalidTransition { entity, from, to } => {
                EngineError::InvalidTransition { entity, from, to }
            }
            DomainError::OverAllocation {
                requested,
                allocated,
                attempted,
            } => EngineError::OverAllocation {
                requested,
                allocated,
                attempted,
            },
            DomainError::OverDelivery {
                allocated,
                delivered,
                attempted,
            } => EngineError::OverDelivery {
                allocated,
                delivered,
                attempted,
            },
            DomainError::NotFound => EngineError::NotFound("aggregate".to_string()),
        }
    }
}

impl From<DispatchError> for EngineError {
    fn from(value: DispatchError) -> Self {
        match value {
            DispatchError::Domain(err) => err.into(),
            DispatchError::Contention { attempts } => EngineError::AllocationContention { attempts },
            other => EngineError::Dispatch(other),
        }
    }
}
