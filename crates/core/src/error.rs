//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic business failures only (validation, invariants, illegal
/// transitions). Infrastructure concerns belong to the infra crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. non-positive quantity, missing reference).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// A state machine was asked for a transition it does not allow.
    #[error("{entity} cannot move from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// Allocating `attempted` more units would exceed the requested quantity.
    #[error("over-allocation: requested {requested}, already allocated {allocated}, attempted {attempted}")]
    OverAllocation {
        requested: u32,
        allocated: u32,
        attempted: u32,
    },

    /// Delivering `attempted` more units would exceed the allocated quantity.
    #[error("over-delivery: allocated {allocated}, already delivered {delivered}, attempted {attempted}")]
    OverDelivery {
        allocated: u32,
        delivered: u32,
        attempted: u32,
    },

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested resource was not found (domain-level).
    #[error("not found")]
    NotFound,

    /// A conflict occurred (e.g. stale version, duplicate creation).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }

    pub fn transition(
        entity: &'static str,
        from: impl core::fmt::Debug,
        to: impl core::fmt::Debug,
    ) -> Self {
        Self::InvalidTransition {
            entity,
            from: format!("{from:?}"),
            to: format!("{to:?}"),
        }
    }
}
