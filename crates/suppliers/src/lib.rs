//! Supplier and catalog records consumed by the procurement engine.
//!
//! Both are read-only inputs owned by other parts of the system: the engine
//! never mutates a supplier record or a catalog entry, it only reads the
//! free-shipping threshold, the auto-validation flag and catalog resolutions.

pub mod catalog;
pub mod supplier;

pub use catalog::{CatalogEntry, CatalogItemId};
pub use supplier::{Supplier, SupplierId};
