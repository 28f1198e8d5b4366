//! Append-only event store boundary.
//!
//! One stream per aggregate instance (material request, grouped order,
//! supplier order). Streams are addressed by aggregate id; `stream_ids`
//! enumerates the streams of one aggregate type for the engine's queries.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};
