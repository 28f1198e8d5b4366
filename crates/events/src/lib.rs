//! Event mechanics shared by the domain crates and the engine.
//!
//! - [`Event`]: typed domain events (facts, append-only)
//! - [`EventEnvelope`]: stream metadata around a committed event
//! - [`EventBus`]: publish/subscribe after a successful append
//! - [`execute`]: decide + apply in one step (tests, inline processing)

pub mod bus;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use handler::execute;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
