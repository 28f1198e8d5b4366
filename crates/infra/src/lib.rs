//! Infrastructure and orchestration: event store, command dispatch, locking,
//! external ports, configuration and the procurement engine services.

pub mod catalog;
pub mod command_dispatcher;
pub mod config;
pub mod engine;
pub mod error;
pub mod event_store;
pub mod locks;
pub mod notifier;
pub mod projections;
pub mod retry;

pub use catalog::{
    CatalogError, CatalogResolver, InMemoryCatalog, InMemorySupplierDirectory, SupplierDirectory,
};
pub use command_dispatcher::{CommandDispatcher, Committed, DispatchError};
pub use config::EngineConfig;
pub use engine::{
    AllocationReport, AllocationView, DeliveredShare, DeliveryReport, LineAllocation, LineReport,
    NewRequest, PendingLine, ProcurementEngine,
};
pub use error::{EngineError, EngineResult};
pub use event_store::{EventStore, EventStoreError, InMemoryEventStore};
pub use notifier::{BusNotifier, Notifier, NotifyError, ProcurementNotice};
pub use projections::{GroupedOrderIndex, IndexError};
pub use retry::{BackoffStrategy, RetryPolicy};
