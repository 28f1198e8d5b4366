//! Command execution pipeline (application-level orchestration).
//!
//! ```text
//! Command
//!   ↓
//! 1. Load events from store
//!   ↓
//! 2. Rehydrate aggregate (apply historical events to rebuild state)
//!   ↓
//! 3. Handle command (pure decision logic, produces events)
//!   ↓
//! 4. Persist events to store (append-only, optimistic concurrency check)
//!   ↓
//! 5. Publish events to bus
//! ```
//!
//! [`CommandDispatcher::execute`] wraps the pipeline in a bounded optimistic
//! retry loop: on a version conflict the stream is reloaded and the command is
//! decided again against the fresh state. When the attempts run out the caller
//! gets [`DispatchError::Contention`].
//!
//! This module contains no IO itself; it composes infrastructure traits.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error};
use uuid::Uuid;

use procura_core::{Aggregate, AggregateId, DomainError, ExpectedVersion};
use procura_events::{EventBus, EventEnvelope};

use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};
use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The aggregate rejected the command (deterministic).
    #[error(transparent)]
    Domain(#[from] DomainError),
    /// Optimistic concurrency failure (stale aggregate version).
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),
    /// Optimistic retries exhausted.
    #[error("still conflicting after {attempts} attempts")]
    Contention { attempts: u32 },
    /// Failed to deserialize historical event payloads into the aggregate event type.
    #[error("failed to deserialize stored event: {0}")]
    Deserialize(String),
    /// Persisting to the event store failed.
    #[error("event store failure: {0}")]
    Store(EventStoreError),
    /// Publication failed after a successful append (at-least-once; retry may duplicate).
    #[error("event publication failed: {0}")]
    Publish(String),
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency(msg) => DispatchError::Concurrency(msg),
            other => DispatchError::Store(other),
        }
    }
}

/// State of an aggregate right after a command was committed.
#[derive(Debug, Clone)]
pub struct Committed<A: Aggregate> {
    pub aggregate: A,
    /// Decided events, in order (empty when the command was a no-op).
    pub events: Vec<A::Event>,
    pub stored: Vec<StoredEvent>,
}

/// Reusable command execution engine for event-sourced aggregates.
///
/// ## Execution Guarantees
///
/// - Events are persisted before publication (if append fails, nothing is published)
/// - Each command operates on a single aggregate instance
/// - A batch decided by one command is appended atomically
///
/// ## Generic Parameters
///
/// - `S`: Event store implementation
/// - `B`: Event bus implementation
#[derive(Debug)]
pub struct CommandDispatcher<S, B> {
    store: S,
    bus: B,
    retry: RetryPolicy,
}

impl<S, B> CommandDispatcher<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self {
            store,
            bus,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn into_parts(self) -> (S, B) {
        (self.store, self.bus)
    }
}

impl<S, B> CommandDispatcher<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Load and rehydrate an aggregate (`make_aggregate` builds the empty instance).
    pub fn load<A>(
        &self,
        aggregate_id: AggregateId,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<A, DispatchError>
    where
        A: Aggregate,
        A::Event: DeserializeOwned,
    {
        let history = self.store.load_stream(aggregate_id)?;
        validate_loaded_stream(aggregate_id, &history)?;

        let mut aggregate = make_aggregate(aggregate_id);
        apply_history(&mut aggregate, &history)?;
        Ok(aggregate)
    }

    /// Dispatch a command once through the full pipeline.
    ///
    /// A version conflict surfaces as [`DispatchError::Concurrency`].
    pub fn dispatch<A>(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        command: A::Command,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<Committed<A>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: procura_events::Event + Serialize + DeserializeOwned,
    {
        let aggregate = self.load(aggregate_id, make_aggregate)?;
        self.commit(aggregate_id, aggregate_type, aggregate, &command)
    }

    /// Decide and commit with bounded optimistic retries.
    ///
    /// `decide` sees the freshly rehydrated aggregate on every attempt and
    /// returns the command to run, or `None` when there is nothing to do.
    pub fn execute<A>(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        make_aggregate: impl Fn(AggregateId) -> A,
        mut decide: impl FnMut(&A) -> Result<Option<A::Command>, DispatchError>,
    ) -> Result<Committed<A>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: procura_events::Event + Serialize + DeserializeOwned,
    {
        let outcome = self.retry.run(
            |attempt| {
                let aggregate = self.load(aggregate_id, &make_aggregate)?;
                let Some(command) = decide(&aggregate)? else {
                    return Ok(Committed {
                        aggregate,
                        events: vec![],
                        stored: vec![],
                    });
                };
                let result = self.commit(aggregate_id, aggregate_type, aggregate, &command);
                if let Err(DispatchError::Concurrency(reason)) = &result {
                    debug!(%aggregate_id, aggregate_type, attempt, %reason, "append lost a race, retrying");
                }
                result
            },
            |err| matches!(err, DispatchError::Concurrency(_)),
        );

        match outcome {
            Ok(committed) => Ok(committed),
            Err((DispatchError::Concurrency(_), attempts)) => {
                error!(%aggregate_id, aggregate_type, attempts, "optimistic retries exhausted");
                Err(DispatchError::Contention { attempts })
            }
            Err((err, _)) => Err(err),
        }
    }

    fn commit<A>(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        mut aggregate: A,
        command: &A::Command,
    ) -> Result<Committed<A>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: procura_events::Event + Serialize,
    {
        let expected = ExpectedVersion::Exact(aggregate.version());

        // Decide events (no mutation)
        let decided = aggregate.handle(command)?;
        if decided.is_empty() {
            return Ok(Committed {
                aggregate,
                events: decided,
                stored: vec![],
            });
        }

        // Persist (append-only, optimistic)
        let uncommitted = decided
            .iter()
            .map(|ev| UncommittedEvent::from_typed(aggregate_id, aggregate_type, Uuid::now_v7(), ev))
            .collect::<Result<Vec<_>, _>>()?;
        let stored = self.store.append(uncommitted, expected)?;

        for ev in &decided {
            aggregate.apply(ev);
        }

        // Publish committed events (after append)
        for event in &stored {
            self.bus
                .publish(event.to_envelope())
                .map_err(|e| DispatchError::Publish(format!("{e:?}")))?;
        }

        Ok(Committed {
            aggregate,
            events: decided,
            stored,
        })
    }
}

fn validate_loaded_stream(
    aggregate_id: AggregateId,
    stream: &[StoredEvent],
) -> Result<(), DispatchError> {
    // A buggy backend must not leak another stream into this aggregate, and the
    // stream must be strictly increasing by sequence number.
    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if e.aggregate_id != aggregate_id {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(format!(
                "loaded stream contains wrong aggregate_id at index {idx}"
            ))));
        }
        if e.sequence_number <= last {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(format!(
                "non-monotonic sequence_number in loaded stream (last={last}, found={})",
                e.sequence_number
            ))));
        }
        last = e.sequence_number;
    }
    Ok(())
}

fn apply_history<A>(aggregate: &mut A, history: &[StoredEvent]) -> Result<(), DispatchError>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    for stored in history {
        let ev: A::Event = serde_json::from_value(stored.payload.clone())
            .map_err(|e| DispatchError::Deserialize(e.to_string()))?;
        aggregate.apply(&ev);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use procura_core::AggregateRoot;
    use procura_events::{EventBus, InMemoryEventBus};
    use procura_suppliers::SupplierId;
    use procura_purchasing::{
        GroupedOrder, GroupedOrderCommand, GroupedOrderId, GroupedOrderStatus, OpenGroupedOrder,
    };

    use crate::event_store::InMemoryEventStore;

    type Dispatcher =
        CommandDispatcher<Arc<InMemoryEventStore>, Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>>;

    fn dispatcher() -> Dispatcher {
        CommandDispatcher::new(
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemoryEventBus::new()),
        )
        .with_retry_policy(RetryPolicy::fixed(3, Duration::ZERO))
    }

    fn open_cmd(id: GroupedOrderId) -> GroupedOrderCommand {
        GroupedOrderCommand::OpenGroupedOrder(OpenGroupedOrder {
            grouped_order_id: id,
            supplier_id: SupplierId::generate(),
            auto_validate_on_threshold: false,
            occurred_at: Utc::now(),
        })
    }

    fn make(id: AggregateId) -> GroupedOrder {
        GroupedOrder::empty(GroupedOrderId::new(id))
    }

    #[test]
    fn dispatch_persists_then_publishes() {
        let d = dispatcher();
        let subscription = d.bus().subscribe();
        let id = GroupedOrderId::generate();

        let committed = d
            .dispatch(id.aggregate_id(), "purchasing.grouped_order", open_cmd(id), make)
            .unwrap();

        assert_eq!(committed.stored.len(), 1);
        assert_eq!(committed.aggregate.status(), GroupedOrderStatus::Open);
        assert_eq!(committed.aggregate.version(), 1);

        let published = subscription.drain();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].event_type(), "purchasing.grouped_order.opened");
        assert_eq!(published[0].sequence_number(), 1);
    }

    #[test]
    fn rejected_command_publishes_nothing() {
        let d = dispatcher();
        let id = GroupedOrderId::generate();
        d.dispatch(id.aggregate_id(), "purchasing.grouped_order", open_cmd(id), make)
            .unwrap();

        let subscription = d.bus().subscribe();
        let err = d
            .dispatch(id.aggregate_id(), "purchasing.grouped_order", open_cmd(id), make)
            .unwrap_err();
        assert!(matches!(err, DispatchError::Domain(DomainError::Conflict(_))));
        assert!(subscription.drain().is_empty());
    }

    #[test]
    fn load_rehydrates_from_history() {
        let d = dispatcher();
        let id = GroupedOrderId::generate();
        d.dispatch(id.aggregate_id(), "purchasing.grouped_order", open_cmd(id), make)
            .unwrap();

        let order = d.load(id.aggregate_id(), make).unwrap();
        assert!(order.exists());
        assert_eq!(order.version(), 1);
    }

    #[test]
    fn execute_retries_after_losing_a_race() {
        let d = dispatcher();
        let id = GroupedOrderId::generate();
        let mut attempts = 0;

        let committed = d
            .execute(id.aggregate_id(), "purchasing.grouped_order", make, |order| {
                attempts += 1;
                if attempts == 1 {
                    // A competing writer creates the stream between load and append.
                    d.dispatch(id.aggregate_id(), "purchasing.grouped_order", open_cmd(id), make)?;
                }
                if order.exists() {
                    return Ok(None);
                }
                Ok(Some(open_cmd(id)))
            })
            .unwrap();

        assert_eq!(attempts, 2);
        assert!(committed.events.is_empty());
        assert!(committed.aggregate.exists());
    }

    #[test]
    fn execute_gives_up_with_contention() {
        let d = dispatcher();
        let id = GroupedOrderId::generate();

        let err = d
            .execute(id.aggregate_id(), "purchasing.grouped_order", make, |_| {
                // Every attempt races against a fresh competing append.
                let competing = GroupedOrderId::new(id.aggregate_id());
                let _ = d.store().append(
                    vec![
                        UncommittedEvent::from_typed(
                            competing.aggregate_id(),
                            "purchasing.grouped_order",
                            Uuid::now_v7(),
                            &procura_purchasing::GroupedOrderEvent::ThresholdAlertAcknowledged(
                                procura_purchasing::ThresholdAlertAcknowledged {
                                    grouped_order_id: competing,
                                    occurred_at: Utc::now(),
                                },
                            ),
                        )
                        .unwrap(),
                    ],
                    ExpectedVersion::Any,
                );
                Ok(Some(open_cmd(id)))
            })
            .unwrap_err();

        assert!(matches!(err, DispatchError::Contention { attempts: 3 }));
    }
}
