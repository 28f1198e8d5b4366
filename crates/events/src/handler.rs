/// Execute an aggregate command deterministically (no IO).
///
/// 1. **Decide**: `aggregate.handle(command)` produces events without mutating state.
/// 2. **Evolve**: each event is applied in order.
///
/// The engine goes through `CommandDispatcher` instead (persistence,
/// publication, optimistic concurrency); this helper is for domain tests and
/// inline processing.
pub fn execute<A>(aggregate: &mut A, command: &A::Command) -> Result<Vec<A::Event>, A::Error>
where
    A: procura_core::Aggregate,
{
    let events = A::handle(aggregate, command)?;
    for ev in &events {
        A::apply(aggregate, ev);
    }
    Ok(events)
}
