/// Execute an aggregate command deterministically: decide, then evolve.
///
/// Shortcut for tests and inline flows that don't need persistence or
/// publication. Production command paths go through
/// `pulse-infra::CommandDispatcher`, which adds the store, the bus, tenant
/// isolation, and optimistic concurrency.
pub fn execute<A>(aggregate: &mut A, command: &A::Command) -> Result<Vec<A::Event>, A::Error>
where
    A: pulse_core::Aggregate,
{
    let events = A::handle(aggregate, command)?;
    for ev in &events {
        A::apply(aggregate, ev);
    }
    Ok(events)
}
