//! `pulse-infra` — infrastructure for the indicator domain.
//!
//! Event storage and dispatch, read-model projections, the response cache,
//! and background work. Everything here composes the traits from
//! `pulse-core`/`pulse-events`; the in-memory implementations back tests and
//! dev, the `postgres`/`redis` features swap in persistent backends.

pub mod cache;
pub mod command_dispatcher;
pub mod event_store;
pub mod jobs;
pub mod projections;
pub mod read_model;
pub mod workers;


pub use cache::{InMemoryResponseCache, ResponseCache};
pub use command_dispatcher::{CommandDispatcher, DispatchError};
pub use event_store::{
    EventFilter, EventQuery, EventQueryResult, EventStore, EventStoreError, InMemoryEventStore,
    Pagination, StoredEvent, UncommittedEvent,
};
pub use read_model::{InMemoryTenantStore, TenantStore};
