//! `pulse-events` — event abstraction and in-process distribution.
//!
//! Storage lives in `pulse-infra`; this crate only defines what an event is,
//! how it travels (envelope + bus), and the deterministic execute helper used
//! by tests and inline flows.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod execute;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use execute::execute;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
