use chrono::{DateTime, Utc};

/// A domain event: an immutable, versioned fact.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name (e.g. "indicators.indicator.value_recorded").
    fn event_type(&self) -> &'static str;

    /// Schema version of this event type (for evolution).
    fn version(&self) -> u32;

    /// Business time at which the event occurred.
    fn occurred_at(&self) -> DateTime<Utc>;
}
