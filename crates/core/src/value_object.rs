//! Value object marker trait.
//!
//! Value objects carry no identity: two instances with equal attribute values
//! are the same value. They are immutable; "changing" one means constructing
//! a new one. `RatingScale` and `DisaggregationCategory` in the indicators
//! crate are typical examples.

/// Marker for immutable, compared-by-value domain objects.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
