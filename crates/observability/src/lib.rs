//! Tracing/logging initialization.

pub mod tracing;

pub use self::tracing::init;
