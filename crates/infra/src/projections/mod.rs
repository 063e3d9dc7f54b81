//! Read model builders.
//!
//! Projections consume envelopes off the bus and keep query-optimized views:
//! rebuildable from the stream, tenant-isolated, and idempotent under
//! at-least-once delivery. Each projection tracks a per-stream cursor:
//! duplicates are skipped silently, gaps are an error (the stream must be
//! replayed from the store).

pub mod progress;
pub mod registry;
pub mod value_series;

pub use progress::{ProgressProjection, ProgressReadModel};
pub use registry::{IndicatorReadModel, IndicatorRegistryProjection};
pub use value_series::{ValuePoint, ValueSeriesProjection, ValueSeriesReadModel};

use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;

use pulse_core::{AggregateId, TenantId};

/// Error shared by all indicator projections.
#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("failed to deserialize indicator event: {0}")]
    Deserialize(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },
}

/// What to do with an incoming envelope, per the stream cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CursorStep {
    Apply,
    Skip,
}

/// Per-stream sequence cursor shared by the projections.
#[derive(Debug, Default)]
pub(crate) struct StreamCursors {
    inner: RwLock<HashMap<(TenantId, AggregateId), u64>>,
}

impl StreamCursors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether `seq` should be applied. Duplicates (at or below the
    /// cursor) are skipped; anything that would leave a gap is rejected.
    pub fn check(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        seq: u64,
    ) -> Result<CursorStep, ProjectionError> {
        let last = match self.inner.read() {
            Ok(map) => *map.get(&(tenant_id, aggregate_id)).unwrap_or(&0),
            Err(_) => 0,
        };

        if seq == 0 {
            return Err(ProjectionError::NonMonotonicSequence { last, found: seq });
        }
        if seq <= last {
            return Ok(CursorStep::Skip);
        }
        if last != 0 && seq != last + 1 {
            return Err(ProjectionError::NonMonotonicSequence { last, found: seq });
        }
        Ok(CursorStep::Apply)
    }

    pub fn advance(&self, tenant_id: TenantId, aggregate_id: AggregateId, seq: u64) {
        if let Ok(mut map) = self.inner.write() {
            map.insert((tenant_id, aggregate_id), seq);
        }
    }

    pub fn clear_tenant(&self, tenant_id: TenantId) {
        if let Ok(mut map) = self.inner.write() {
            map.retain(|(t, _), _| *t != tenant_id);
        }
    }
}
