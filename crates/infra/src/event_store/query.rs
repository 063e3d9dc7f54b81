//! Read-only event inspection: tenant-scoped, filtered, paginated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pulse_core::{AggregateId, TenantId};

use super::{EventStoreError, StoredEvent};

/// Pagination parameters. `limit` is capped for safety.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self { limit: 50, offset: 0 }
    }
}

impl Pagination {
    pub const MAX_LIMIT: u32 = 1000;

    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).min(Self::MAX_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }
}

/// Filter criteria; all fields are optional and combined with AND.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    pub aggregate_id: Option<AggregateId>,
    pub aggregate_type: Option<String>,
    pub event_type: Option<String>,
    pub occurred_after: Option<DateTime<Utc>>,
    pub occurred_before: Option<DateTime<Utc>>,
}

impl EventFilter {
    pub fn matches(&self, event: &StoredEvent) -> bool {
        if let Some(id) = self.aggregate_id {
            if event.aggregate_id != id {
                return false;
            }
        }
        if let Some(at) = &self.aggregate_type {
            if &event.aggregate_type != at {
                return false;
            }
        }
        if let Some(et) = &self.event_type {
            if &event.event_type != et {
                return false;
            }
        }
        if let Some(after) = self.occurred_after {
            if event.occurred_at <= after {
                return false;
            }
        }
        if let Some(before) = self.occurred_before {
            if event.occurred_at >= before {
                return false;
            }
        }
        true
    }
}

/// One page of query results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventQueryResult {
    pub events: Vec<StoredEvent>,
    /// Total matches across all pages.
    pub total: u64,
    pub pagination: Pagination,
    pub has_more: bool,
}

/// Async query interface, ordered by `occurred_at` descending (newest first)
/// with sequence number as tie-breaker.
#[async_trait::async_trait]
pub trait EventQuery: Send + Sync {
    async fn query_events(
        &self,
        tenant_id: TenantId,
        filter: EventFilter,
        pagination: Pagination,
    ) -> Result<EventQueryResult, EventStoreError>;

    /// Convenience: all events of one aggregate stream.
    async fn get_aggregate_events(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        pagination: Option<Pagination>,
    ) -> Result<EventQueryResult, EventStoreError> {
        let filter = EventFilter {
            aggregate_id: Some(aggregate_id),
            ..Default::default()
        };
        self.query_events(tenant_id, filter, pagination.unwrap_or_default())
            .await
    }

    /// Fetch a single event, if it exists and belongs to the tenant.
    async fn get_event_by_id(
        &self,
        tenant_id: TenantId,
        event_id: uuid::Uuid,
    ) -> Result<Option<StoredEvent>, EventStoreError>;
}
