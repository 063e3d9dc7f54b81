//! Postgres-backed event store (`postgres` feature).
//!
//! One `indicator_events` table holds every stream. Tenant isolation is a
//! WHERE clause on every statement; optimistic concurrency is a version check
//! inside the append transaction, backed by the primary key on
//! `(tenant_id, aggregate_id, sequence_number)` so a concurrent append loses
//! with a unique violation rather than corrupting the stream.
//!
//! Expected schema:
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS indicator_events (
//!     event_id        UUID PRIMARY KEY,
//!     tenant_id       UUID NOT NULL,
//!     aggregate_id    UUID NOT NULL,
//!     aggregate_type  TEXT NOT NULL,
//!     sequence_number BIGINT NOT NULL CHECK (sequence_number > 0),
//!     event_type      TEXT NOT NULL,
//!     event_version   INT NOT NULL,
//!     occurred_at     TIMESTAMPTZ NOT NULL,
//!     payload         JSONB NOT NULL,
//!     UNIQUE (tenant_id, aggregate_id, sequence_number)
//! );
//! ```

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use pulse_core::{AggregateId, ExpectedVersion, TenantId};

use super::query::{EventFilter, EventQuery, EventQueryResult, Pagination};
use super::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

/// Postgres append-only event store. Cloneable; the pool is shared.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn load_stream_async(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, tenant_id, aggregate_id, aggregate_type,
                   sequence_number, event_type, event_version, occurred_at, payload
            FROM indicator_events
            WHERE tenant_id = $1 AND aggregate_id = $2
            ORDER BY sequence_number ASC
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(aggregate_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(backend_error)?;

        rows.iter().map(row_to_event).collect()
    }

    pub async fn append_async(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }

        let tenant_id = events[0].tenant_id;
        let aggregate_id = events[0].aggregate_id;
        let aggregate_type = events[0].aggregate_type.clone();

        for (idx, e) in events.iter().enumerate() {
            if e.tenant_id != tenant_id {
                return Err(EventStoreError::TenantIsolation(format!(
                    "batch contains multiple tenant_ids (index {idx})"
                )));
            }
            if e.aggregate_id != aggregate_id {
                return Err(EventStoreError::InvalidAppend(format!(
                    "batch contains multiple aggregate_ids (index {idx})"
                )));
            }
            if e.aggregate_type != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "batch contains multiple aggregate_types (index {idx})"
                )));
            }
        }

        let mut tx = self.pool.begin().await.map_err(backend_error)?;

        let head = sqlx::query(
            r#"
            SELECT sequence_number, aggregate_type
            FROM indicator_events
            WHERE tenant_id = $1 AND aggregate_id = $2
            ORDER BY sequence_number DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(aggregate_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend_error)?;

        let mut current: u64 = 0;
        if let Some(row) = head {
            current = row.get::<i64, _>("sequence_number") as u64;
            let existing_type: String = row.get("aggregate_type");
            if existing_type != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "stream aggregate_type is '{existing_type}', attempted append with '{aggregate_type}'"
                )));
            }
        }

        if !expected_version.matches(current) {
            return Err(EventStoreError::Concurrency(format!(
                "expected {expected_version:?}, found {current}"
            )));
        }

        let mut committed = Vec::with_capacity(events.len());
        let mut next = current + 1;
        for e in events {
            sqlx::query(
                r#"
                INSERT INTO indicator_events (
                    event_id, tenant_id, aggregate_id, aggregate_type,
                    sequence_number, event_type, event_version, occurred_at, payload
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(e.event_id)
            .bind(tenant_id.as_uuid())
            .bind(aggregate_id.as_uuid())
            .bind(&aggregate_type)
            .bind(next as i64)
            .bind(&e.event_type)
            .bind(e.event_version as i32)
            .bind(e.occurred_at)
            .bind(&e.payload)
            .execute(&mut *tx)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    EventStoreError::Concurrency(format!(
                        "concurrent append detected at sequence_number {next}"
                    ))
                } else {
                    backend_error(err)
                }
            })?;

            committed.push(StoredEvent {
                event_id: e.event_id,
                tenant_id,
                aggregate_id,
                aggregate_type: aggregate_type.clone(),
                sequence_number: next,
                event_type: e.event_type,
                event_version: e.event_version,
                occurred_at: e.occurred_at,
                payload: e.payload,
            });
            next += 1;
        }

        tx.commit().await.map_err(backend_error)?;
        Ok(committed)
    }
}

impl EventStore for PostgresEventStore {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        block_on_handle(self.append_async(events, expected_version))
    }

    fn load_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        block_on_handle(self.load_stream_async(tenant_id, aggregate_id))
    }
}

#[async_trait::async_trait]
impl EventQuery for PostgresEventStore {
    async fn query_events(
        &self,
        tenant_id: TenantId,
        filter: EventFilter,
        pagination: Pagination,
    ) -> Result<EventQueryResult, EventStoreError> {
        // Dynamic WHERE with fixed parameter slots; unset filters collapse to
        // always-true clauses.
        let rows = sqlx::query(
            r#"
            SELECT event_id, tenant_id, aggregate_id, aggregate_type,
                   sequence_number, event_type, event_version, occurred_at, payload,
                   COUNT(*) OVER () AS total
            FROM indicator_events
            WHERE tenant_id = $1
              AND ($2::uuid IS NULL OR aggregate_id = $2)
              AND ($3::text IS NULL OR aggregate_type = $3)
              AND ($4::text IS NULL OR event_type = $4)
              AND ($5::timestamptz IS NULL OR occurred_at > $5)
              AND ($6::timestamptz IS NULL OR occurred_at < $6)
            ORDER BY occurred_at DESC, sequence_number ASC
            LIMIT $7 OFFSET $8
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(filter.aggregate_id.map(|id| *id.as_uuid()))
        .bind(filter.aggregate_type.clone())
        .bind(filter.event_type.clone())
        .bind(filter.occurred_after)
        .bind(filter.occurred_before)
        .bind(pagination.limit as i64)
        .bind(pagination.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend_error)?;

        let total = rows
            .first()
            .map(|row| row.get::<i64, _>("total") as u64)
            .unwrap_or(0);
        let events = rows
            .iter()
            .map(row_to_event)
            .collect::<Result<Vec<_>, _>>()?;
        let has_more = (pagination.offset as u64 + events.len() as u64) < total;

        Ok(EventQueryResult {
            events,
            total,
            pagination,
            has_more,
        })
    }

    async fn get_event_by_id(
        &self,
        tenant_id: TenantId,
        event_id: Uuid,
    ) -> Result<Option<StoredEvent>, EventStoreError> {
        let row = sqlx::query(
            r#"
            SELECT event_id, tenant_id, aggregate_id, aggregate_type,
                   sequence_number, event_type, event_version, occurred_at, payload
            FROM indicator_events
            WHERE tenant_id = $1 AND event_id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_error)?;

        row.as_ref().map(row_to_event).transpose()
    }
}

/// Run an async store operation from the sync `EventStore` trait.
///
/// Requires a tokio runtime on the current thread (the dispatcher runs from
/// `spawn_blocking` contexts in the API).
fn block_on_handle<F, T>(fut: F) -> Result<T, EventStoreError>
where
    F: std::future::Future<Output = Result<T, EventStoreError>>,
{
    let handle = tokio::runtime::Handle::try_current()
        .map_err(|_| EventStoreError::Backend("no tokio runtime available".to_string()))?;
    tokio::task::block_in_place(|| handle.block_on(fut))
}

fn row_to_event(row: &sqlx::postgres::PgRow) -> Result<StoredEvent, EventStoreError> {
    Ok(StoredEvent {
        event_id: row.get("event_id"),
        tenant_id: TenantId::from_uuid(row.get("tenant_id")),
        aggregate_id: AggregateId::from_uuid(row.get("aggregate_id")),
        aggregate_type: row.get("aggregate_type"),
        sequence_number: row.get::<i64, _>("sequence_number") as u64,
        event_type: row.get("event_type"),
        event_version: row.get::<i32, _>("event_version") as u32,
        occurred_at: row.get::<DateTime<Utc>, _>("occurred_at"),
        payload: row.get("payload"),
    })
}

fn backend_error(err: sqlx::Error) -> EventStoreError {
    EventStoreError::Backend(err.to_string())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
    )
}
