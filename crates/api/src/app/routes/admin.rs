//! Operator endpoints: event inspection and job management.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use pulse_auth::Permission;
use pulse_core::AggregateId;
use pulse_infra::event_store::{EventFilter, Pagination, StoredEvent};
use pulse_infra::jobs::{Job, JobKind, JobStatus, JobStore};

use crate::app::routes::common::CmdAuth;
use crate::app::services::AppServices;
use crate::app::errors;
use crate::context::{PrincipalContext, TenantContext};

pub fn router() -> Router {
    Router::new()
        .route("/events", get(list_events))
        .route("/events/aggregates/:id", get(get_aggregate_events))
        .route("/events/:event_id", get(get_event))
        .route("/jobs", post(enqueue_job).get(list_jobs))
        .route("/jobs/stats", get(job_stats))
        .route("/jobs/dead_letters", get(list_dead_letters))
        .route("/jobs/:id/retry", post(retry_dead_letter))
}

fn require(
    tenant: &TenantContext,
    principal: &PrincipalContext,
    permission: &'static str,
) -> Result<(), axum::response::Response> {
    let guard = CmdAuth {
        inner: (),
        required: vec![Permission::new(permission)],
    };
    crate::authz::authorize_command(tenant, principal, &guard)
        .map_err(|e| errors::json_error(StatusCode::FORBIDDEN, "forbidden", e.to_string()))
}

// ── Events ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct EventListQuery {
    pub aggregate_id: Option<String>,
    pub aggregate_type: Option<String>,
    pub event_type: Option<String>,
    pub occurred_after: Option<DateTime<Utc>>,
    pub occurred_before: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

fn stored_event_to_json(e: &StoredEvent) -> serde_json::Value {
    serde_json::json!({
        "event_id": e.event_id.to_string(),
        "aggregate_id": e.aggregate_id.to_string(),
        "aggregate_type": e.aggregate_type,
        "sequence_number": e.sequence_number,
        "event_type": e.event_type,
        "event_version": e.event_version,
        "occurred_at": e.occurred_at.to_rfc3339(),
        "payload": e.payload,
    })
}

pub async fn list_events(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Query(query): Query<EventListQuery>,
) -> axum::response::Response {
    if let Err(resp) = require(&tenant, &principal, "admin.events") {
        return resp;
    }

    let aggregate_id = match &query.aggregate_id {
        Some(raw) => match raw.parse::<AggregateId>() {
            Ok(id) => Some(id),
            Err(_) => {
                return errors::json_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_id",
                    "invalid aggregate id",
                );
            }
        },
        None => None,
    };

    let filter = EventFilter {
        aggregate_id,
        aggregate_type: query.aggregate_type,
        event_type: query.event_type,
        occurred_after: query.occurred_after,
        occurred_before: query.occurred_before,
    };
    let pagination = Pagination::new(query.limit, query.offset);

    match services
        .query_events(tenant.tenant_id(), filter, pagination)
        .await
    {
        Ok(result) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "events": result.events.iter().map(stored_event_to_json).collect::<Vec<_>>(),
                "total": result.total,
                "has_more": result.has_more,
            })),
        )
            .into_response(),
        Err(e) => errors::json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_error",
            e.to_string(),
        ),
    }
}

pub async fn get_aggregate_events(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Query(query): Query<EventListQuery>,
) -> axum::response::Response {
    if let Err(resp) = require(&tenant, &principal, "admin.events") {
        return resp;
    }

    let aggregate_id: AggregateId = match id.parse() {
        Ok(v) => v,
        Err(_) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid aggregate id");
        }
    };

    let pagination = Pagination::new(query.limit, query.offset);
    match services
        .get_aggregate_events(tenant.tenant_id(), aggregate_id, Some(pagination))
        .await
    {
        Ok(result) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "events": result.events.iter().map(stored_event_to_json).collect::<Vec<_>>(),
                "total": result.total,
                "has_more": result.has_more,
            })),
        )
            .into_response(),
        Err(e) => errors::json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_error",
            e.to_string(),
        ),
    }
}

pub async fn get_event(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(event_id): Path<String>,
) -> axum::response::Response {
    if let Err(resp) = require(&tenant, &principal, "admin.events") {
        return resp;
    }

    let event_id: uuid::Uuid = match event_id.parse() {
        Ok(v) => v,
        Err(_) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid event id");
        }
    };

    match services.get_event_by_id(tenant.tenant_id(), event_id).await {
        Ok(Some(event)) => (StatusCode::OK, Json(stored_event_to_json(&event))).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "event not found"),
        Err(e) => errors::json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_error",
            e.to_string(),
        ),
    }
}

// ── Jobs ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnqueueJobRequest {
    Rollup { indicator: Option<String> },
    ProjectionRebuild { projection: String },
}

#[derive(Debug, Deserialize)]
pub struct JobListQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

fn parse_status(s: &str) -> Option<JobStatus> {
    match s {
        "pending" => Some(JobStatus::Pending),
        "running" => Some(JobStatus::Running),
        "completed" => Some(JobStatus::Completed),
        "failed" => Some(JobStatus::Failed {
            error: String::new(),
            attempt: 0,
        }),
        "dead_lettered" => Some(JobStatus::DeadLettered {
            error: String::new(),
            attempts: 0,
        }),
        "cancelled" => Some(JobStatus::Cancelled),
        _ => None,
    }
}

fn job_to_json(job: &Job) -> serde_json::Value {
    serde_json::json!({
        "id": job.id.to_string(),
        "kind": serde_json::to_value(&job.kind).unwrap_or_default(),
        "status": serde_json::to_value(&job.status).unwrap_or_default(),
        "attempt": job.attempt,
        "created_at": job.created_at.to_rfc3339(),
        "updated_at": job.updated_at.to_rfc3339(),
        "scheduled_at": job.scheduled_at.map(|t| t.to_rfc3339()),
    })
}

pub async fn enqueue_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Json(body): Json<EnqueueJobRequest>,
) -> axum::response::Response {
    if let Err(resp) = require(&tenant, &principal, "admin.jobs") {
        return resp;
    }

    let kind = match body {
        EnqueueJobRequest::Rollup { indicator } => JobKind::rollup(indicator),
        EnqueueJobRequest::ProjectionRebuild { projection } => {
            JobKind::projection_rebuild(projection)
        }
    };

    let job = Job::new(tenant.tenant_id(), kind, serde_json::json!({}));
    match services.enqueue_job(job) {
        Ok(id) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "job_id": id.to_string() })),
        )
            .into_response(),
        Err(e) => errors::json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "job_error",
            e.to_string(),
        ),
    }
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Query(query): Query<JobListQuery>,
) -> axum::response::Response {
    if let Err(resp) = require(&tenant, &principal, "admin.jobs") {
        return resp;
    }

    let status = match &query.status {
        Some(raw) => match parse_status(raw) {
            Some(s) => Some(s),
            None => {
                return errors::json_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_status",
                    "status must be one of: pending, running, completed, failed, dead_lettered, cancelled",
                );
            }
        },
        None => None,
    };

    match services
        .jobs()
        .list_by_status(tenant.tenant_id(), status, query.limit.unwrap_or(50))
    {
        Ok(jobs) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "items": jobs.iter().map(job_to_json).collect::<Vec<_>>(),
            })),
        )
            .into_response(),
        Err(e) => errors::json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "job_error",
            e.to_string(),
        ),
    }
}

pub async fn job_stats(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
) -> axum::response::Response {
    if let Err(resp) = require(&tenant, &principal, "admin.jobs") {
        return resp;
    }

    match services.jobs().stats(tenant.tenant_id()) {
        Ok(stats) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "queue": stats,
                "runner": services.job_runner_stats(),
            })),
        )
            .into_response(),
        Err(e) => errors::json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "job_error",
            e.to_string(),
        ),
    }
}

pub async fn list_dead_letters(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Query(query): Query<JobListQuery>,
) -> axum::response::Response {
    if let Err(resp) = require(&tenant, &principal, "admin.jobs") {
        return resp;
    }

    match services
        .jobs()
        .list_dead_letters(tenant.tenant_id(), query.limit.unwrap_or(50))
    {
        Ok(entries) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "items": entries.iter().map(|e| serde_json::json!({
                    "job": job_to_json(&e.job),
                    "reason": e.reason,
                    "dead_lettered_at": e.dead_lettered_at.to_rfc3339(),
                })).collect::<Vec<_>>(),
            })),
        )
            .into_response(),
        Err(e) => errors::json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "job_error",
            e.to_string(),
        ),
    }
}

pub async fn retry_dead_letter(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    if let Err(resp) = require(&tenant, &principal, "admin.jobs") {
        return resp;
    }

    let job_id = match id.parse::<uuid::Uuid>() {
        Ok(v) => pulse_infra::jobs::JobId(v),
        Err(_) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id");
        }
    };

    match services.jobs().retry_dead_letter(tenant.tenant_id(), job_id) {
        Ok(job) => (StatusCode::OK, Json(job_to_json(&job))).into_response(),
        Err(pulse_infra::jobs::JobStoreError::NotFound(_)) => {
            errors::json_error(StatusCode::NOT_FOUND, "not_found", "job not found")
        }
        Err(e) => errors::json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "job_error",
            e.to_string(),
        ),
    }
}
