use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;

use pulse_auth::Permission;
use pulse_core::AggregateId;
use pulse_indicators::{
    DefineIndicator, Indicator, IndicatorCommand, IndicatorId, RecordValue, RetireIndicator,
    ReviseIndicator, evaluate,
};
use pulse_infra::ResponseCache;
use pulse_infra::event_store::Pagination;

use crate::app::routes::common::CmdAuth;
use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(define_indicator).get(list_indicators))
        .route("/progress", get(list_progress))
        .route("/:id", get(get_indicator))
        .route("/:id/revise", post(revise_indicator))
        .route("/:id/retire", post(retire_indicator))
        .route("/:id/values", post(record_value).get(list_values))
        .route("/:id/progress", get(get_progress))
        .route("/:id/calculate", post(calculate))
        .route("/:id/rollup", get(get_rollup))
}

fn parse_id(id: &str) -> Result<AggregateId, axum::response::Response> {
    id.parse().map_err(|_| {
        errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid indicator id")
    })
}

pub async fn define_indicator(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<crate::context::TenantContext>,
    Extension(principal): Extension<crate::context::PrincipalContext>,
    Json(body): Json<dto::DefineIndicatorRequest>,
) -> axum::response::Response {
    let agg = AggregateId::new();
    let indicator_id = IndicatorId::new(agg);

    let cmd = IndicatorCommand::DefineIndicator(DefineIndicator {
        tenant_id: tenant.tenant_id(),
        indicator_id,
        name: body.name,
        description: body.description,
        frequency: body.frequency,
        disaggregation: body.disaggregation,
        spec: body.spec,
        occurred_at: Utc::now(),
    });

    let cmd_auth = CmdAuth {
        inner: cmd,
        required: vec![Permission::new("indicators.define")],
    };
    if let Err(e) = crate::authz::authorize_command(&tenant, &principal, &cmd_auth) {
        return errors::json_error(StatusCode::FORBIDDEN, "forbidden", e.to_string());
    }

    let committed = match services.dispatch::<Indicator>(
        tenant.tenant_id(),
        agg,
        cmd_auth.inner,
        |_t, aggregate_id| Indicator::empty(IndicatorId::new(aggregate_id)),
    ) {
        Ok(c) => c,
        Err(e) => return errors::dispatch_error_to_response(e),
    };

    (
        StatusCode::CREATED,
        Json(serde_json::json!({
            "id": agg.to_string(),
            "events_committed": committed.len(),
        })),
    )
        .into_response()
}

pub async fn list_indicators(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<crate::context::TenantContext>,
    Query(query): Query<dto::ListQuery>,
) -> axum::response::Response {
    let pagination = Pagination::new(query.limit, query.offset);
    let all = services.registry_list(tenant.tenant_id());
    let total = all.len();
    let items = all
        .into_iter()
        .skip(pagination.offset as usize)
        .take(pagination.limit as usize)
        .map(dto::indicator_to_json)
        .collect::<Vec<_>>();

    (
        StatusCode::OK,
        Json(serde_json::json!({ "items": items, "total": total })),
    )
        .into_response()
}

pub async fn get_indicator(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<crate::context::TenantContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let agg = match parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let indicator_id = IndicatorId::new(agg);

    match services.registry_get(tenant.tenant_id(), &indicator_id) {
        Some(rm) => (StatusCode::OK, Json(dto::indicator_to_json(rm))).into_response(),
        None => errors::json_error(StatusCode::NOT_FOUND, "not_found", "indicator not found"),
    }
}

pub async fn revise_indicator(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<crate::context::TenantContext>,
    Extension(principal): Extension<crate::context::PrincipalContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::ReviseIndicatorRequest>,
) -> axum::response::Response {
    let agg = match parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let indicator_id = IndicatorId::new(agg);

    let cmd = IndicatorCommand::ReviseIndicator(ReviseIndicator {
        tenant_id: tenant.tenant_id(),
        indicator_id,
        name: body.name,
        description: body.description,
        frequency: body.frequency,
        disaggregation: body.disaggregation,
        occurred_at: Utc::now(),
    });

    let cmd_auth = CmdAuth {
        inner: cmd,
        required: vec![Permission::new("indicators.revise")],
    };
    if let Err(e) = crate::authz::authorize_command(&tenant, &principal, &cmd_auth) {
        return errors::json_error(StatusCode::FORBIDDEN, "forbidden", e.to_string());
    }

    let committed = match services.dispatch::<Indicator>(
        tenant.tenant_id(),
        agg,
        cmd_auth.inner,
        |_t, aggregate_id| Indicator::empty(IndicatorId::new(aggregate_id)),
    ) {
        Ok(c) => c,
        Err(e) => return errors::dispatch_error_to_response(e),
    };

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "id": agg.to_string(),
            "events_committed": committed.len(),
        })),
    )
        .into_response()
}

pub async fn retire_indicator(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<crate::context::TenantContext>,
    Extension(principal): Extension<crate::context::PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let agg = match parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let indicator_id = IndicatorId::new(agg);

    let cmd = IndicatorCommand::RetireIndicator(RetireIndicator {
        tenant_id: tenant.tenant_id(),
        indicator_id,
        occurred_at: Utc::now(),
    });

    let cmd_auth = CmdAuth {
        inner: cmd,
        required: vec![Permission::new("indicators.retire")],
    };
    if let Err(e) = crate::authz::authorize_command(&tenant, &principal, &cmd_auth) {
        return errors::json_error(StatusCode::FORBIDDEN, "forbidden", e.to_string());
    }

    let committed = match services.dispatch::<Indicator>(
        tenant.tenant_id(),
        agg,
        cmd_auth.inner,
        |_t, aggregate_id| Indicator::empty(IndicatorId::new(aggregate_id)),
    ) {
        Ok(c) => c,
        Err(e) => return errors::dispatch_error_to_response(e),
    };

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "id": agg.to_string(),
            "events_committed": committed.len(),
        })),
    )
        .into_response()
}

pub async fn record_value(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<crate::context::TenantContext>,
    Extension(principal): Extension<crate::context::PrincipalContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::RecordValueRequest>,
) -> axum::response::Response {
    let agg = match parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let indicator_id = IndicatorId::new(agg);

    let cmd = IndicatorCommand::RecordValue(RecordValue {
        tenant_id: tenant.tenant_id(),
        indicator_id,
        kind: body.kind,
        value: body.value,
        measured_at: body.measured_at,
        source: body.source,
        slices: body.slices,
        occurred_at: Utc::now(),
    });

    let cmd_auth = CmdAuth {
        inner: cmd,
        required: vec![Permission::new("indicators.record")],
    };
    if let Err(e) = crate::authz::authorize_command(&tenant, &principal, &cmd_auth) {
        return errors::json_error(StatusCode::FORBIDDEN, "forbidden", e.to_string());
    }

    let committed = match services.dispatch::<Indicator>(
        tenant.tenant_id(),
        agg,
        cmd_auth.inner,
        |_t, aggregate_id| Indicator::empty(IndicatorId::new(aggregate_id)),
    ) {
        Ok(c) => c,
        Err(e) => return errors::dispatch_error_to_response(e),
    };

    (
        StatusCode::CREATED,
        Json(serde_json::json!({
            "id": agg.to_string(),
            "events_committed": committed.len(),
        })),
    )
        .into_response()
}

pub async fn list_values(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<crate::context::TenantContext>,
    Path(id): Path<String>,
    Query(query): Query<dto::ValuesQuery>,
) -> axum::response::Response {
    let agg = match parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let indicator_id = IndicatorId::new(agg);

    let pagination = Pagination::new(query.limit, query.offset);
    match services.series_get(tenant.tenant_id(), &indicator_id) {
        Some(rm) => (
            StatusCode::OK,
            Json(dto::series_to_json(
                rm,
                query.kind,
                pagination.limit,
                pagination.offset,
            )),
        )
            .into_response(),
        None => errors::json_error(StatusCode::NOT_FOUND, "not_found", "indicator not found"),
    }
}

pub async fn get_progress(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<crate::context::TenantContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let agg = match parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let indicator_id = IndicatorId::new(agg);
    let tenant_id = tenant.tenant_id();

    let cache_key = format!("indicators:{agg}:progress");
    if let Some(cached) = services.cache().get(tenant_id, &cache_key) {
        return (StatusCode::OK, Json(cached)).into_response();
    }

    match services.progress_get(tenant_id, &indicator_id) {
        Some(rm) => {
            let payload = dto::progress_to_json(rm);
            services
                .cache()
                .put(tenant_id, &cache_key, payload.clone(), services.cache_ttl());
            (StatusCode::OK, Json(payload)).into_response()
        }
        None => errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            "no progress for this indicator",
        ),
    }
}

pub async fn list_progress(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<crate::context::TenantContext>,
) -> axum::response::Response {
    let items = services
        .progress_list(tenant.tenant_id())
        .into_iter()
        .map(dto::progress_to_json)
        .collect::<Vec<_>>();
    (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response()
}

pub async fn calculate(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<crate::context::TenantContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::CalculateRequest>,
) -> axum::response::Response {
    let agg = match parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let indicator_id = IndicatorId::new(agg);
    let tenant_id = tenant.tenant_id();

    let registry_entry = match services.registry_get(tenant_id, &indicator_id) {
        Some(rm) => rm,
        None => {
            return errors::json_error(StatusCode::NOT_FOUND, "not_found", "indicator not found");
        }
    };

    let method = match body.method.clone().or(registry_entry.calculation) {
        Some(m) => m,
        None => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "validation_error",
                "no calculation method configured; pass one in the request body",
            );
        }
    };

    // Cache key covers the full request shape: method override + filter.
    let request_fingerprint = serde_json::to_string(&body).unwrap_or_default();
    let cache_key = format!("indicators:{agg}:calc:{request_fingerprint}");
    if let Some(cached) = services.cache().get(tenant_id, &cache_key) {
        return (StatusCode::OK, Json(cached)).into_response();
    }

    let inputs = services
        .series_get(tenant_id, &indicator_id)
        .map(|s| s.inputs())
        .unwrap_or_default();

    let result = match evaluate(&method, &inputs, body.filter.as_ref()) {
        Ok(v) => v,
        Err(e) => return errors::calculation_error_to_response(e),
    };

    let payload = serde_json::json!({
        "indicator_id": agg.to_string(),
        "method": serde_json::to_value(&method)
            .ok()
            .and_then(|m| m.get("method").cloned()),
        "inputs": inputs.len(),
        "result": result,
    });
    services
        .cache()
        .put(tenant_id, &cache_key, payload.clone(), services.cache_ttl());

    (StatusCode::OK, Json(payload)).into_response()
}

pub async fn get_rollup(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<crate::context::TenantContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let agg = match parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let indicator_id = IndicatorId::new(agg);

    match services.rollup_get(tenant.tenant_id(), &indicator_id) {
        Some(snapshot) => (StatusCode::OK, Json(dto::rollup_to_json(snapshot))).into_response(),
        None => errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            "no rollup computed for this indicator yet",
        ),
    }
}
