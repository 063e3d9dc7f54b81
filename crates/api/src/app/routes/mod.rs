use axum::{Router, routing::get};

pub mod admin;
pub mod common;
pub mod indicators;
pub mod system;

/// Router for all authenticated (tenant-scoped) endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .route("/stream", get(system::stream))
        .nest("/indicators", indicators::router())
        .nest("/admin", admin::router())
}
