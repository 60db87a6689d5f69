use axum::{
    routing::{get, post},
    Router,
};

pub mod admin;
pub mod cluster;
pub mod common;
pub mod jobs;
pub mod system;

/// Router for all job-manager endpoints.
pub fn router() -> Router {
    Router::new()
        .nest("/jobs", jobs::router())
        .route("/admin/accepting", get(admin::accepting).post(admin::set_accepting))
        .route("/admin/scheduler", get(admin::scheduler_stats))
        .route("/cluster/events", post(cluster::ingest_event))
}
