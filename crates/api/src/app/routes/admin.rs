//! Node administration: submission gate and loop statistics.

use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::info;

use crate::app::dto::{AcceptingResponse, SetAcceptingRequest};
use crate::app::errors;
use crate::app::services::AppServices;

/// GET /admin/accepting
pub async fn accepting(Extension(services): Extension<Arc<AppServices>>) -> Json<AcceptingResponse> {
    Json(AcceptingResponse {
        node_id: services.node_id(),
        accepting: services.jobs.is_accepting(),
    })
}

/// POST /admin/accepting - enable or disable new submissions on this node
pub async fn set_accepting(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<SetAcceptingRequest>,
) -> Json<AcceptingResponse> {
    services.jobs.set_accepting(body.accepting);
    info!(node_id = %services.node_id(), accepting = body.accepting, "submission gate changed");
    Json(AcceptingResponse {
        node_id: services.node_id(),
        accepting: body.accepting,
    })
}

/// GET /admin/scheduler - heartbeat/GC loop counters
pub async fn scheduler_stats(Extension(services): Extension<Arc<AppServices>>) -> Response {
    match services.scheduler_stats() {
        Some(stats) => Json(stats).into_response(),
        None => errors::json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "scheduler_stopped",
            "scheduler loops are not running",
        ),
    }
}
