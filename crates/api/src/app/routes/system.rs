use std::sync::Arc;

use axum::{extract::Extension, Json};
use serde_json::json;

use crate::app::services::AppServices;

pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "node_id": services.node_id(),
        "accepting": services.jobs.is_accepting(),
    }))
}
