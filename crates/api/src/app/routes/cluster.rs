use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::info;

use asyncjob_events::ClusterEvent;

use crate::app::routes::common::blocking;
use crate::app::services::AppServices;

/// POST /cluster/events - membership change from the liveness tracker
///
/// Recovery for departed nodes runs before the response is sent.
pub async fn ingest_event(
    Extension(services): Extension<Arc<AppServices>>,
    Json(event): Json<ClusterEvent>,
) -> Response {
    info!(event = ?event, "cluster event received");
    let jobs = services.jobs.clone();
    match blocking(move || {
        jobs.on_cluster_event(&event);
        Ok(())
    })
    .await
    {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(response) => response,
    }
}
