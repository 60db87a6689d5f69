use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tracing::debug;

use asyncjob_core::JobId;

use crate::app::dto::{JobQuery, JobView, SubmitJobRequest, SubmitJobResponse};
use crate::app::errors;
use crate::app::routes::common::blocking;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/", post(submit_job))
        .route("/active", get(active_jobs))
        .route("/:id", get(get_job))
}

/// POST /jobs - persist and dispatch a job
pub async fn submit_job(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<SubmitJobRequest>,
) -> Response {
    let (job, resource) = body.into_parts();
    let jobs = services.jobs.clone();
    let submitted = blocking(move || match resource {
        Some((key, size_limit)) => jobs.submit_serialized(job, &key, size_limit),
        None => jobs.submit(job),
    })
    .await;

    match submitted {
        Ok(job_id) => (StatusCode::ACCEPTED, Json(SubmitJobResponse { job_id })).into_response(),
        Err(response) => response,
    }
}

/// GET /jobs/:id - job status; `?poll=true` stamps the poll time
pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<i64>,
    Query(query): Query<JobQuery>,
) -> Response {
    let job_id = JobId::new(id);
    let jobs = services.jobs.clone();
    match blocking(move || jobs.query_job(job_id, query.poll)).await {
        Ok(Some(job)) => Json(JobView::from(job)).into_response(),
        Ok(None) => {
            debug!(job_id = %job_id, "job not found");
            errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("job {job_id} not found"))
        }
        Err(response) => response,
    }
}

/// GET /jobs/active - jobs running on this node right now
pub async fn active_jobs(Extension(services): Extension<Arc<AppServices>>) -> Response {
    Json(services.jobs.active_jobs()).into_response()
}
