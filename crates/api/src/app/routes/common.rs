use axum::http::StatusCode;
use axum::response::Response;

use asyncjob_infra::jobs::JobManagerError;

use crate::app::errors;

/// Run a manager call off the async runtime.
///
/// The Postgres store blocks on the runtime handle, so manager calls must not
/// run on a runtime worker.
pub async fn blocking<T, F>(f: F) -> Result<T, Response>
where
    F: FnOnce() -> Result<T, JobManagerError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(errors::job_error_to_response(e)),
        Err(e) => Err(errors::json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            format!("handler task failed: {e}"),
        )),
    }
}
