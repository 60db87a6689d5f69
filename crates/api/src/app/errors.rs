use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use asyncjob_infra::job_store::StoreError;
use asyncjob_infra::jobs::JobManagerError;

pub fn job_error_to_response(err: JobManagerError) -> axum::response::Response {
    match err {
        JobManagerError::ShuttingDown => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "not_accepting",
            "this node is not accepting jobs",
        ),
        JobManagerError::UnknownDispatcher(name) => json_error(
            StatusCode::BAD_REQUEST,
            "unknown_dispatcher",
            format!("no dispatcher registered as `{name}`"),
        ),
        JobManagerError::InvalidArgument(msg) => {
            json_error(StatusCode::BAD_REQUEST, "invalid_argument", msg)
        }
        JobManagerError::Store(e) => store_error_to_response(e),
    }
}

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err {
        StoreError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        StoreError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        StoreError::StoreFull(msg) => json_error(StatusCode::INSUFFICIENT_STORAGE, "store_full", msg),
        e => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string()),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manager_errors_map_to_statuses() {
        let cases = [
            (JobManagerError::ShuttingDown, StatusCode::SERVICE_UNAVAILABLE),
            (JobManagerError::UnknownDispatcher("x".into()), StatusCode::BAD_REQUEST),
            (JobManagerError::InvalidArgument("x".into()), StatusCode::BAD_REQUEST),
            (StoreError::NotFound("job 1".into()).into(), StatusCode::NOT_FOUND),
            (StoreError::Conflict("dup".into()).into(), StatusCode::CONFLICT),
            (StoreError::LockPoisoned.into(), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(job_error_to_response(err).status(), status);
        }
    }
}
