use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use courier_infra::jobs::QueueError;

pub fn queue_error_to_response(err: QueueError) -> axum::response::Response {
    match err {
        QueueError::Invalid(e) => json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()),
        QueueError::Store(e) => {
            tracing::error!(error = %e, "job store unavailable");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", e.to_string())
        }
        QueueError::Backend(msg) => json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", msg),
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
