use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use courier_core::JobId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::OperatorContext;

pub fn router() -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/dispatcher", get(dispatcher_stats))
        .route("/enqueue", post(enqueue))
        .route("/dlq/list", post(list_dead))
        .route("/dlq/requeue", post(requeue_dead))
}

pub async fn metrics(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.queue().metrics().await {
        Ok(m) => Json(m).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn dispatcher_stats(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    match services.dispatcher_stats() {
        Some(stats) => Json(stats).into_response(),
        None => errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            "no dispatcher runs in this process",
        ),
    }
}

pub async fn enqueue(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(operator): Extension<OperatorContext>,
    Json(body): Json<dto::EnqueueRequest>,
) -> axum::response::Response {
    let queue = services.queue();
    let result = match body.delay_ms {
        Some(ms) if ms > 0 => {
            queue
                .enqueue_delayed(&body.job_type, body.payload, Duration::from_millis(ms))
                .await
        }
        _ => queue.enqueue(&body.job_type, body.payload).await,
    };

    match result {
        Ok(id) => {
            tracing::debug!(operator = operator.operator(), job_id = %id, "operator enqueued notification");
            (StatusCode::CREATED, Json(dto::Enqueued { id: id.to_string() })).into_response()
        }
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn list_dead(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::ListDeadRequest>,
) -> axum::response::Response {
    match services.queue().list_dead(body.effective_limit()).await {
        Ok(items) => Json(dto::DeadLetterList { items }).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn requeue_dead(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(operator): Extension<OperatorContext>,
    Json(body): Json<dto::RequeueRequest>,
) -> axum::response::Response {
    let job_id: JobId = match body.id.parse() {
        Ok(id) => id,
        Err(e) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", format!("{e}"));
        }
    };

    match services.queue().requeue_dead(job_id).await {
        Ok(outcome) => {
            tracing::info!(
                operator = operator.operator(),
                job_id = %job_id,
                ok = outcome.ok,
                "dead-letter requeue requested"
            );
            Json(outcome).into_response()
        }
        Err(e) => errors::queue_error_to_response(e),
    }
}
