use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::error;

use stratus_serving::{CoreError, GenerateRequest, LlmService};

/// The URL path clients POST generation requests to.
pub const GENERATE_PATH: &str = "/generate";

pub fn router(service: Arc<LlmService>) -> Router {
    Router::new()
        .route(GENERATE_PATH, post(generate_handler))
        .route("/health", get(health_handler))
        .with_state(service)
}

async fn generate_handler(
    State(service): State<Arc<LlmService>>,
    Json(request): Json<GenerateRequest>,
) -> Response {
    match service.generate(request).await {
        Ok(output) => Json(output).into_response(),
        Err(e) => error_response(e),
    }
}

async fn health_handler() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

fn error_response(e: CoreError) -> Response {
    let status = match &e {
        CoreError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        CoreError::Backpressure(_) => StatusCode::TOO_MANY_REQUESTS,
        CoreError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
        CoreError::OutOfMemory(_) | CoreError::Terminated(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("request failed: {e}");
    }
    (status, Json(json!({"error": e.to_string(), "code": e.code()}))).into_response()
}
