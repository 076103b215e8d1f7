use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use opentelemetry::KeyValue;
use std::time::Instant;
use tracing::info;

use crate::error::AppError;
use crate::models::ModelsListResponse;
use crate::state::AppState;

pub async fn get_models(State(state): State<AppState>) -> Response {
    state
        .metrics
        .requests
        .add(1, &[KeyValue::new("route", "models")]);
    let response = ModelsListResponse {
        object: "list".to_string(),
        data: state.models_cache.get_all(),
    };
    Json(response).into_response()
}

pub async fn chat_completions(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, AppError> {
    let start = Instant::now();
    state
        .metrics
        .requests
        .add(1, &[KeyValue::new("route", "chat_completions")]);

    match state.proxy.serve(request).await {
        Ok(response) => {
            state.metrics.latency_ms.record(
                start.elapsed().as_millis() as f64,
                &[KeyValue::new("route", "chat_completions")],
            );
            info!(
                status = response.status().as_u16(),
                latency_ms = start.elapsed().as_millis() as u64,
                "request dispatched"
            );
            Ok(response)
        }
        Err(err) => {
            state
                .metrics
                .errors
                .add(1, &[KeyValue::new("type", err.error_type.clone())]);
            info!(
                status = err.status.as_u16(),
                error_type = %err.error_type,
                latency_ms = start.elapsed().as_millis() as u64,
                "request failed"
            );
            Err(err)
        }
    }
}

pub async fn get_info() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
