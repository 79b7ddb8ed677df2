use axum::{
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};

use crate::http::{AppError, AppState};

/// Prometheus exposition content type
const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

pub fn create_metrics_router() -> Router<AppState> {
    Router::new().route("/metrics", get(metrics_handler))
}

pub async fn metrics_handler() -> Result<impl IntoResponse, AppError> {
    let body = cavisense_core::metrics::render().map_err(|e| {
        tracing::error!("Failed to render metrics: {}", e);
        AppError::internal("Failed to render metrics")
    })?;

    Ok((StatusCode::OK, [(header::CONTENT_TYPE, CONTENT_TYPE)], body))
}
