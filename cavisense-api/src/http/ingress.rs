//! Sensor ingress endpoint
//!
//! `POST /send-sensor-data` accepts one JSON object per reading, stamps it
//! with `receivedAt` and hands it to the relay. Every response on this route
//! carries the CORS headers, errors included.

use axum::{
    body::Bytes,
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error, warn};

use cavisense_core::metrics::INGRESS_REQUESTS;
use cavisense_core::SensorPayload;

use crate::http::{AppError, AppResult, AppState};

pub const INGRESS_PATH: &str = "/send-sensor-data";

/// Methods served on the ingress route
pub const ALLOWED_METHODS: &str = "POST, OPTIONS";

pub const ALLOWED_HEADERS: &str = "Content-Type, Authorization";

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

pub fn create_ingress_router(state: &AppState) -> Router<AppState> {
    Router::new()
        .route(
            INGRESS_PATH,
            post(send_sensor_data)
                .options(preflight)
                .fallback(method_not_allowed),
        )
        .route_layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .route_layer(middleware::from_fn_with_state(state.clone(), cors_headers))
}

/// Accept one sensor reading
pub async fn send_sensor_data(State(state): State<AppState>, body: Bytes) -> AppResult<Json<Value>> {
    let payload = SensorPayload::from_ingress_body(&body).map_err(|e| {
        INGRESS_REQUESTS.with_label_values(&["malformed"]).inc();
        warn!(error = %e, "Invalid sensor payload JSON");
        AppError::bad_request("Invalid JSON body")
    })?;

    state.relay.publish_update(&payload).await.map_err(|e| {
        INGRESS_REQUESTS.with_label_values(&["failed"]).inc();
        AppError::from(e)
    })?;

    INGRESS_REQUESTS.with_label_values(&["accepted"]).inc();
    debug!(fields = payload.fields().len(), "Sensor payload accepted");

    Ok(Json(json!({ "status": "ok" })))
}

async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn method_not_allowed() -> Response {
    INGRESS_REQUESTS.with_label_values(&["rejected_method"]).inc();

    let mut response = AppError::method_not_allowed("Method not allowed").into_response();
    response
        .headers_mut()
        .insert(header::ALLOW, HeaderValue::from_static(ALLOWED_METHODS));
    response
}

/// Attach the configured CORS headers to every ingress response
async fn cors_headers(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let origin = state.config.cors.allow_origin.as_str();

    let headers = response.headers_mut();
    match HeaderValue::from_str(origin) {
        Ok(value) => {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
        Err(e) => {
            error!(origin = %origin, error = %e, "Configured CORS origin is not a valid header value");
        }
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOWED_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOWED_HEADERS),
    );
    if origin != "*" {
        headers.append(header::VARY, HeaderValue::from_static("Origin"));
    }

    response
}
