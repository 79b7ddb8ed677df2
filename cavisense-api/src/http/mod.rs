// Module: http
// Ingress, health and metrics routes, plus the WebSocket push channel

pub mod error;
pub mod health;
pub mod ingress;
pub mod metrics;
pub mod websocket;

use axum::{routing::get, Router};
use cavisense_core::Config;
use cavisense_relay::SensorRelay;
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;

pub use error::{AppError, AppResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<SensorRelay>,
    pub config: Arc<Config>,
    /// Open WebSocket sessions, awaited during shutdown
    pub sessions: TaskTracker,
}

impl AppState {
    pub fn new(relay: Arc<SensorRelay>, config: Arc<Config>) -> Self {
        Self {
            relay,
            config,
            sessions: TaskTracker::new(),
        }
    }
}

/// Create the HTTP router: ingress, health and metrics
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::create_health_router())
        .merge(metrics::create_metrics_router())
        .merge(ingress::create_ingress_router(&state))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Create the push channel router (WebSocket upgrade at `push.path`)
pub fn create_push_router(state: AppState) -> Router {
    let path = state.config.push.path.clone();

    Router::new()
        .route(&path, get(websocket::websocket_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
