// Cavisense HTTP API
//
// Ingress, health, metrics and the WebSocket push channel

pub mod http;

// Re-export commonly used types
pub use http::{create_push_router, create_router, AppState};
