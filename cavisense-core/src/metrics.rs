//! Prometheus metrics for the relay
//!
//! Everything is registered in [`REGISTRY`] and rendered by the `/metrics`
//! endpoint.

use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, Encoder, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder,
};

/// Global metrics registry
pub static REGISTRY: std::sync::LazyLock<Registry> = std::sync::LazyLock::new(Registry::new);

/// Ingress requests by outcome (`accepted`, `malformed`, `failed`, `rejected_method`)
pub static INGRESS_REQUESTS: std::sync::LazyLock<IntCounterVec> = std::sync::LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        "ingress_requests_total",
        "Sensor ingress requests by outcome",
        &["outcome"],
        REGISTRY.clone()
    )
    .expect("Failed to register INGRESS_REQUESTS")
});

/// Updates passing through each relay stage
pub static RELAY_UPDATES: std::sync::LazyLock<IntCounterVec> = std::sync::LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        "relay_updates_total",
        "Sensor updates by relay stage",
        &["stage"],
        REGISTRY.clone()
    )
    .expect("Failed to register RELAY_UPDATES")
});

/// Envelopes enqueued to viewer connections
pub static BROADCAST_DELIVERIES: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
    register_int_counter_with_registry!(
        "relay_broadcast_deliveries_total",
        "Envelopes enqueued to viewer connections",
        REGISTRY.clone()
    )
    .expect("Failed to register BROADCAST_DELIVERIES")
});

/// Connections removed from the registry by reason
pub static PRUNED_CONNECTIONS: std::sync::LazyLock<IntCounterVec> = std::sync::LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        "relay_pruned_connections_total",
        "Viewer connections pruned from the registry",
        &["reason"],
        REGISTRY.clone()
    )
    .expect("Failed to register PRUNED_CONNECTIONS")
});

/// Store/broker link failures (`store`, `publish`, `subscribe`)
pub static LINK_ERRORS: std::sync::LazyLock<IntCounterVec> = std::sync::LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        "relay_link_errors_total",
        "Store and broker link failures",
        &["link"],
        REGISTRY.clone()
    )
    .expect("Failed to register LINK_ERRORS")
});

/// Currently open push connections
pub static WS_ACTIVE_CONNECTIONS: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
    register_int_gauge_with_registry!(
        "ws_active_connections",
        "Open viewer WebSocket connections",
        REGISTRY.clone()
    )
    .expect("Failed to register WS_ACTIVE_CONNECTIONS")
});

/// Render all registered metrics in the Prometheus text format
pub fn render() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_touched_metrics() {
        RELAY_UPDATES.with_label_values(&["received"]).inc();
        WS_ACTIVE_CONNECTIONS.inc();
        WS_ACTIVE_CONNECTIONS.dec();

        let text = render().unwrap();
        assert!(text.contains("relay_updates_total"));
        assert!(text.contains("ws_active_connections"));
    }
}
