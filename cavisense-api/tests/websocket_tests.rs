//! End-to-end tests for the push channel using a real WebSocket client.
//!
//! Run with: cargo test --test websocket_tests

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::task::TaskTracker;

use cavisense_api::{create_push_router, create_router, AppState};
use cavisense_core::{Config, SensorEnvelope, SensorPayload};
use cavisense_relay::{Broker, MemoryBroker, MemorySnapshotStore, RelaySettings, SensorRelay, SnapshotStore};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

struct TestServer {
    base_url: String,
    ws_url: String,
    relay: Arc<SensorRelay>,
    sessions: TaskTracker,
}

/// Boot one relay instance serving HTTP and the push channel on one listener
async fn boot_server(store: Arc<dyn SnapshotStore>, broker: Arc<dyn Broker>) -> TestServer {
    boot_server_with(Config::default(), store, broker).await
}

async fn boot_server_with(
    config: Config,
    store: Arc<dyn SnapshotStore>,
    broker: Arc<dyn Broker>,
) -> TestServer {
    let relay = Arc::new(SensorRelay::new(
        "test-node",
        RelaySettings::from(&config.relay),
        store,
        broker,
    ));
    relay.start();

    let state = AppState::new(relay.clone(), Arc::new(config));
    let sessions = state.sessions.clone();
    let app = create_router(state.clone()).merge(create_push_router(state));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    }));

    TestServer {
        base_url: format!("http://{addr}"),
        ws_url: format!("ws://{addr}/ws"),
        relay,
        sessions,
    }
}

async fn connect(url: &str) -> WsStream {
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

/// Read the next text message as JSON.
async fn read_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream closed")
            .expect("ws error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Assert no text message arrives within a short window.
async fn assert_silent(ws: &mut WsStream) {
    if let Ok(Some(Ok(Message::Text(text)))) = timeout(Duration::from_millis(200), ws.next()).await {
        panic!("unexpected message: {}", text.as_str());
    }
}

/// Wait until the relay has registered `n` viewers.
async fn wait_for_viewers(relay: &SensorRelay, n: usize) {
    for _ in 0..200 {
        if relay.connection_count() == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {n} viewers, have {}", relay.connection_count());
}

/// POST a reading through a raw HTTP/1.1 request.
async fn post_reading(base_url: &str, body: &str) -> u16 {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let addr = base_url.trim_start_matches("http://");
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "POST /send-sensor-data HTTP/1.1\r\nHost: {addr}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("malformed HTTP response")
}

async fn get_health(base_url: &str) -> Value {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let addr = base_url.trim_start_matches("http://");
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let request = format!("GET /health HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    let body = response.split("\r\n\r\n").nth(1).expect("no body");
    serde_json::from_str(body).unwrap()
}

#[tokio::test]
async fn e2e_ingress_to_viewer() {
    let server = boot_server(Arc::new(MemorySnapshotStore::new()), Arc::new(MemoryBroker::new())).await;
    let mut ws = connect(&server.ws_url).await;
    wait_for_viewers(&server.relay, 1).await;

    // Uninitialized feed: no catch-up
    assert_silent(&mut ws).await;

    assert_eq!(post_reading(&server.base_url, r#"{"temp": 90}"#).await, 200);

    let msg = read_json(&mut ws).await;
    assert_eq!(msg["type"], "sensor:update");
    assert_eq!(msg["payload"]["temp"], 90);
    assert!(msg["payload"]["receivedAt"].is_string());

    assert_eq!(get_health(&server.base_url).await, json!({"status": "ok", "wsClients": 1}));
}

#[tokio::test]
async fn e2e_late_viewer_gets_catch_up() {
    let store = Arc::new(MemorySnapshotStore::new());
    let server = boot_server(store.clone(), Arc::new(MemoryBroker::new())).await;

    let mut early = connect(&server.ws_url).await;
    wait_for_viewers(&server.relay, 1).await;
    assert_eq!(post_reading(&server.base_url, r#"{"rpm": 1450}"#).await, 200);
    let live = read_json(&mut early).await;

    let mut late = connect(&server.ws_url).await;
    let catch_up = read_json(&mut late).await;
    assert_eq!(catch_up, live);
    assert_silent(&mut late).await;
}

#[tokio::test]
async fn e2e_update_crosses_instances() {
    let store: Arc<dyn SnapshotStore> = Arc::new(MemorySnapshotStore::new());
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let a = boot_server(store.clone(), broker.clone()).await;
    let b = boot_server(store, broker).await;

    let mut viewer_b = connect(&b.ws_url).await;
    wait_for_viewers(&b.relay, 1).await;

    assert_eq!(post_reading(&a.base_url, r#"{"pressure": 2.5}"#).await, 200);

    let msg = read_json(&mut viewer_b).await;
    assert_eq!(msg["payload"]["pressure"], 2.5);
}

#[tokio::test]
async fn e2e_client_messages_are_ignored() {
    let server = boot_server(Arc::new(MemorySnapshotStore::new()), Arc::new(MemoryBroker::new())).await;
    let mut ws = connect(&server.ws_url).await;
    wait_for_viewers(&server.relay, 1).await;

    ws.send(Message::text("{\"hello\":\"server\"}")).await.unwrap();
    ws.send(Message::binary(vec![1, 2, 3])).await.unwrap();
    assert_silent(&mut ws).await;

    // Session is still live
    assert_eq!(post_reading(&server.base_url, r#"{"temp": 70}"#).await, 200);
    assert_eq!(read_json(&mut ws).await["payload"]["temp"], 70);
}

#[tokio::test]
async fn e2e_closed_viewer_is_unregistered() {
    let server = boot_server(Arc::new(MemorySnapshotStore::new()), Arc::new(MemoryBroker::new())).await;
    let mut first = connect(&server.ws_url).await;
    let _second = connect(&server.ws_url).await;
    wait_for_viewers(&server.relay, 2).await;

    first.close(None).await.unwrap();
    wait_for_viewers(&server.relay, 1).await;

    assert_eq!(get_health(&server.base_url).await["wsClients"], 1);
}

#[tokio::test]
async fn e2e_relay_stop_closes_viewers() {
    let server = boot_server(Arc::new(MemorySnapshotStore::new()), Arc::new(MemoryBroker::new())).await;
    let mut ws = connect(&server.ws_url).await;
    wait_for_viewers(&server.relay, 1).await;

    server.relay.stop().await;

    let ended = timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "viewer was not disconnected");
}

#[tokio::test]
async fn e2e_sessions_drain_with_close_frame_after_stop() {
    let server = boot_server(Arc::new(MemorySnapshotStore::new()), Arc::new(MemoryBroker::new())).await;
    let mut ws = connect(&server.ws_url).await;
    wait_for_viewers(&server.relay, 1).await;
    assert_eq!(server.sessions.len(), 1);

    server.relay.stop().await;
    server.sessions.close();
    timeout(TIMEOUT, server.sessions.wait())
        .await
        .expect("WebSocket session did not finish");

    let msg = timeout(TIMEOUT, ws.next()).await.expect("no close frame");
    assert!(matches!(msg, Some(Ok(Message::Close(_)))), "expected close frame, got {msg:?}");
}

#[tokio::test]
async fn e2e_stalled_viewer_is_disconnected() {
    let mut config = Config::default();
    config.push.send_timeout_seconds = 1;
    config.push.outbound_buffer = 1024;
    let server = boot_server_with(
        config,
        Arc::new(MemorySnapshotStore::new()),
        Arc::new(MemoryBroker::new()),
    )
    .await;

    // Never read from this socket so the server's writes back up
    let _stalled = connect(&server.ws_url).await;
    wait_for_viewers(&server.relay, 1).await;

    let Value::Object(fields) = json!({"blob": "x".repeat(512 * 1024)}) else {
        unreachable!()
    };
    let raw = SensorEnvelope::encode_update(&SensorPayload::stamp(fields)).unwrap();

    let mut disconnected = false;
    for _ in 0..500 {
        server.relay.on_message(&raw).await;
        if server.relay.connection_count() == 0 {
            disconnected = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(disconnected, "stalled viewer was never disconnected");
}
