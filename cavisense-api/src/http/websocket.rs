//! WebSocket push channel
//!
//! Server to client traffic is one text frame per sensor envelope. Client
//! frames carry no meaning: they are read and dropped, and `Close` ends the
//! session.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use cavisense_relay::Connection;

use crate::http::AppState;

/// Time allowed for the close frame once the session is over
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Upgrade to a viewer connection on the push channel
pub async fn websocket_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let max_message_size = state.config.push.max_message_size;

    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let _session = state.sessions.token();
    let push = &state.config.push;
    let send_timeout = Duration::from_secs(push.send_timeout_seconds);
    let (connection, mut rx) = Connection::new(push.outbound_buffer);
    let connection_id = connection.id().to_string();
    let closed = connection.closed_token();

    info!(connection_id = %connection_id, "WebSocket connection established");

    let (mut ws_sink, mut ws_stream) = socket.split();

    // Registry frames -> WebSocket
    let writer_closed = closed.clone();
    let writer_id = connection_id.clone();
    let writer = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                () = writer_closed.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            match timeout(send_timeout, ws_sink.send(Message::Text(frame.to_string().into()))).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(connection_id = %writer_id, error = %e, "Failed to send WebSocket message");
                    break;
                }
                Err(_) => {
                    warn!(connection_id = %writer_id, "WebSocket send timed out, closing stalled connection");
                    break;
                }
            }
        }

        writer_closed.cancel();
        let _ = timeout(CLOSE_TIMEOUT, ws_sink.send(Message::Close(None))).await;
    });

    state.relay.attach(connection).await;

    // Client frames are ignored; only the end of the stream matters
    loop {
        let message = tokio::select! {
            () = closed.cancelled() => break,
            message = ws_stream.next() => message,
        };

        match message {
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(connection_id = %connection_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    closed.cancel();
    state.relay.detach(&connection_id);
    if let Err(e) = writer.await {
        warn!(connection_id = %connection_id, error = %e, "WebSocket writer task failed");
    }

    info!(connection_id = %connection_id, "WebSocket connection closed");
}
