//! WebSocket route handler.
//!
//! Handles WebSocket upgrade, message loop, and cleanup.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error};

use super::connection::ConnectionId;
use super::messages::{ClientMessage, ServerMessage};
use crate::server::state::GuardedRelayHub;

/// WebSocket upgrade handler for `GET /ws`.
pub async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<GuardedRelayHub>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

/// Handle an established WebSocket connection.
async fn handle_socket(socket: WebSocket, hub: GuardedRelayHub) {
    let (connection, outgoing_rx) = hub.open_connection().await;
    debug!("WebSocket connected: {}", connection);

    let (ws_sink, ws_stream) = socket.split();

    // The only task writing to this socket.
    let outgoing_handle = tokio::spawn(forward_outgoing(ws_sink, outgoing_rx));

    process_incoming(ws_stream, connection, &hub).await;

    debug!("WebSocket disconnected: {}", connection);
    hub.close_connection(connection).await;
    outgoing_handle.abort();
}

/// Forward messages from the outgoing channel to the WebSocket.
async fn forward_outgoing(
    mut ws_sink: futures::stream::SplitSink<WebSocket, Message>,
    mut outgoing_rx: mpsc::Receiver<ServerMessage>,
) {
    while let Some(msg) = outgoing_rx.recv().await {
        match serde_json::to_string(&msg) {
            Ok(json) => {
                if ws_sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                error!("Failed to serialize WebSocket message: {}", e);
            }
        }
    }
}

/// Process incoming messages from the WebSocket.
async fn process_incoming(
    mut ws_stream: futures::stream::SplitStream<WebSocket>,
    connection: ConnectionId,
    hub: &GuardedRelayHub,
) {
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => hub.handle_message(connection, msg).await,
                Err(e) => {
                    debug!("Failed to parse client message: {}", e);
                    let reply = ServerMessage::error(format!("Invalid message format: {}", e));
                    if let Err(e) = hub.connections().send_to_connection(connection, reply).await {
                        debug!("Error reply to {} dropped: {:?}", connection, e);
                    }
                }
            },
            Ok(Message::Binary(_)) => {
                debug!("Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) => {
                // Axum/tungstenite handles pong automatically
                debug!("Received ping");
            }
            Ok(Message::Pong(_)) => {
                debug!("Received pong");
            }
            Ok(Message::Close(_)) => {
                debug!("Received close frame");
                break;
            }
            Err(e) => {
                debug!("WebSocket error: {}", e);
                break;
            }
        }
    }
}
