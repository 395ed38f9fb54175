//! WebSocket test client

#![allow(dead_code)]

use super::constants::*;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

pub struct WsClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsClient {
    pub async fn connect(ws_url: &str) -> Self {
        let (stream, _) = connect_async(ws_url)
            .await
            .expect("Failed to connect to WebSocket");
        Self { stream }
    }

    pub async fn send_event(&mut self, event: &str, data: Value) {
        let text = json!({ "event": event, "data": data }).to_string();
        self.send_text(&text).await;
    }

    pub async fn send_text(&mut self, text: &str) {
        self.stream
            .send(Message::Text(text.to_string().into()))
            .await
            .expect("Failed to send WebSocket message");
    }

    pub async fn subscribe(&mut self, device_id: &str) {
        self.send_event("subscribeHistories", json!(device_id)).await;
    }

    /// Next JSON envelope, or `None` if nothing arrives within `wait`.
    pub async fn next_message(&mut self, wait: Duration) -> Option<Value> {
        timeout(wait, async {
            while let Some(Ok(msg)) = self.stream.next().await {
                if let Message::Text(text) = msg {
                    if let Ok(json) = serde_json::from_str::<Value>(&text) {
                        return Some(json);
                    }
                }
            }
            None
        })
        .await
        .ok()
        .flatten()
    }

    /// Waits for a message with the given event name, skipping others.
    pub async fn wait_for(&mut self, event: &str) -> Option<Value> {
        let wait = Duration::from_millis(MESSAGE_TIMEOUT_MS);
        timeout(wait, async {
            loop {
                let msg = self.next_message(wait).await?;
                if msg.get("event").and_then(Value::as_str) == Some(event) {
                    return Some(msg);
                }
            }
        })
        .await
        .ok()
        .flatten()
    }

    /// Collects every message arriving within the quiet period.
    pub async fn drain(&mut self) -> Vec<Value> {
        let mut messages = Vec::new();
        while let Some(msg) = self
            .next_message(Duration::from_millis(QUIET_PERIOD_MS))
            .await
        {
            messages.push(msg);
        }
        messages
    }

    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }
}
