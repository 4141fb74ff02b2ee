//! WebSocket transport.
//!
//! Each connection runs as its own task and handles one message at a time:
//! parse, submit, send the reply, then read the next message. Replies on a
//! connection therefore come back in the order the requests were sent.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade, close_code};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use uuid::Uuid;

use crate::bridge::protocol::Message;
use crate::service::BridgeService;

pub async fn upgrade(ws: WebSocketUpgrade, State(service): State<Arc<BridgeService>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, service))
}

/// Serve one connection until the client closes it or sends something unparseable.
pub async fn handle_socket(socket: WebSocket, service: Arc<BridgeService>) {
    let conn_id = Uuid::new_v4();
    tracing::info!(%conn_id, "WebSocket client connected");

    let (mut sender, mut receiver) = socket.split();

    while let Some(incoming) = receiver.next().await {
        let parsed = match incoming {
            Ok(WsMessage::Text(text)) => Message::from_slice(text.as_str().as_bytes()),
            Ok(WsMessage::Binary(bytes)) => Message::from_slice(&bytes),
            Ok(WsMessage::Ping(_) | WsMessage::Pong(_)) => continue,
            Ok(WsMessage::Close(_)) => break,
            Err(e) => {
                tracing::debug!(%conn_id, error = %e, "WebSocket receive failed");
                break;
            }
        };

        let request = match parsed {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(%conn_id, error = %e, "Malformed message, closing connection");
                let close = CloseFrame {
                    code: close_code::INVALID,
                    reason: "expected a JSON object".to_string().into(),
                };
                let _ = sender.send(WsMessage::Close(Some(close))).await;
                break;
            }
        };

        let command = request.command_name().unwrap_or_default().to_string();
        tracing::debug!(%conn_id, %command, "Forwarding WebSocket request");

        let reply = match service.submit(request).await {
            Ok(reply) => reply.into_value(),
            Err(e) => {
                tracing::warn!(%conn_id, %command, error = %e, "Request failed");
                json!({ "error": e.to_string() })
            }
        };

        if let Err(e) = sender.send(WsMessage::Text(reply.to_string().into())).await {
            tracing::debug!(%conn_id, error = %e, "WebSocket send failed");
            break;
        }
    }

    tracing::info!(%conn_id, "WebSocket client disconnected");
}
