//! WebSocket transport for live observers.
//!
//! Each connection registers one broadcaster observer. Subscribed channel
//! events are forwarded as `event` messages; requests are answered on the
//! same socket.

use std::sync::Arc;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use remote_device_core::{ErrorCode, ObserverHandle, ObserverId};
use remote_device_engine::Engine;
use tokio::sync::mpsc;

use crate::protocol::{ClientMessage, ServerMessage};

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(engine): State<Arc<Engine>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, engine))
}

async fn handle_socket(socket: WebSocket, engine: Arc<Engine>) {
    let (mut sender, mut receiver) = socket.split();
    let broadcaster = Arc::clone(engine.broadcaster());
    let ObserverHandle { id, mut events } = broadcaster.register_observer();
    tracing::info!(observer = %id, "Observer connected");

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // Replies and subscribed events share one writer
    let send_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                Some(msg) = rx.recv() => msg,
                Some(event) = events.recv() => ServerMessage::from(event),
                else => break,
            };
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s.into(),
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(observer = %id, "WebSocket error: {e}");
                break;
            }
        };

        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(client_msg) => handle_message(&engine, id, client_msg, &tx),
            Err(e) => {
                tracing::warn!(observer = %id, "Invalid client message: {e}");
                let _ = tx.send(ServerMessage::Error {
                    code: ErrorCode::InvalidRequest,
                    message: format!("Invalid message: {e}"),
                });
            }
        }
    }

    send_task.abort();
    broadcaster.remove_observer(id);
    tracing::info!(observer = %id, "Observer disconnected");
}

/// Answer one client request on behalf of `observer`.
///
/// Task runs are spawned so a long run does not hold up the socket.
pub fn handle_message(
    engine: &Arc<Engine>,
    observer: ObserverId,
    msg: ClientMessage,
    tx: &mpsc::UnboundedSender<ServerMessage>,
) {
    let broadcaster = engine.broadcaster();
    let reply = match msg {
        ClientMessage::Ping => ServerMessage::Pong,
        ClientMessage::Subscribe { channel } => match broadcaster.subscribe(observer, &channel) {
            Ok(channel) => ServerMessage::Subscribed {
                channel,
                channels: broadcaster.subscriptions(observer),
            },
            Err(e) => ServerMessage::error(&e),
        },
        ClientMessage::Unsubscribe { channel } => {
            match broadcaster.unsubscribe(observer, &channel) {
                Ok(channel) => ServerMessage::Unsubscribed {
                    channel,
                    channels: broadcaster.subscriptions(observer),
                },
                Err(e) => ServerMessage::error(&e),
            }
        }
        ClientMessage::GetRecentActivity { limit } => ServerMessage::RecentActivity {
            events: broadcaster.recent_activity(limit),
        },
        ClientMessage::GetLogs { query } => ServerMessage::Logs {
            entries: broadcaster.recent_logs(&query),
        },
        ClientMessage::GetStatus => ServerMessage::Status {
            status: engine.status(),
        },
        ClientMessage::RunTask { name } => {
            let engine = Arc::clone(engine);
            let tx = tx.clone();
            tokio::spawn(async move {
                let reply = match engine.run_task(&name).await {
                    Ok(result) => ServerMessage::TaskResult { result },
                    Err(e) => ServerMessage::error(&e),
                };
                let _ = tx.send(reply);
            });
            return;
        }
    };
    let _ = tx.send(reply);
}
