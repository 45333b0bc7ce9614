//! WebSocket push channel: forwards the broadcaster's envelopes to each
//! connected client. Delivery is best-effort; a client that connects late or
//! falls behind simply misses messages.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{sink::SinkExt, stream::StreamExt};
use tracing::{debug, error};

use crate::api::state::AppState;

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.engine.broadcaster().subscribe();

    let send_task = tokio::spawn(async move {
        while let Ok(message) = rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(e) => {
                    error!(error = %e, "Failed to serialize push message");
                    continue;
                }
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    // The channel is push-only; drain the client side until it closes.
    while let Some(Ok(message)) = receiver.next().await {
        match message {
            Message::Close(_) => break,
            _ => {}
        }
    }

    send_task.abort();
    debug!("WebSocket client disconnected");
}
