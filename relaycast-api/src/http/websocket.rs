//! WebSocket signaling handler
//!
//! One connection is one peer. Text frames are JSON requests handed to the
//! SFU manager in arrival order; a writer task drains the peer's outbound
//! queue into the socket. Closing the socket, either side, disconnects the peer.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, error, info};

use crate::http::AppState;

pub async fn websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let manager = state.manager;
    let (peer, mut outbound) = manager.connect();
    let peer_id = peer.id.clone();
    drop(peer);

    let (mut sink, mut stream) = socket.split();

    // Server messages -> WebSocket
    let writer_peer_id = peer_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    error!(peer_id = %writer_peer_id, error = %e, "Failed to encode message");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                debug!(peer_id = %writer_peer_id, error = %e, "Failed to send WebSocket message");
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => manager.dispatch_text(&peer_id, text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Err(e) => {
                debug!(peer_id = %peer_id, error = %e, "WebSocket error");
                break;
            }
            // Binary frames are not part of the protocol; ping/pong is answered by axum
            Ok(_) => {}
        }
    }

    manager.disconnect(&peer_id);
    writer.abort();

    info!(peer_id = %peer_id, "WebSocket connection closed");
}
