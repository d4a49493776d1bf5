//! WebSocket endpoint: one task per connection reading client frames, one
//! writer task draining the connection's outbox.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use blocklearn_shared::constants::MAX_FRAME_SIZE;
use blocklearn_shared::protocol::{self, ClientEvent, ServerEvent};
use blocklearn_shared::PeerId;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::AppState;
use crate::error::ServerError;

const OUTBOX_CAPACITY: usize = 256;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.max_message_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (outbox, mut inbox) = mpsc::channel::<ServerEvent>(OUTBOX_CAPACITY);
    let peer = state.rooms.connect(outbox.clone()).await;
    info!(peer = %peer.short(), "Signaling connection opened");

    let writer = tokio::spawn(async move {
        while let Some(event) = inbox.recv().await {
            let text = match protocol::encode(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Dropping unencodable frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(peer = %peer.short(), error = %e, "WebSocket read failed");
                break;
            }
        };

        if let Err(e) = handle_frame(&state, &peer, &text).await {
            debug!(peer = %peer.short(), error = %e, "Frame rejected");
            let _ = outbox.try_send(ServerEvent::Error {
                code: e.code().to_string(),
                message: e.to_string(),
            });
        }
    }

    state.rooms.disconnect(&peer).await;
    state.frame_limiter.forget(&peer).await;
    drop(outbox);
    let _ = writer.await;
    info!(peer = %peer.short(), "Signaling connection closed");
}

async fn handle_frame(state: &AppState, peer: &PeerId, text: &str) -> Result<(), ServerError> {
    if !state.frame_limiter.check(peer).await {
        return Err(ServerError::RateLimited);
    }
    let event: ClientEvent = protocol::decode(text)?;
    state.rooms.dispatch(peer, event).await
}
