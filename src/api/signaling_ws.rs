//! Signaling socket (`/signaling`).
//!
//! The socket is a dumb pipe to the [`SignalingSwitch`]: inbound frames are
//! parsed and handed over, outbound frames arrive on the peer's channel
//! already shaped and timestamped. The first outbound frame carries the
//! assigned peer id.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt as _, StreamExt as _};
use tracing::debug;

use crate::signaling::SignalFrame;

use super::AppState;

pub async fn signaling_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle(socket, state))
}

async fn handle(socket: WebSocket, state: AppState) {
    let (mut sink, mut inbound) = socket.split();
    let (peer_id, mut rx) = state.signaling.register().await;

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else { continue };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = inbound.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<SignalFrame>(text.as_str()) {
                Ok(frame) => state.signaling.handle_frame(&peer_id, frame).await,
                Err(e) => {
                    state
                        .signaling
                        .error_to(&peer_id, &format!("invalid frame: {e}"))
                        .await;
                }
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    state.signaling.disconnect(&peer_id).await;
    writer.abort();
    debug!(peer = %peer_id, "signaling socket closed");
}
