//! Per-stream intake socket (`/ws/stream/:id`).
//!
//! One socket per stream. Client frames carry captured camera frames and
//! pings; the server answers with acks, frame receipts, and — via the event
//! bus — alert and escalation frames for this stream. All outbound traffic
//! funnels through one channel so ordering is preserved.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use futures_util::{SinkExt as _, StreamExt as _};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::events::Event;
use crate::pipeline::Frame;

use super::AppState;

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Subscribe,
    Frame {
        #[serde(default)]
        data: Option<String>,
        #[serde(default)]
        motion_score: f32,
        #[serde(default)]
        audio_level: f32,
    },
    Ping,
}

pub async fn stream_socket(
    ws: WebSocketUpgrade,
    Path(stream_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle(socket, stream_id, state))
}

async fn handle(socket: WebSocket, stream_id: String, state: AppState) {
    let (mut sink, mut inbound) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    if state.streams.get_live(&stream_id).is_none() {
        let _ = sink
            .send(Message::Text(
                error_text("unknown stream").into(),
            ))
            .await;
        return;
    }
    if let Err(e) = state.streams.attach_socket(&stream_id, tx.clone()) {
        let _ = sink
            .send(Message::Text(error_text(&e.to_string()).into()))
            .await;
        return;
    }

    // Single writer: everything the client sees goes through `rx`.
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let _ = tx.send(json!({ "type": "connected", "stream_id": stream_id }).to_string());

    // Alert/escalation events for this stream ride the same channel.
    let events = tokio::spawn(forward_events(
        state.bus.subscribe(),
        stream_id.clone(),
        tx.clone(),
    ));

    while let Some(message) = inbound.next().await {
        match message {
            Ok(Message::Text(text)) => {
                apply_client_frame(&state, &stream_id, text.as_str(), &tx);
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    events.abort();
    writer.abort();
    state.streams.detach_socket(&stream_id);
    debug!(stream = %stream_id, "stream socket closed");
}

/// Handle one client text frame. Factored out of the socket loop so the
/// protocol is testable without a live connection.
fn apply_client_frame(
    state: &AppState,
    stream_id: &str,
    text: &str,
    out: &mpsc::UnboundedSender<String>,
) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            let _ = out.send(error_text(&format!("invalid frame: {e}")));
            return;
        }
    };

    match frame {
        ClientFrame::Subscribe => {
            let _ = out.send(json!({ "type": "ack", "original_type": "subscribe" }).to_string());
        }
        ClientFrame::Ping => {
            state.streams.update_ping(stream_id);
            let _ = out.send(json!({ "type": "ack", "original_type": "ping" }).to_string());
        }
        ClientFrame::Frame { data, motion_score, audio_level } => {
            let payload = match data {
                Some(b64) => match BASE64.decode(b64.trim()) {
                    Ok(bytes) => Bytes::from(bytes),
                    Err(_) => {
                        let _ = out.send(error_text("frame data is not base64"));
                        return;
                    }
                },
                None => Bytes::new(),
            };

            state.streams.inc_frames(stream_id);
            let frame = Frame::new(stream_id, payload, motion_score, audio_level);
            match state.pipeline.ingest(frame) {
                Ok(()) => {
                    let _ = out
                        .send(json!({ "type": "frame_received", "stream_id": stream_id }).to_string());
                }
                Err(e) => {
                    warn!(stream = %stream_id, error = %e, "frame ingest failed");
                    let _ = out.send(error_text(&e.to_string()));
                }
            }
        }
    }
}

/// Relay this stream's alert and escalation events to the socket.
async fn forward_events(
    mut rx: tokio::sync::broadcast::Receiver<Event>,
    stream_id: String,
    out: mpsc::UnboundedSender<String>,
) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        };
        if event.stream_id() != stream_id {
            continue;
        }
        let text = match &event {
            Event::AlertCreated { alert } => {
                json!({ "type": "alert", "alert": alert }).to_string()
            }
            Event::Escalation { alert_id, level, volume, sound, .. } => json!({
                "type": "escalation",
                "alert_id": alert_id,
                "level": level,
                "volume": volume,
                "sound": sound,
            })
            .to_string(),
            _ => continue,
        };
        if out.send(text).is_err() {
            return;
        }
    }
}

fn error_text(message: &str) -> String {
    json!({ "type": "error", "message": message }).to_string()
}
