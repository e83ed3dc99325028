//! In-process event bus.
//!
//! Components publish typed events; the stream WebSocket handlers and any
//! interested background task subscribe. Built on [`tokio::sync::broadcast`]:
//! publishing never blocks, slow subscribers lag and skip rather than
//! backpressure the pipeline.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::escalation::Sound;
use crate::store::types::{Alert, Concern, StreamRecord};

/// Everything that happens in the backend worth telling a client about.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    StreamCreated {
        stream: StreamRecord,
    },
    StreamEnded {
        stream_id: String,
    },
    FrameAnalyzed {
        stream_id: String,
        frame_id: String,
        concern: Concern,
        used_cloud_fallback: bool,
    },
    AlertCreated {
        alert: Alert,
    },
    AlertAcknowledged {
        alert_id: String,
        stream_id: String,
    },
    Escalation {
        alert_id: String,
        stream_id: String,
        level: u8,
        volume: u8,
        sound: Sound,
    },
}

impl Event {
    /// Stream this event concerns, for per-socket filtering.
    pub fn stream_id(&self) -> &str {
        match self {
            Self::StreamCreated { stream } => &stream.id,
            Self::StreamEnded { stream_id } => stream_id,
            Self::FrameAnalyzed { stream_id, .. } => stream_id,
            Self::AlertCreated { alert } => &alert.stream_id,
            Self::AlertAcknowledged { stream_id, .. } => stream_id,
            Self::Escalation { stream_id, .. } => stream_id,
        }
    }

    /// Wire name, matching the original event vocabulary.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StreamCreated { .. } => "stream:created",
            Self::StreamEnded { .. } => "stream:ended",
            Self::FrameAnalyzed { .. } => "frame:analyzed",
            Self::AlertCreated { .. } => "alert:created",
            Self::AlertAcknowledged { .. } => "alert:acknowledged",
            Self::Escalation { .. } => "escalation",
        }
    }
}

/// Cloneable handle to the broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. A bus with no subscribers swallows it.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
