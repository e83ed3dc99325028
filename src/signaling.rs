//! WebRTC signaling switch.
//!
//! Peers and rooms live behind reader-writer locks; every relay send happens
//! after the locks are dropped, through each peer's unbounded outbound
//! channel — which also preserves FIFO order per (sender, target) pair,
//! since one connection's frames are handled sequentially.
//!
//! Room rules: at most one broadcaster (an incumbent may re-claim its own
//! slot), a viewer cap, a global room cap, and a sweeper that deletes rooms
//! with no peers and no recent activity.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Wire frame, both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalFrame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_peer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Stamped by the server on every outgoing frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FrameKind {
    Join,
    Leave,
    Offer,
    Answer,
    IceCandidate,
    PeerJoined,
    PeerLeft,
    RoomInfo,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Broadcaster,
    Viewer,
}

/// Outbound half of a peer's socket.
pub type PeerSender = mpsc::UnboundedSender<SignalFrame>;

struct PeerHandle {
    sender: PeerSender,
    room_id: Option<String>,
    role: Option<PeerRole>,
    #[allow(dead_code)]
    joined_at: DateTime<Utc>,
}

struct Room {
    broadcaster: Option<String>,
    viewers: HashSet<String>,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

pub struct SignalingSwitch {
    peers: RwLock<HashMap<String, PeerHandle>>,
    rooms: RwLock<HashMap<String, Room>>,
    max_rooms: usize,
    max_viewers: usize,
    room_timeout: Duration,
}

impl SignalingSwitch {
    pub fn new(max_rooms: usize, max_viewers: usize, room_timeout: Duration) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            max_rooms,
            max_viewers,
            room_timeout,
        }
    }

    /// Register a connecting peer. The first frame on the returned channel
    /// carries the assigned peer id.
    pub async fn register(&self) -> (String, mpsc::UnboundedReceiver<SignalFrame>) {
        let peer_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        let hello = server_frame(FrameKind::RoomInfo, None, Some(peer_id.clone()), None);
        let _ = tx.send(hello);

        self.peers.write().await.insert(
            peer_id.clone(),
            PeerHandle {
                sender: tx,
                room_id: None,
                role: None,
                joined_at: Utc::now(),
            },
        );
        debug!(peer = %peer_id, "peer registered");
        (peer_id, rx)
    }

    /// Handle one client frame.
    pub async fn handle_frame(&self, peer_id: &str, frame: SignalFrame) {
        match frame.kind {
            FrameKind::Join => {
                let Some(room_id) = frame.room_id.clone() else {
                    self.error_to(peer_id, "join requires room_id").await;
                    return;
                };
                let is_broadcaster = frame
                    .payload
                    .as_ref()
                    .and_then(|p| p.get("is_broadcaster"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                self.join(peer_id, &room_id, is_broadcaster).await;
            }
            FrameKind::Leave => {
                self.leave(peer_id, true).await;
            }
            FrameKind::Offer | FrameKind::Answer | FrameKind::IceCandidate => {
                self.relay(peer_id, frame).await;
            }
            _ => {
                self.error_to(peer_id, "unexpected frame type").await;
            }
        }
    }

    async fn join(&self, peer_id: &str, room_id: &str, is_broadcaster: bool) {
        // Joining while in another room leaves it first.
        let current = self.peers.read().await.get(peer_id).and_then(|p| p.room_id.clone());
        if let Some(current) = current {
            if current != room_id {
                self.leave(peer_id, true).await;
            }
        }

        // All membership mutations under the write locks; notification sends
        // collected and fired after both are dropped.
        let mut notify: Vec<(PeerSender, SignalFrame)> = Vec::new();
        {
            let mut rooms = self.rooms.write().await;
            let peers = self.peers.read().await;
            let Some(me) = peers.get(peer_id) else { return };

            if !rooms.contains_key(room_id) {
                if rooms.len() >= self.max_rooms {
                    notify.push((me.sender.clone(), error_frame("room limit reached")));
                    self.send_all(notify);
                    return;
                }
                rooms.insert(
                    room_id.to_string(),
                    Room {
                        broadcaster: None,
                        viewers: HashSet::new(),
                        created_at: Utc::now(),
                        last_activity: Utc::now(),
                    },
                );
            }
            let room = rooms.get_mut(room_id).expect("room just ensured");

            if is_broadcaster {
                if room.broadcaster.as_deref().is_some_and(|b| b != peer_id) {
                    notify.push((me.sender.clone(), error_frame("broadcaster exists")));
                    self.send_all(notify);
                    return;
                }
                room.broadcaster = Some(peer_id.to_string());
            } else {
                if room.viewers.len() >= self.max_viewers && !room.viewers.contains(peer_id) {
                    notify.push((me.sender.clone(), error_frame("room full")));
                    self.send_all(notify);
                    return;
                }
                room.viewers.insert(peer_id.to_string());
            }
            room.last_activity = Utc::now();

            // Existing peers hear peer-joined; the joiner gets room-info.
            let member_ids: Vec<&String> = room
                .broadcaster
                .iter()
                .chain(room.viewers.iter())
                .filter(|id| id.as_str() != peer_id)
                .collect();
            let joined = server_frame(
                FrameKind::PeerJoined,
                Some(room_id.to_string()),
                Some(peer_id.to_string()),
                Some(json!({ "role": if is_broadcaster { "broadcaster" } else { "viewer" } })),
            );
            for id in &member_ids {
                if let Some(other) = peers.get(id.as_str()) {
                    notify.push((other.sender.clone(), joined.clone()));
                }
            }
            let info = server_frame(
                FrameKind::RoomInfo,
                Some(room_id.to_string()),
                Some(peer_id.to_string()),
                Some(json!({
                    "broadcaster": room.broadcaster,
                    "viewers": room.viewers.iter().collect::<Vec<_>>(),
                })),
            );
            notify.push((me.sender.clone(), info));
        }

        {
            let mut peers = self.peers.write().await;
            if let Some(me) = peers.get_mut(peer_id) {
                me.room_id = Some(room_id.to_string());
                me.role = Some(if is_broadcaster {
                    PeerRole::Broadcaster
                } else {
                    PeerRole::Viewer
                });
            }
        }

        info!(peer = %peer_id, room = %room_id, broadcaster = is_broadcaster, "peer joined room");
        self.send_all(notify);
    }

    /// Relay an offer/answer/ice-candidate to a peer in the same room.
    async fn relay(&self, peer_id: &str, mut frame: SignalFrame) {
        let Some(target_id) = frame.target_peer_id.clone() else {
            self.error_to(peer_id, "relay requires target_peer_id").await;
            return;
        };

        let target_sender = {
            let peers = self.peers.read().await;
            let Some(me) = peers.get(peer_id) else { return };
            let Some(my_room) = me.room_id.clone() else {
                drop(peers);
                self.error_to(peer_id, "not in a room").await;
                return;
            };
            match peers.get(&target_id) {
                Some(target) if target.room_id.as_deref() == Some(my_room.as_str()) => {
                    frame.room_id = Some(my_room);
                    Some(target.sender.clone())
                }
                _ => None,
            }
        };

        match target_sender {
            Some(sender) => {
                frame.peer_id = Some(peer_id.to_string());
                frame.timestamp = Some(Utc::now());
                if let Some(room_id) = &frame.room_id {
                    self.touch_room(room_id).await;
                }
                let _ = sender.send(frame);
            }
            None => {
                self.error_to(peer_id, "target peer not in your room").await;
            }
        }
    }

    /// Detach a peer from its room. Disconnect semantics: a departing
    /// broadcaster is announced to every viewer, a departing viewer only to
    /// the broadcaster.
    async fn leave(&self, peer_id: &str, announce: bool) {
        let (room_id, role) = {
            let mut peers = self.peers.write().await;
            let Some(me) = peers.get_mut(peer_id) else { return };
            (me.room_id.take(), me.role.take())
        };
        let Some(room_id) = room_id else { return };

        let mut notify: Vec<(PeerSender, SignalFrame)> = Vec::new();
        {
            let mut rooms = self.rooms.write().await;
            let peers = self.peers.read().await;
            if let Some(room) = rooms.get_mut(&room_id) {
                let recipients: Vec<&String> = match role {
                    Some(PeerRole::Broadcaster) => {
                        room.broadcaster = None;
                        room.viewers.iter().collect()
                    }
                    _ => {
                        room.viewers.remove(peer_id);
                        room.broadcaster.iter().collect()
                    }
                };
                room.last_activity = Utc::now();

                if announce {
                    let left = server_frame(
                        FrameKind::PeerLeft,
                        Some(room_id.clone()),
                        Some(peer_id.to_string()),
                        None,
                    );
                    for id in recipients {
                        if let Some(other) = peers.get(id.as_str()) {
                            notify.push((other.sender.clone(), left.clone()));
                        }
                    }
                }
            }
        }

        debug!(peer = %peer_id, room = %room_id, "peer left room");
        self.send_all(notify);
    }

    /// Remove a disconnected peer entirely.
    pub async fn disconnect(&self, peer_id: &str) {
        self.leave(peer_id, true).await;
        self.peers.write().await.remove(peer_id);
        debug!(peer = %peer_id, "peer disconnected");
    }

    /// Delete rooms with no broadcaster, no viewers, and no recent activity.
    pub async fn sweep_stale(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.room_timeout).unwrap_or_default();
        let mut rooms = self.rooms.write().await;
        let before = rooms.len();
        rooms.retain(|id, room| {
            let stale = room.broadcaster.is_none()
                && room.viewers.is_empty()
                && room.last_activity < cutoff;
            if stale {
                warn!(room = %id, "stale room deleted");
            }
            !stale
        });
        before - rooms.len()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    async fn touch_room(&self, room_id: &str) {
        if let Some(room) = self.rooms.write().await.get_mut(room_id) {
            room.last_activity = Utc::now();
        }
    }

    pub(crate) async fn error_to(&self, peer_id: &str, message: &str) {
        let sender = self
            .peers
            .read()
            .await
            .get(peer_id)
            .map(|p| p.sender.clone());
        if let Some(sender) = sender {
            let _ = sender.send(error_frame(message));
        }
    }

    /// Fire queued notifications outside any lock.
    fn send_all(&self, notify: Vec<(PeerSender, SignalFrame)>) {
        for (sender, frame) in notify {
            let _ = sender.send(frame);
        }
    }
}

fn server_frame(
    kind: FrameKind,
    room_id: Option<String>,
    peer_id: Option<String>,
    payload: Option<Value>,
) -> SignalFrame {
    SignalFrame {
        kind,
        room_id,
        peer_id,
        target_peer_id: None,
        payload,
        timestamp: Some(Utc::now()),
    }
}

fn error_frame(message: &str) -> SignalFrame {
    server_frame(
        FrameKind::Error,
        None,
        None,
        Some(json!({ "message": message })),
    )
}
