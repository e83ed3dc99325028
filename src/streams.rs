//! Stream lifecycle and live counters.
//!
//! The store holds the durable rows; this manager owns the hot in-memory
//! view: socket bindings, frame/alert counters, last-ping instants. Counters
//! are flushed to the store periodically and on stream end rather than per
//! frame.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::banlist::BanList;
use crate::error::Error;
use crate::events::{Event, EventBus};
use crate::store;
use crate::store::types::{Scenario, StreamRecord, StreamStatus};

/// Outbound half of a stream's WebSocket: serialized server frames.
pub type StreamSocket = mpsc::UnboundedSender<String>;

struct LiveStream {
    record: StreamRecord,
    socket: Option<StreamSocket>,
    frames_dropped: u64,
    dirty: bool,
}

pub struct StreamManager {
    pool: SqlitePool,
    bus: EventBus,
    banlist: Arc<BanList>,
    live: DashMap<String, LiveStream>,
    ping_timeout: Duration,
}

/// Aggregate view for the status endpoint.
#[derive(Debug, Serialize)]
pub struct StreamSummary {
    pub active: usize,
    pub paused: usize,
    pub total_live: usize,
    pub frames_processed: u64,
    pub frames_dropped: u64,
    pub by_scenario: std::collections::HashMap<String, usize>,
}

impl StreamManager {
    pub fn new(
        pool: SqlitePool,
        bus: EventBus,
        banlist: Arc<BanList>,
        ping_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            bus,
            banlist,
            live: DashMap::new(),
            ping_timeout,
        }
    }

    /// Create a stream: persist it active, index it live, announce it.
    pub async fn create(
        &self,
        scenario: Scenario,
        name: Option<String>,
        user_id: Option<String>,
    ) -> Result<StreamRecord, Error> {
        if let Some(user) = &user_id {
            if self.banlist.is_banned(user).await {
                return Err(Error::Unauthorized(format!("user {user} is banned")));
            }
        }

        let now = Utc::now();
        let record = StreamRecord {
            id: Uuid::new_v4().to_string(),
            name,
            user_id,
            scenario,
            status: StreamStatus::Active,
            started_at: now,
            ended_at: None,
            frame_count: 0,
            alert_count: 0,
            last_ping: now,
            preferences: None,
        };

        store::streams::insert(&self.pool, &record).await?;
        self.live.insert(
            record.id.clone(),
            LiveStream {
                record: record.clone(),
                socket: None,
                frames_dropped: 0,
                dirty: false,
            },
        );

        info!(stream = %record.id, scenario = %scenario.as_str(), "stream created");
        self.bus.publish(Event::StreamCreated { stream: record.clone() });
        Ok(record)
    }

    /// Bind the stream's one socket. Rejects a second binding.
    pub fn attach_socket(&self, stream_id: &str, socket: StreamSocket) -> Result<(), Error> {
        let mut entry = self
            .live
            .get_mut(stream_id)
            .ok_or_else(|| Error::NotFound(format!("stream {stream_id}")))?;
        if entry.socket.as_ref().is_some_and(|s| !s.is_closed()) {
            return Err(Error::Conflict(format!(
                "stream {stream_id} already has a socket"
            )));
        }
        entry.socket = Some(socket);
        entry.record.last_ping = Utc::now();
        Ok(())
    }

    pub fn detach_socket(&self, stream_id: &str) {
        if let Some(mut entry) = self.live.get_mut(stream_id) {
            entry.socket = None;
        }
    }

    pub fn update_ping(&self, stream_id: &str) {
        if let Some(mut entry) = self.live.get_mut(stream_id) {
            entry.record.last_ping = Utc::now();
            entry.dirty = true;
        }
    }

    pub fn inc_frames(&self, stream_id: &str) -> u64 {
        match self.live.get_mut(stream_id) {
            Some(mut entry) => {
                entry.record.frame_count += 1;
                entry.record.last_ping = Utc::now();
                entry.dirty = true;
                entry.record.frame_count as u64
            }
            None => 0,
        }
    }

    pub fn inc_alerts(&self, stream_id: &str) {
        if let Some(mut entry) = self.live.get_mut(stream_id) {
            entry.record.alert_count += 1;
            entry.dirty = true;
        }
    }

    pub fn inc_dropped(&self, stream_id: &str) -> u64 {
        match self.live.get_mut(stream_id) {
            Some(mut entry) => {
                entry.frames_dropped += 1;
                entry.frames_dropped
            }
            None => 0,
        }
    }

    /// Live record snapshot; falls back to the store for ended streams.
    pub async fn get(&self, stream_id: &str) -> Result<Option<StreamRecord>, Error> {
        if let Some(entry) = self.live.get(stream_id) {
            return Ok(Some(entry.record.clone()));
        }
        store::streams::get(&self.pool, stream_id).await
    }

    /// Live snapshot only — no store round-trip. Used on the frame path.
    pub fn get_live(&self, stream_id: &str) -> Option<StreamRecord> {
        self.live.get(stream_id).map(|e| e.record.clone())
    }

    pub fn get_by_scenario(&self, scenario: Scenario) -> Vec<StreamRecord> {
        self.live
            .iter()
            .filter(|e| e.record.scenario == scenario)
            .map(|e| e.record.clone())
            .collect()
    }

    pub fn active_list(&self) -> Vec<StreamRecord> {
        self.live
            .iter()
            .filter(|e| e.record.status == StreamStatus::Active)
            .map(|e| e.record.clone())
            .collect()
    }

    pub fn summary(&self) -> StreamSummary {
        let mut summary = StreamSummary {
            active: 0,
            paused: 0,
            total_live: 0,
            frames_processed: 0,
            frames_dropped: 0,
            by_scenario: Default::default(),
        };
        for entry in self.live.iter() {
            summary.total_live += 1;
            match entry.record.status {
                StreamStatus::Active => summary.active += 1,
                StreamStatus::Paused => summary.paused += 1,
                _ => {}
            }
            summary.frames_processed += entry.record.frame_count as u64;
            summary.frames_dropped += entry.frames_dropped;
            *summary
                .by_scenario
                .entry(entry.record.scenario.as_str().to_string())
                .or_default() += 1;
        }
        summary
    }

    pub async fn pause(&self, stream_id: &str) -> Result<bool, Error> {
        self.transition(stream_id, StreamStatus::Paused).await
    }

    pub async fn resume(&self, stream_id: &str) -> Result<bool, Error> {
        self.transition(stream_id, StreamStatus::Active).await
    }

    async fn transition(&self, stream_id: &str, status: StreamStatus) -> Result<bool, Error> {
        let found = match self.live.get_mut(stream_id) {
            Some(mut entry) => {
                entry.record.status = status;
                true
            }
            None => false,
        };
        if !found {
            return Ok(false);
        }
        store::streams::set_status(&self.pool, stream_id, status, None).await
    }

    /// End a stream: close its socket, flush counters, persist the terminal
    /// status, announce it. Idempotent — a second end returns `false`.
    pub async fn end(&self, stream_id: &str) -> Result<bool, Error> {
        let Some((_, entry)) = self.live.remove(stream_id) else {
            return Ok(false);
        };
        // Dropping the sender closes the socket forwarding task.
        drop(entry.socket);

        let now = Utc::now();
        store::streams::flush_counters(
            &self.pool,
            stream_id,
            entry.record.frame_count,
            entry.record.alert_count,
            entry.record.last_ping.timestamp_millis(),
        )
        .await?;
        store::streams::set_status(
            &self.pool,
            stream_id,
            StreamStatus::Disconnected,
            Some(now.timestamp_millis()),
        )
        .await?;

        info!(stream = %stream_id, frames = entry.record.frame_count, "stream ended");
        self.bus.publish(Event::StreamEnded { stream_id: stream_id.to_string() });
        Ok(true)
    }

    pub async fn set_preferences(
        &self,
        stream_id: &str,
        prefs: crate::store::types::StreamPrefs,
    ) -> Result<bool, Error> {
        let updated = store::streams::set_preferences(&self.pool, stream_id, &prefs).await?;
        if updated {
            if let Some(mut entry) = self.live.get_mut(stream_id) {
                entry.record.preferences = Some(prefs);
            }
        }
        Ok(updated)
    }

    /// Flush dirty counters to the store.
    pub async fn flush(&self) {
        let dirty: Vec<(String, i64, i64, i64)> = self
            .live
            .iter_mut()
            .filter_map(|mut entry| {
                if !entry.dirty {
                    return None;
                }
                entry.dirty = false;
                Some((
                    entry.record.id.clone(),
                    entry.record.frame_count,
                    entry.record.alert_count,
                    entry.record.last_ping.timestamp_millis(),
                ))
            })
            .collect();

        for (id, frames, alerts, ping) in dirty {
            if let Err(e) =
                store::streams::flush_counters(&self.pool, &id, frames, alerts, ping).await
            {
                warn!(stream = %id, error = %e, "counter flush failed");
            }
        }
    }

    /// Mark streams whose last ping predates the timeout as disconnected.
    /// Returns the ids swept so the caller can tear down their pipelines.
    pub async fn sweep_silent(&self) -> Vec<String> {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.ping_timeout).unwrap_or_default();
        let silent: Vec<String> = self
            .live
            .iter()
            .filter(|e| {
                e.record.status == StreamStatus::Active && e.record.last_ping < cutoff
            })
            .map(|e| e.record.id.clone())
            .collect();

        for id in &silent {
            warn!(stream = %id, "stream silent past ping timeout — disconnecting");
            if let Err(e) = self.end(id).await {
                warn!(stream = %id, error = %e, "sweep end failed");
            }
        }
        silent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn manager() -> StreamManager {
        let pool = store::open_in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let banlist = Arc::new(BanList::load(&dir.path().join("bans.json")).await.unwrap());
        // Leak the tempdir so the ban file outlives the helper.
        std::mem::forget(dir);
        StreamManager::new(pool, EventBus::new(16), banlist, Duration::from_secs(60))
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn create_persists_and_announces() {
        let m = manager().await;
        let mut rx = m.bus.subscribe();

        let stream = m
            .create(Scenario::Pet, Some("Living Room".into()), None)
            .await
            .unwrap();
        assert_eq!(stream.status, StreamStatus::Active);
        assert_eq!(stream.frame_count, 0);

        let stored = store::streams::get(&m.pool, &stream.id).await.unwrap();
        assert!(stored.is_some());
        assert_eq!(rx.recv().await.unwrap().name(), "stream:created");
    }

    #[tokio::test]
    async fn banned_user_cannot_create() {
        let m = manager().await;
        m.banlist.ban("u-bad").await.unwrap();
        let err = m
            .create(Scenario::Pet, None, Some("u-bad".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    #[tokio::test]
    async fn end_is_idempotent_and_persists_terminal_status() {
        let m = manager().await;
        let stream = m.create(Scenario::Baby, None, None).await.unwrap();

        assert!(m.end(&stream.id).await.unwrap());
        assert!(!m.end(&stream.id).await.unwrap());

        let stored = store::streams::get(&m.pool, &stream.id).await.unwrap().unwrap();
        assert_eq!(stored.status, StreamStatus::Disconnected);
        assert!(stored.ended_at.is_some());
    }

    #[tokio::test]
    async fn pause_and_resume_round_trip() {
        let m = manager().await;
        let stream = m.create(Scenario::Elderly, None, None).await.unwrap();

        assert!(m.pause(&stream.id).await.unwrap());
        assert_eq!(m.get_live(&stream.id).unwrap().status, StreamStatus::Paused);
        assert!(m.resume(&stream.id).await.unwrap());
        assert_eq!(m.get_live(&stream.id).unwrap().status, StreamStatus::Active);
        assert!(!m.pause("ghost").await.unwrap());
    }

    // -----------------------------------------------------------------------
    // Socket binding
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn second_socket_binding_is_rejected() {
        let m = manager().await;
        let stream = m.create(Scenario::Pet, None, None).await.unwrap();

        let (tx1, _rx1) = mpsc::unbounded_channel();
        m.attach_socket(&stream.id, tx1).unwrap();

        let (tx2, _rx2) = mpsc::unbounded_channel();
        assert!(matches!(
            m.attach_socket(&stream.id, tx2).unwrap_err(),
            Error::Conflict(_)
        ));
    }

    #[tokio::test]
    async fn closed_socket_can_be_rebound() {
        let m = manager().await;
        let stream = m.create(Scenario::Pet, None, None).await.unwrap();

        let (tx1, rx1) = mpsc::unbounded_channel();
        m.attach_socket(&stream.id, tx1).unwrap();
        drop(rx1); // client went away

        let (tx2, _rx2) = mpsc::unbounded_channel();
        assert!(m.attach_socket(&stream.id, tx2).is_ok());
    }

    #[tokio::test]
    async fn attach_to_unknown_stream_is_not_found() {
        let m = manager().await;
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            m.attach_socket("ghost", tx).unwrap_err(),
            Error::NotFound(_)
        ));
    }

    // -----------------------------------------------------------------------
    // Counters & summary
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn counters_flush_to_store() {
        let m = manager().await;
        let stream = m.create(Scenario::Pet, None, None).await.unwrap();

        m.inc_frames(&stream.id);
        m.inc_frames(&stream.id);
        m.inc_alerts(&stream.id);
        m.flush().await;

        let stored = store::streams::get(&m.pool, &stream.id).await.unwrap().unwrap();
        assert_eq!(stored.frame_count, 2);
        assert_eq!(stored.alert_count, 1);
    }

    #[tokio::test]
    async fn summary_counts_by_scenario() {
        let m = manager().await;
        m.create(Scenario::Pet, None, None).await.unwrap();
        m.create(Scenario::Pet, None, None).await.unwrap();
        let baby = m.create(Scenario::Baby, None, None).await.unwrap();
        m.pause(&baby.id).await.unwrap();

        let summary = m.summary();
        assert_eq!(summary.total_live, 3);
        assert_eq!(summary.active, 2);
        assert_eq!(summary.paused, 1);
        assert_eq!(summary.by_scenario["pet"], 2);
        assert_eq!(summary.by_scenario["baby"], 1);
    }

    // -----------------------------------------------------------------------
    // Liveness sweep
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn sweep_disconnects_silent_streams_only() {
        let pool = store::open_in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let banlist = Arc::new(BanList::load(&dir.path().join("bans.json")).await.unwrap());
        let m = StreamManager::new(pool, EventBus::new(16), banlist, Duration::from_millis(10));

        let silent = m.create(Scenario::Pet, None, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let fresh = m.create(Scenario::Pet, None, None).await.unwrap();

        let swept = m.sweep_silent().await;
        assert_eq!(swept, vec![silent.id.clone()]);
        assert!(m.get_live(&silent.id).is_none());
        assert!(m.get_live(&fresh.id).is_some());
    }
}
