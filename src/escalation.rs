//! Time-driven alert escalation.
//!
//! Every alert walks a fixed ladder: each level raises the volume, hardens
//! the sound, and widens the notification channel set. Delays are cumulative
//! from alert creation; the starting level is chosen by severity and fires
//! immediately. One task per alert sleeps to each remaining absolute
//! boundary, so per-alert events are emitted in non-decreasing level order,
//! each step exactly once, until acknowledgement cancels the walk.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::events::{Event, EventBus};
use crate::store;
use crate::store::types::{Alert, Severity};

/// Notification sound by escalation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Sound {
    None,
    Chime,
    Alert,
    Alarm,
    Critical,
}

/// Which notification channels a ladder step fans out to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelSet {
    pub browser: bool,
    pub sms: bool,
    pub chat: bool,
}

/// One rung of the ladder.
#[derive(Debug, Clone, Copy)]
pub struct LadderStep {
    pub level: u8,
    /// Cumulative seconds from alert creation.
    pub delay_secs: u64,
    pub volume_pct: u8,
    pub sound: Sound,
    pub channels: ChannelSet,
}

/// The escalation ladder. Level 0 is the quiet resting rung — alerts start
/// at 1 or above.
pub const LADDER: [LadderStep; 5] = [
    LadderStep {
        level: 0,
        delay_secs: 0,
        volume_pct: 0,
        sound: Sound::None,
        channels: ChannelSet { browser: false, sms: false, chat: false },
    },
    LadderStep {
        level: 1,
        delay_secs: 15,
        volume_pct: 10,
        sound: Sound::Chime,
        channels: ChannelSet { browser: true, sms: false, chat: false },
    },
    LadderStep {
        level: 2,
        delay_secs: 45,
        volume_pct: 25,
        sound: Sound::Alert,
        channels: ChannelSet { browser: true, sms: false, chat: false },
    },
    LadderStep {
        level: 3,
        delay_secs: 105,
        volume_pct: 50,
        sound: Sound::Alarm,
        channels: ChannelSet { browser: true, sms: false, chat: true },
    },
    LadderStep {
        level: 4,
        delay_secs: 225,
        volume_pct: 100,
        sound: Sound::Critical,
        channels: ChannelSet { browser: true, sms: true, chat: true },
    },
];

/// Level an alert enters the ladder at.
pub fn start_level(severity: Severity) -> u8 {
    match severity {
        Severity::Info => 1,
        Severity::Warning => 2,
        Severity::Urgent => 3,
        Severity::Critical => 4,
    }
}

/// Where escalation steps go. The notifier implements this; tests pass a
/// recording fake.
#[async_trait]
pub trait EscalationSink: Send + Sync {
    async fn escalate(&self, alert: &Alert, step: &LadderStep);
}

/// A sink that drops everything — for wiring where no channels exist.
pub struct NullSink;

#[async_trait]
impl EscalationSink for NullSink {
    async fn escalate(&self, _alert: &Alert, _step: &LadderStep) {}
}

struct ActiveAlert {
    alert: Alert,
    /// Creation instant; ladder boundaries are absolute offsets from here.
    started: Instant,
    level: u8,
    /// When the current level became active, for volume interpolation.
    level_since: Instant,
    cancel: CancellationToken,
}

pub struct EscalationEngine {
    pool: SqlitePool,
    bus: EventBus,
    sink: Arc<dyn EscalationSink>,
    alerts: DashMap<String, ActiveAlert>,
}

impl EscalationEngine {
    pub fn new(pool: SqlitePool, bus: EventBus, sink: Arc<dyn EscalationSink>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            bus,
            sink,
            alerts: DashMap::new(),
        })
    }

    /// Register an alert and begin its ladder walk. The starting step fires
    /// immediately; later steps fire at their absolute boundaries.
    pub fn start(self: &Arc<Self>, alert: Alert) {
        let cancel = CancellationToken::new();
        let now = Instant::now();
        let first = start_level(alert.severity);

        self.alerts.insert(
            alert.id.clone(),
            ActiveAlert {
                alert: alert.clone(),
                started: now,
                level: 0,
                level_since: now,
                cancel: cancel.clone(),
            },
        );

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.emit(&alert, first).await;

            for step in &LADDER[(first as usize + 1)..] {
                let deadline = now + Duration::from_secs(step.delay_secs);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(alert = %alert.id, "escalation cancelled");
                        return;
                    }
                    _ = sleep_until(deadline) => {
                        engine.emit(&alert, step.level).await;
                    }
                }
            }
        });
    }

    async fn emit(&self, alert: &Alert, level: u8) {
        let step = &LADDER[level as usize];

        // Update in-memory state first so level() queries never run behind
        // the event order.
        {
            let Some(mut entry) = self.alerts.get_mut(&alert.id) else {
                return; // acknowledged between boundary and emit
            };
            entry.level = level;
            entry.level_since = Instant::now();
        }

        if let Err(e) = store::alerts::set_level(&self.pool, &alert.id, level).await {
            warn!(alert = %alert.id, error = %e, "level persist failed");
        }

        info!(alert = %alert.id, level, sound = ?step.sound, "escalation step");
        self.bus.publish(Event::Escalation {
            alert_id: alert.id.clone(),
            stream_id: alert.stream_id.clone(),
            level,
            volume: step.volume_pct,
            sound: step.sound,
        });

        self.sink.escalate(alert, step).await;
    }

    /// Acknowledge an alert: cancel pending steps and stamp the store.
    /// Idempotent — the first call returns `true`, later calls `false`.
    pub async fn acknowledge(&self, alert_id: &str) -> Result<bool, Error> {
        let active = self.alerts.remove(alert_id);
        if let Some((_, entry)) = &active {
            entry.cancel.cancel();
        }

        let stamped =
            store::alerts::acknowledge(&self.pool, alert_id, Utc::now().timestamp_millis()).await?;

        if active.is_some() || stamped {
            let stream_id = active
                .as_ref()
                .map(|(_, e)| e.alert.stream_id.clone())
                .unwrap_or_default();
            self.bus.publish(Event::AlertAcknowledged {
                alert_id: alert_id.to_string(),
                stream_id,
            });
        }

        Ok(active.is_some() || stamped)
    }

    /// Current level, or `None` when the alert is not active.
    pub fn level(&self, alert_id: &str) -> Option<u8> {
        self.alerts.get(alert_id).map(|e| e.level)
    }

    /// Current sound, or `None` when the alert is not active.
    pub fn sound(&self, alert_id: &str) -> Option<Sound> {
        self.alerts
            .get(alert_id)
            .map(|e| LADDER[e.level as usize].sound)
    }

    /// Volume right now, linearly interpolated between the current level and
    /// the next over the elapsed fraction of the gap.
    pub fn volume(&self, alert_id: &str) -> Option<f32> {
        let entry = self.alerts.get(alert_id)?;
        let cur = &LADDER[entry.level as usize];
        let Some(next) = LADDER.get(entry.level as usize + 1) else {
            return Some(cur.volume_pct as f32); // top rung holds
        };

        let next_boundary = entry.started + Duration::from_secs(next.delay_secs);
        let gap = next_boundary.saturating_duration_since(entry.level_since);
        if gap.is_zero() {
            return Some(next.volume_pct as f32);
        }
        let elapsed = entry.level_since.elapsed().min(gap);
        let frac = elapsed.as_secs_f32() / gap.as_secs_f32();
        let v = cur.volume_pct as f32 + (next.volume_pct as f32 - cur.volume_pct as f32) * frac;
        Some(v)
    }

    /// Ids of alerts still walking the ladder.
    pub fn active(&self) -> Vec<String> {
        self.alerts.iter().map(|e| e.alert.id.clone()).collect()
    }

    /// Cancel every active alert without acknowledging it.
    pub fn clear_all(&self) {
        for entry in self.alerts.iter() {
            entry.cancel.cancel();
        }
        self.alerts.clear();
    }
}
