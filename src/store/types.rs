//! Persisted data model.
//!
//! Row types and the string-keyed enums they carry. Enums are stored as
//! their `as_str` form; parsing is lenient only where the value crosses the
//! public API (serde), never when reading our own rows back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Monitoring context a stream runs under, selecting prompts and thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scenario {
    Pet,
    Baby,
    Elderly,
}

impl Scenario {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pet => "pet",
            Self::Baby => "baby",
            Self::Elderly => "elderly",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pet" => Some(Self::Pet),
            "baby" => Some(Self::Baby),
            "elderly" => Some(Self::Elderly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Connecting,
    Active,
    Paused,
    Disconnected,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Disconnected => "disconnected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "connecting" => Some(Self::Connecting),
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "disconnected" => Some(Self::Disconnected),
            _ => None,
        }
    }
}

/// Per-stream user preferences: sensitivity overrides and channel toggles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamPrefs {
    /// Motion score below which frames are not escalated (overrides the
    /// scenario default when set).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motion_sensitivity: Option<f32>,

    /// Audio level below which frames are not escalated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_sensitivity: Option<f32>,

    /// Channel opt-outs. Absent = all channels allowed.
    #[serde(default)]
    pub notify_browser: Option<bool>,
    #[serde(default)]
    pub notify_sms: Option<bool>,
    #[serde(default)]
    pub notify_chat: Option<bool>,
}

/// A monitored camera stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRecord {
    pub id: String,
    pub name: Option<String>,
    pub user_id: Option<String>,
    pub scenario: Scenario,
    pub status: StreamStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub frame_count: i64,
    pub alert_count: i64,
    pub last_ping: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferences: Option<StreamPrefs>,
}

/// Five-valued ordinal concern produced by vision analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Concern {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl Concern {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Severity an alert created from this concern carries.
    pub fn severity(&self) -> Severity {
        match self {
            Self::None | Self::Low => Severity::Info,
            Self::Medium => Severity::Warning,
            Self::High => Severity::Urgent,
            Self::Critical => Severity::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Urgent,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Urgent => "urgent",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Self::Info),
            "warning" => Some(Self::Warning),
            "urgent" => Some(Self::Urgent),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertType {
    Motion,
    Audio,
    Analysis,
    Inactivity,
    Manual,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Motion => "motion",
            Self::Audio => "audio",
            Self::Analysis => "analysis",
            Self::Inactivity => "inactivity",
            Self::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "motion" => Some(Self::Motion),
            "audio" => Some(Self::Audio),
            "analysis" => Some(Self::Analysis),
            "inactivity" => Some(Self::Inactivity),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// An alert raised on a stream. Mutated by the escalation engine (level) and
/// the gateway (acknowledgement); terminal once acknowledged or cleared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub stream_id: String,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub escalation_level: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagStatus {
    Pending,
    Assigned,
    Reviewed,
    Escalated,
    Dismissed,
    Blocked,
}

impl FlagStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Reviewed => "reviewed",
            Self::Escalated => "escalated",
            Self::Dismissed => "dismissed",
            Self::Blocked => "blocked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "assigned" => Some(Self::Assigned),
            "reviewed" => Some(Self::Reviewed),
            "escalated" => Some(Self::Escalated),
            "dismissed" => Some(Self::Dismissed),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }
}

/// Flagged content awaiting moderation. Tier 4 is the privileged bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentFlag {
    pub id: String,
    pub stream_id: String,
    pub frame_id: Option<String>,
    pub tier: u8,
    pub categories: Vec<String>,
    pub status: FlagStatus,
    pub created_at: DateTime<Utc>,
}

/// Reviewer verdict on a flagged item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewDecision {
    Safe,
    Block,
    Escalate,
    Ban,
}

impl ReviewDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Block => "block",
            Self::Escalate => "escalate",
            Self::Ban => "ban",
        }
    }
}

/// A [`ContentFlag`] joined with its review-queue metadata.
///
/// While `status` is `assigned`, exactly one reviewer holds the lease
/// (`assigned_to` + `assigned_at`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewItem {
    pub id: String,
    pub flag_id: String,
    /// Raw stream id for privileged reviewers; a stable hash for everyone
    /// else when the tier is 3 or 4.
    pub stream_id: String,
    pub frame_id: Option<String>,
    pub tier: u8,
    pub categories: Vec<String>,
    pub status: FlagStatus,
    pub created_at: DateTime<Utc>,
    pub assigned_to: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub decision: Option<String>,
    pub notes: Option<String>,
    pub anonymized: bool,
    pub blur_level: u8,
}

/// A browser push subscription, deduped by endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushSubscription {
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
    pub user_id: Option<String>,
}

/// A saved monitoring profile: a named preference set a user can activate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub user_id: Option<String>,
    pub name: String,
    pub scenario: Scenario,
    pub preferences: StreamPrefs,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}
