//! SQLite schema.
//!
//! Applied in one transaction at startup. Timestamps are unix milliseconds;
//! enums are stored as their canonical lowercase strings.

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Complete schema SQL.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL,
    applied_at INTEGER NOT NULL
);

-- =============================================================================
-- Streams
-- =============================================================================
CREATE TABLE IF NOT EXISTS streams (
    id TEXT PRIMARY KEY,
    name TEXT,
    user_id TEXT,
    scenario TEXT NOT NULL CHECK(scenario IN ('pet', 'baby', 'elderly')),
    status TEXT NOT NULL CHECK(status IN ('connecting', 'active', 'paused', 'disconnected')),
    started_at INTEGER NOT NULL,
    ended_at INTEGER,
    frame_count INTEGER NOT NULL DEFAULT 0,
    alert_count INTEGER NOT NULL DEFAULT 0,
    last_ping INTEGER NOT NULL,
    preferences TEXT
);

CREATE INDEX IF NOT EXISTS idx_streams_status ON streams(status);
CREATE INDEX IF NOT EXISTS idx_streams_user ON streams(user_id);

-- =============================================================================
-- Alerts
-- =============================================================================
CREATE TABLE IF NOT EXISTS alerts (
    id TEXT PRIMARY KEY,
    stream_id TEXT NOT NULL REFERENCES streams(id) ON DELETE CASCADE,
    alert_type TEXT NOT NULL CHECK(alert_type IN ('motion', 'audio', 'analysis', 'inactivity', 'manual')),
    severity TEXT NOT NULL CHECK(severity IN ('info', 'warning', 'urgent', 'critical')),
    title TEXT NOT NULL,
    body TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    acknowledged INTEGER NOT NULL DEFAULT 0,
    acknowledged_at INTEGER,
    escalation_level INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_alerts_stream_created ON alerts(stream_id, created_at DESC);

-- =============================================================================
-- Content flags + review queue (1:1 via flag_id while an item is queued)
-- =============================================================================
CREATE TABLE IF NOT EXISTS content_flags (
    id TEXT PRIMARY KEY,
    stream_id TEXT NOT NULL,
    frame_id TEXT,
    tier INTEGER NOT NULL CHECK(tier BETWEEN 1 AND 4),
    categories TEXT NOT NULL,
    status TEXT NOT NULL CHECK(status IN ('pending', 'assigned', 'reviewed', 'escalated', 'dismissed', 'blocked')),
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS review_queue (
    id TEXT PRIMARY KEY,
    flag_id TEXT NOT NULL UNIQUE REFERENCES content_flags(id) ON DELETE CASCADE,
    status TEXT NOT NULL CHECK(status IN ('pending', 'assigned', 'reviewed', 'escalated', 'dismissed', 'blocked')),
    tier INTEGER NOT NULL CHECK(tier BETWEEN 1 AND 4),
    created_at INTEGER NOT NULL,
    assigned_to TEXT,
    assigned_at INTEGER,
    reviewed_at INTEGER,
    decision TEXT,
    notes TEXT,
    anonymized INTEGER NOT NULL DEFAULT 0,
    blur_level INTEGER NOT NULL DEFAULT 0
);

-- Priority dequeue order: pending first, highest tier, oldest.
CREATE INDEX IF NOT EXISTS idx_review_priority ON review_queue(status, tier DESC, created_at ASC);

-- =============================================================================
-- Notification subscriptions
-- =============================================================================
CREATE TABLE IF NOT EXISTS push_subscriptions (
    endpoint TEXT PRIMARY KEY,
    p256dh TEXT NOT NULL,
    auth TEXT NOT NULL,
    user_id TEXT,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sms_recipients (
    e164 TEXT PRIMARY KEY,
    user_id TEXT,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS chat_recipients (
    chat_id TEXT PRIMARY KEY,
    user_id TEXT,
    created_at INTEGER NOT NULL
);

-- =============================================================================
-- Saved monitoring profiles
-- =============================================================================
CREATE TABLE IF NOT EXISTS user_profiles (
    id TEXT PRIMARY KEY,
    user_id TEXT,
    name TEXT NOT NULL,
    scenario TEXT NOT NULL CHECK(scenario IN ('pet', 'baby', 'elderly')),
    preferences TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
"#;
