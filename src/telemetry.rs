//! In-memory analysis telemetry exposed through the status API.
//!
//! [`AnalysisLog`] is a fixed-capacity ring-buffer: once full, the oldest
//! entry is evicted to make room for the newest. This gives a bounded, O(1)
//! memory footprint regardless of frame volume.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::store::types::Concern;

/// Fixed-capacity ring-buffer of recent [`AnalysisEntry`] records.
///
/// Safe to share via `Arc<AnalysisLog>`. [`push`][Self::push] uses a
/// non-blocking `try_lock` so it never delays frame processing; under lock
/// contention the entry is silently dropped.
pub struct AnalysisLog {
    capacity: usize,
    entries: Mutex<VecDeque<AnalysisEntry>>,
}

impl AnalysisLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Record a completed analysis. Best-effort and non-blocking.
    pub fn push(&self, entry: AnalysisEntry) {
        if let Ok(mut entries) = self.entries.try_lock() {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
    }

    /// Aggregate statistics over all buffered entries.
    pub async fn stats(&self) -> AnalysisStats {
        let entries = self.entries.lock().await;
        let total = entries.len();
        let avg_latency_ms = if total == 0 {
            0.0
        } else {
            entries.iter().map(|e| e.latency_ms as f64).sum::<f64>() / total as f64
        };
        let cloud = entries.iter().filter(|e| e.used_cloud_fallback).count();
        let errors = entries.iter().filter(|e| !e.success).count();

        AnalysisStats {
            total_analyses: total,
            error_count: errors,
            cloud_fallback_count: cloud,
            cloud_fallback_rate: if total == 0 { 0.0 } else { cloud as f64 / total as f64 },
            avg_latency_ms,
        }
    }
}

/// A single analyzed frame.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisEntry {
    pub timestamp: DateTime<Utc>,
    pub stream_id: String,
    pub concern: Concern,
    pub model: String,
    pub latency_ms: u64,
    pub used_cloud_fallback: bool,
    pub success: bool,
}

impl AnalysisEntry {
    pub fn new(stream_id: &str, concern: Concern, model: &str, latency_ms: u64) -> Self {
        Self {
            timestamp: Utc::now(),
            stream_id: stream_id.to_string(),
            concern,
            model: model.to_string(),
            latency_ms,
            used_cloud_fallback: false,
            success: true,
        }
    }

    pub fn cloud(mut self) -> Self {
        self.used_cloud_fallback = true;
        self
    }

    pub fn failed(mut self) -> Self {
        self.success = false;
        self
    }
}

/// Aggregates derived from the buffered entries.
#[derive(Debug, Serialize)]
pub struct AnalysisStats {
    pub total_analyses: usize,
    pub error_count: usize,
    pub cloud_fallback_count: usize,
    pub cloud_fallback_rate: f64,
    pub avg_latency_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(latency_ms: u64) -> AnalysisEntry {
        AnalysisEntry::new("s-1", Concern::None, "llava:13b", latency_ms)
    }

    // -----------------------------------------------------------------------
    // Ring-buffer behaviour
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn oldest_entry_evicted_when_capacity_exceeded() {
        let log = AnalysisLog::new(2);
        log.push(entry(1));
        log.push(entry(2));
        log.push(entry(3));

        let stats = log.stats().await;
        assert_eq!(stats.total_analyses, 2);
        // (2 + 3) / 2
        assert!((stats.avg_latency_ms - 2.5).abs() < f64::EPSILON);
    }

    // -----------------------------------------------------------------------
    // Stats
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn stats_on_empty_log() {
        let log = AnalysisLog::new(8);
        let stats = log.stats().await;
        assert_eq!(stats.total_analyses, 0);
        assert_eq!(stats.cloud_fallback_rate, 0.0);
        assert_eq!(stats.avg_latency_ms, 0.0);
    }

    #[tokio::test]
    async fn stats_compute_cloud_fallback_rate() {
        let log = AnalysisLog::new(8);
        log.push(entry(10));
        log.push(entry(20).cloud());
        log.push(entry(30).cloud());
        log.push(entry(40).failed());

        let stats = log.stats().await;
        assert_eq!(stats.total_analyses, 4);
        assert_eq!(stats.cloud_fallback_count, 2);
        assert_eq!(stats.error_count, 1);
        assert!((stats.cloud_fallback_rate - 0.5).abs() < f64::EPSILON);
    }
}
