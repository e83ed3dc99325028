//! Frame analysis pipeline.
//!
//! Every stream owns a bounded frame queue; a dispatcher round-robins over
//! streams with pending frames, keeping at most one frame per stream and
//! `max_concurrent_analyses` frames globally in flight. Each frame runs the
//! two-tier route: fast triage, a threshold filter, detailed analysis, and —
//! when the local server is down, slow, or a high-concern triage is shaky —
//! the cloud fallback chain. Nothing on this path is allowed to take down a
//! stream's intake: every failure degrades to a defined outcome.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cloud::{CloudFallback, CloudVerdict};
use crate::error::Error;
use crate::escalation::EscalationEngine;
use crate::events::{Event, EventBus};
use crate::inference::InferenceClient;
use crate::profiles::{self, ModerationMap, ScenarioProfile};
use crate::store;
use crate::store::types::{
    Alert, AlertType, Concern, ContentFlag, FlagStatus, Scenario, StreamStatus,
};
use crate::streams::StreamManager;
use crate::telemetry::{AnalysisEntry, AnalysisLog};

/// One captured camera frame. Ephemeral: lives only until analysis dispatch.
#[derive(Debug, Clone)]
pub struct Frame {
    pub id: String,
    pub stream_id: String,
    pub captured_at: DateTime<Utc>,
    /// Opaque encoded image — never decoded here.
    pub payload: Bytes,
    pub motion_score: f32,
    pub audio_level: f32,
    pub zone_mask: Option<String>,
}

impl Frame {
    pub fn new(stream_id: &str, payload: Bytes, motion_score: f32, audio_level: f32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            stream_id: stream_id.to_string(),
            captured_at: Utc::now(),
            payload,
            motion_score: motion_score.clamp(0.0, 1.0),
            audio_level: audio_level.clamp(0.0, 1.0),
            zone_mask: None,
        }
    }
}

/// First-pass verdict attached to a full result.
#[derive(Debug, Clone, Serialize)]
pub struct TriageResult {
    pub concern: Concern,
    pub confidence: f32,
}

/// Outcome of analyzing one frame.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    pub id: String,
    pub stream_id: String,
    pub frame_id: String,
    pub concern: Concern,
    pub confidence: f32,
    pub description: String,
    pub detected_issues: Vec<String>,
    pub recommended_action: Option<String>,
    pub processing_ms: u64,
    pub model_name: String,
    pub used_cloud_fallback: bool,
    pub triage_result: Option<TriageResult>,
}

/// Hard cap on one encoded frame. Anything larger is not a camera frame.
const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

struct StreamQueue {
    frames: VecDeque<Frame>,
    in_flight: bool,
    cancel: CancellationToken,
}

pub struct Pipeline {
    queues: DashMap<String, StreamQueue>,
    ready: StdMutex<VecDeque<String>>,
    notify: Notify,
    semaphore: Arc<Semaphore>,
    queue_capacity: usize,

    inference: Arc<InferenceClient>,
    triage_model: String,
    analysis_model: String,
    local_healthy: AtomicBool,

    cloud: Arc<CloudFallback>,
    moderation: ModerationMap,

    pool: SqlitePool,
    engine: Arc<EscalationEngine>,
    streams: Arc<StreamManager>,
    bus: EventBus,
    telemetry: Arc<AnalysisLog>,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        inference: Arc<InferenceClient>,
        triage_model: String,
        analysis_model: String,
        cloud: Arc<CloudFallback>,
        moderation: ModerationMap,
        engine: Arc<EscalationEngine>,
        streams: Arc<StreamManager>,
        bus: EventBus,
        telemetry: Arc<AnalysisLog>,
        queue_capacity: usize,
        max_concurrent: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            queues: DashMap::new(),
            ready: StdMutex::new(VecDeque::new()),
            notify: Notify::new(),
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            queue_capacity: queue_capacity.max(1),
            inference,
            triage_model,
            analysis_model,
            local_healthy: AtomicBool::new(true),
            cloud,
            moderation,
            pool,
            engine,
            streams,
            bus,
            telemetry,
        })
    }

    // -----------------------------------------------------------------------
    // Intake
    // -----------------------------------------------------------------------

    /// Non-blocking enqueue. A full queue drops the *oldest* frame —
    /// freshness beats completeness on a live camera feed.
    pub fn ingest(&self, frame: Frame) -> Result<(), Error> {
        if frame.payload.len() > MAX_FRAME_BYTES {
            return Err(Error::BoundsExceeded(format!(
                "frame of {} bytes exceeds the {} byte cap",
                frame.payload.len(),
                MAX_FRAME_BYTES
            )));
        }
        let record = self
            .streams
            .get_live(&frame.stream_id)
            .ok_or_else(|| Error::NotFound(format!("stream {}", frame.stream_id)))?;
        if record.status != StreamStatus::Active {
            debug!(stream = %frame.stream_id, "frame ignored — stream not active");
            return Ok(());
        }

        let stream_id = frame.stream_id.clone();
        let schedule = {
            let mut entry = self.queues.entry(stream_id.clone()).or_insert_with(|| {
                StreamQueue {
                    frames: VecDeque::with_capacity(self.queue_capacity),
                    in_flight: false,
                    cancel: CancellationToken::new(),
                }
            });
            entry.frames.push_back(frame);
            if entry.frames.len() > self.queue_capacity {
                entry.frames.pop_front();
                let dropped = self.streams.inc_dropped(&stream_id);
                warn!(stream = %stream_id, dropped, "frame queue full — oldest dropped");
            }
            !entry.in_flight
        };

        if schedule {
            let mut ready = self.ready.lock().expect("ready queue poisoned");
            if !ready.contains(&stream_id) {
                ready.push_back(stream_id);
            }
            drop(ready);
            self.notify.notify_one();
        }
        Ok(())
    }

    /// Tear down a stream's queue and cancel its in-flight analysis.
    pub fn remove_stream(&self, stream_id: &str) {
        if let Some((_, queue)) = self.queues.remove(stream_id) {
            queue.cancel.cancel();
            debug!(stream = %stream_id, pending = queue.frames.len(), "pipeline queue removed");
        }
    }

    /// Queued frame count for one stream (observability only).
    pub fn backlog(&self, stream_id: &str) -> usize {
        self.queues.get(stream_id).map(|q| q.frames.len()).unwrap_or(0)
    }

    // -----------------------------------------------------------------------
    // Dispatcher
    // -----------------------------------------------------------------------

    /// Fair-scheduling dispatch loop. Runs until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            let next = self.ready.lock().expect("ready queue poisoned").pop_front();
            let Some(stream_id) = next else {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = self.notify.notified() => continue,
                }
            };

            let Some((frame, cancel)) = self.take_frame(&stream_id) else {
                continue;
            };

            let permit = tokio::select! {
                _ = shutdown.cancelled() => return,
                permit = Arc::clone(&self.semaphore).acquire_owned() => {
                    permit.expect("semaphore closed")
                }
            };

            let pipeline = Arc::clone(&self);
            tokio::spawn(async move {
                let _permit = permit;
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(stream = %frame.stream_id, frame = %frame.id, "analysis cancelled");
                    }
                    _ = pipeline.process_frame(&frame) => {}
                }
                pipeline.finish_stream(&frame.stream_id);
            });
        }
    }

    fn take_frame(&self, stream_id: &str) -> Option<(Frame, CancellationToken)> {
        let mut entry = self.queues.get_mut(stream_id)?;
        if entry.in_flight {
            return None;
        }
        let frame = entry.frames.pop_front()?;
        entry.in_flight = true;
        Some((frame, entry.cancel.clone()))
    }

    fn finish_stream(&self, stream_id: &str) {
        let requeue = match self.queues.get_mut(stream_id) {
            Some(mut entry) => {
                entry.in_flight = false;
                !entry.frames.is_empty()
            }
            None => false,
        };
        if requeue {
            let mut ready = self.ready.lock().expect("ready queue poisoned");
            if !ready.contains(&stream_id.to_string()) {
                ready.push_back(stream_id.to_string());
            }
            drop(ready);
            self.notify.notify_one();
        }
    }

    /// Listen for stream-end events and reap their queues.
    pub async fn watch_streams(self: Arc<Self>) {
        let mut rx = self.bus.subscribe();
        loop {
            match rx.recv().await {
                Ok(Event::StreamEnded { stream_id }) => self.remove_stream(&stream_id),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// Poll local inference health so dispatch can skip a dead server.
    pub async fn health_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = interval.tick() => {
                    let healthy = self.inference.health().await.is_ok();
                    let was = self.local_healthy.swap(healthy, Ordering::Relaxed);
                    if was != healthy {
                        warn!(healthy, "local inference health changed");
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Two-tier routing
    // -----------------------------------------------------------------------

    async fn process_frame(&self, frame: &Frame) {
        let Some(record) = self.streams.get_live(&frame.stream_id) else {
            return;
        };
        debug!(
            stream = %frame.stream_id,
            frame = %frame.id,
            captured = %frame.captured_at,
            masked = frame.zone_mask.is_some(),
            "frame dispatched"
        );
        let profile = profiles::profile(record.scenario);
        let prefs = record.preferences.as_ref();
        let motion_trip = frame.motion_score >= profile.motion_threshold_with(prefs);
        let audio_trip = frame.audio_level >= profile.audio_threshold_with(prefs);
        let image_b64 = BASE64.encode(&frame.payload);
        let t0 = std::time::Instant::now();

        // Stage 1: triage (one retry, then the cloud takes over).
        let triage = if self.local_healthy.load(Ordering::Relaxed) {
            match self.triage_once(profile, &image_b64).await {
                Ok(t) => Some(t),
                Err(e) if e.is_retryable() => {
                    debug!(stream = %frame.stream_id, error = %e, "triage retry");
                    self.triage_once(profile, &image_b64).await.ok()
                }
                Err(_) => None,
            }
        } else {
            None
        };

        let result = match triage {
            Some((concern, confidence)) => {
                // Stage 2: the filter. Quiet triage plus quiet sensors means
                // the frame is done.
                if concern == Concern::None && !motion_trip && !audio_trip {
                    let result = AnalysisResult {
                        id: Uuid::new_v4().to_string(),
                        stream_id: frame.stream_id.clone(),
                        frame_id: frame.id.clone(),
                        concern: Concern::None,
                        confidence,
                        description: "no concern".into(),
                        detected_issues: Vec::new(),
                        recommended_action: None,
                        processing_ms: t0.elapsed().as_millis() as u64,
                        model_name: self.triage_model.clone(),
                        used_cloud_fallback: false,
                        triage_result: Some(TriageResult { concern, confidence }),
                    };
                    self.publish_analyzed(&result);
                    self.telemetry.push(AnalysisEntry::new(
                        &frame.stream_id,
                        Concern::None,
                        &self.triage_model,
                        result.processing_ms,
                    ));
                    return;
                }

                let triage_result = TriageResult { concern, confidence };

                // Stage 3/4: shaky high-concern triage goes straight to the
                // cloud for verification; otherwise detailed local analysis,
                // falling back to the cloud when it fails.
                let needs_verify =
                    concern >= Concern::High && confidence < profile.verify_threshold;
                if needs_verify {
                    self.cloud_stage(frame, profile, &image_b64, Some(triage_result), t0)
                        .await
                } else {
                    match self.analysis_once(profile, &image_b64).await {
                        Ok(result) => Some(AnalysisResult {
                            triage_result: Some(triage_result),
                            ..result_from_local(frame, result, t0, &self.analysis_model)
                        }),
                        Err(e) => {
                            warn!(stream = %frame.stream_id, error = %e, "local analysis failed — cloud fallback");
                            self.cloud_stage(frame, profile, &image_b64, Some(triage_result), t0)
                                .await
                        }
                    }
                }
            }
            None => {
                // Local triage is out of the picture entirely.
                self.cloud_stage(frame, profile, &image_b64, None, t0).await
            }
        };

        match result {
            Some(result) => self.complete(frame, &record.scenario, result).await,
            None => {
                // Every analyzer failed. Motion or audio tripping locally
                // still deserves a visible warning; otherwise drop silently.
                self.telemetry.push(
                    AnalysisEntry::new(&frame.stream_id, Concern::None, "none", t0.elapsed().as_millis() as u64)
                        .failed(),
                );
                if motion_trip || audio_trip {
                    let alert_type = if motion_trip { AlertType::Motion } else { AlertType::Audio };
                    self.emit_alert(
                        frame,
                        record.scenario,
                        Concern::Medium,
                        alert_type,
                        "analysis unavailable".into(),
                        &[],
                    )
                    .await;
                }
            }
        }
    }

    async fn triage_once(
        &self,
        profile: &ScenarioProfile,
        image_b64: &str,
    ) -> Result<(Concern, f32), Error> {
        let reply = self
            .inference
            .generate(&self.triage_model, profile.triage_prompt, Some(image_b64))
            .await?;
        debug!(model = %reply.model, ms = reply.duration_ms, "triage reply");
        let concern = extract_concern(&reply.text);
        let confidence = extract_confidence(&reply.text);
        Ok((concern, confidence))
    }

    async fn analysis_once(
        &self,
        profile: &ScenarioProfile,
        image_b64: &str,
    ) -> Result<crate::inference::GenerateReply, Error> {
        self.inference
            .generate(&self.analysis_model, profile.analysis_prompt, Some(image_b64))
            .await
    }

    async fn cloud_stage(
        &self,
        frame: &Frame,
        profile: &ScenarioProfile,
        image_b64: &str,
        triage: Option<TriageResult>,
        t0: std::time::Instant,
    ) -> Option<AnalysisResult> {
        if self.cloud.is_empty() {
            return None;
        }
        match self.cloud.analyze(profile.analysis_prompt, image_b64).await {
            Ok(verdict) => Some(result_from_cloud(frame, verdict, t0, triage)),
            Err(e) => {
                warn!(stream = %frame.stream_id, error = %e, "cloud fallback exhausted");
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // Emission
    // -----------------------------------------------------------------------

    async fn complete(&self, frame: &Frame, scenario: &Scenario, result: AnalysisResult) {
        self.publish_analyzed(&result);

        let mut entry = AnalysisEntry::new(
            &frame.stream_id,
            result.concern,
            &result.model_name,
            result.processing_ms,
        );
        if result.used_cloud_fallback {
            entry = entry.cloud();
        }
        self.telemetry.push(entry);

        if result.concern >= Concern::Low {
            self.emit_alert(
                frame,
                *scenario,
                result.concern,
                AlertType::Analysis,
                result.description.clone(),
                &result.detected_issues,
            )
            .await;
        }
    }

    fn publish_analyzed(&self, result: &AnalysisResult) {
        self.bus.publish(Event::FrameAnalyzed {
            stream_id: result.stream_id.clone(),
            frame_id: result.frame_id.clone(),
            concern: result.concern,
            used_cloud_fallback: result.used_cloud_fallback,
        });
    }

    async fn emit_alert(
        &self,
        frame: &Frame,
        scenario: Scenario,
        concern: Concern,
        alert_type: AlertType,
        description: String,
        detected_issues: &[String],
    ) {
        let severity = concern.severity();
        let alert = Alert {
            id: Uuid::new_v4().to_string(),
            stream_id: frame.stream_id.clone(),
            alert_type,
            severity,
            title: format!("{} — {} concern", scenario_title(scenario), concern.as_str()),
            body: description,
            created_at: Utc::now(),
            acknowledged: false,
            acknowledged_at: None,
            escalation_level: 0,
        };

        // Moderation tap: detected issues that land in the category map
        // produce a content flag, persisted atomically with the alert.
        let flagged = self.moderation.classify(detected_issues);
        let stored = match &flagged {
            Some((tier, categories)) => {
                let flag = ContentFlag {
                    id: Uuid::new_v4().to_string(),
                    stream_id: frame.stream_id.clone(),
                    frame_id: Some(frame.id.clone()),
                    tier: *tier,
                    categories: categories.clone(),
                    status: FlagStatus::Pending,
                    created_at: Utc::now(),
                };
                store::alerts::insert_with_flag(
                    &self.pool,
                    &alert,
                    &flag,
                    &Uuid::new_v4().to_string(),
                    *tier >= 3,
                    profiles::blur_level(*tier),
                )
                .await
            }
            None => store::alerts::insert(&self.pool, &alert).await,
        };

        if let Err(e) = stored {
            warn!(stream = %frame.stream_id, error = %e, "alert persist failed");
            return;
        }

        info!(
            alert = %alert.id,
            stream = %frame.stream_id,
            severity = severity.as_str(),
            flagged = flagged.is_some(),
            "alert created"
        );

        self.streams.inc_alerts(&frame.stream_id);
        self.engine.start(alert.clone());
        self.bus.publish(Event::AlertCreated { alert });
    }
}

fn result_from_local(
    frame: &Frame,
    reply: crate::inference::GenerateReply,
    t0: std::time::Instant,
    model: &str,
) -> AnalysisResult {
    let concern = extract_concern(&reply.text);
    AnalysisResult {
        id: Uuid::new_v4().to_string(),
        stream_id: frame.stream_id.clone(),
        frame_id: frame.id.clone(),
        concern,
        confidence: extract_confidence(&reply.text),
        description: reply.text.trim().to_string(),
        detected_issues: extract_issues(&reply.text),
        recommended_action: None,
        processing_ms: t0.elapsed().as_millis() as u64,
        model_name: model.to_string(),
        used_cloud_fallback: false,
        triage_result: None,
    }
}

fn result_from_cloud(
    frame: &Frame,
    verdict: CloudVerdict,
    t0: std::time::Instant,
    triage: Option<TriageResult>,
) -> AnalysisResult {
    AnalysisResult {
        id: Uuid::new_v4().to_string(),
        stream_id: frame.stream_id.clone(),
        frame_id: frame.id.clone(),
        concern: verdict.concern,
        confidence: verdict.confidence,
        description: verdict.description,
        detected_issues: verdict.detected_issues,
        recommended_action: verdict.recommended_action,
        processing_ms: t0.elapsed().as_millis() as u64,
        model_name: verdict.model,
        used_cloud_fallback: true,
        triage_result: triage,
    }
}

fn scenario_title(scenario: Scenario) -> &'static str {
    match scenario {
        Scenario::Pet => "Pet monitor",
        Scenario::Baby => "Baby monitor",
        Scenario::Elderly => "Elder care",
    }
}

/// Map free-text model output to a concern level. The first recognized
/// keyword wins, so "LOW concern, no danger" reads as low, not high.
pub(crate) fn extract_concern(text: &str) -> Concern {
    for token in text.split(|c: char| !c.is_ascii_alphabetic()) {
        let level = match token.to_ascii_lowercase().as_str() {
            "critical" | "emergency" => Some(Concern::Critical),
            "high" | "urgent" | "danger" => Some(Concern::High),
            "medium" | "moderate" => Some(Concern::Medium),
            "low" | "minor" => Some(Concern::Low),
            "none" | "normal" | "safe" => Some(Concern::None),
            _ => None,
        };
        if let Some(level) = level {
            return level;
        }
    }
    Concern::Low
}

/// Pull a stated confidence ("85%") out of free text. Models that don't
/// state one get the benefit of the doubt — an unstated confidence should
/// not route every plain-keyword triage to the cloud.
pub(crate) fn extract_confidence(text: &str) -> f32 {
    for (i, c) in text.char_indices() {
        if c == '%' {
            let digits: String = text[..i]
                .chars()
                .rev()
                .take_while(|c| c.is_ascii_digit())
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            if let Ok(pct) = digits.parse::<f32>() {
                return (pct / 100.0).clamp(0.0, 1.0);
            }
        }
    }
    0.8
}

/// Issue keywords worth surfacing from a free-text analysis. Cloud verdicts
/// carry a structured list instead; this covers the local path.
pub(crate) fn extract_issues(text: &str) -> Vec<String> {
    const VOCAB: &[&str] = &[
        "crying", "fall", "fallen", "distress", "escape", "injury", "choking",
        "immobile", "immobility", "climbing", "destruction", "disorientation",
        "benign", "borderline", "suggestive", "sensitive", "graphic",
        "prohibited", "exploitation",
    ];
    let lower = text.to_ascii_lowercase();
    VOCAB
        .iter()
        .filter(|word| lower.contains(*word))
        .map(|w| w.to_string())
        .collect()
}
