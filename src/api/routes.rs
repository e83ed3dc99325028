//! REST handlers.
//!
//! Every response uses the `{ success, data?, error? }` envelope; failures
//! come back through [`ApiError`] with the status mapped from the domain
//! error kind.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{ApiError, Error};
use crate::store;
use crate::store::types::{
    ContentFlag, FlagStatus, ReviewDecision, Scenario, StreamPrefs, StreamStatus, UserProfile,
};

use super::AppState;

fn ok<T: serde::Serialize>(data: T) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

// ---------------------------------------------------------------------------
// Status & health
// ---------------------------------------------------------------------------

/// `GET /api/status` — uptime and aggregate metrics.
pub async fn status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let analysis = state.telemetry.stats().await;
    let streams = state.streams.summary();
    let pending_reviews = store::review::count_pending(&state.pool).await?;
    let (cpu_load, mem_kb) = process_stats();

    Ok(ok(json!({
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "streams": streams,
        "pending_reviews": pending_reviews,
        "analysis": {
            "total": analysis.total_analyses,
            "cloud_fallback_rate": analysis.cloud_fallback_rate,
            "avg_response_ms": analysis.avg_latency_ms,
            "errors": analysis.error_count,
        },
        "active_alerts": state.engine.active().len(),
        "rooms": state.signaling.room_count().await,
        "peers": state.signaling.peer_count().await,
        "channels": state.notifier.available(),
        "banned_users": state.banlist.len().await,
        "cpu_load_1m": cpu_load,
        "memory_kb": mem_kb,
    })))
}

/// `GET /api/health` — 200 when the store answers and intake is wired.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match store::ping(&state.pool).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "success": true, "data": "ok" }))),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "success": false, "error": e.to_string() })),
        ),
    }
}

/// 1-minute load average and resident memory, best effort (zero off Linux).
fn process_stats() -> (f64, u64) {
    let load = std::fs::read_to_string("/proc/loadavg")
        .ok()
        .and_then(|s| s.split_whitespace().next().and_then(|v| v.parse().ok()))
        .unwrap_or(0.0);
    let mem_kb = std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|s| s.split_whitespace().nth(1).and_then(|v| v.parse::<u64>().ok()))
        .map(|pages| pages * 4)
        .unwrap_or(0);
    (load, mem_kb)
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct CreateStream {
    pub scenario: Scenario,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Deserialize)]
pub struct ListStreamsQuery {
    #[serde(default)]
    pub scenario: Option<Scenario>,
    #[serde(default)]
    pub active: Option<bool>,
}

pub async fn list_streams(
    State(state): State<AppState>,
    Query(query): Query<ListStreamsQuery>,
) -> Result<Json<Value>, ApiError> {
    // Filtered queries answer from the live view; the unfiltered list
    // includes ended streams from the store.
    let streams = match (query.scenario, query.active) {
        (Some(scenario), _) => state.streams.get_by_scenario(scenario),
        (None, Some(true)) => state.streams.active_list(),
        _ => store::streams::list(&state.pool).await?,
    };
    Ok(ok(streams))
}

pub async fn create_stream(
    State(state): State<AppState>,
    Json(body): Json<CreateStream>,
) -> Result<impl IntoResponse, ApiError> {
    let stream = state
        .streams
        .create(body.scenario, body.name, body.user_id)
        .await?;
    Ok((StatusCode::CREATED, ok(stream)))
}

pub async fn get_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let stream = state
        .streams
        .get(&id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("stream {id}")))?;
    Ok(ok(json!({
        "stream": stream,
        "analysis_backlog": state.pipeline.backlog(&id),
    })))
}

#[derive(Deserialize)]
pub struct UpdateStream {
    #[serde(default)]
    pub status: Option<StreamStatus>,
    #[serde(default)]
    pub preferences: Option<StreamPrefs>,
}

pub async fn update_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateStream>,
) -> Result<Json<Value>, ApiError> {
    match body.status {
        Some(StreamStatus::Paused) => {
            state.streams.pause(&id).await?;
        }
        Some(StreamStatus::Active) => {
            state.streams.resume(&id).await?;
        }
        Some(StreamStatus::Disconnected) => {
            state.streams.end(&id).await?;
        }
        Some(StreamStatus::Connecting) => {
            return Err(Error::InvalidInput("cannot transition to connecting".into()).into());
        }
        None => {}
    }
    if let Some(prefs) = body.preferences {
        if !state.streams.set_preferences(&id, prefs).await? {
            return Err(Error::NotFound(format!("stream {id}")).into());
        }
    }
    let stream = state
        .streams
        .get(&id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("stream {id}")))?;
    Ok(ok(stream))
}

pub async fn delete_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.streams.end(&id).await?;
    if !store::streams::delete(&state.pool, &id).await? {
        return Err(Error::NotFound(format!("stream {id}")).into());
    }
    Ok(ok(json!({ "deleted": id })))
}

pub async fn pause_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.streams.pause(&id).await? {
        return Err(Error::NotFound(format!("stream {id}")).into());
    }
    Ok(ok(json!({ "status": "paused" })))
}

pub async fn resume_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.streams.resume(&id).await? {
        return Err(Error::NotFound(format!("stream {id}")).into());
    }
    Ok(ok(json!({ "status": "active" })))
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

/// Recent alerts for one stream, newest first.
pub async fn stream_alerts(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.streams.get(&id).await?.is_none() {
        return Err(Error::NotFound(format!("stream {id}")).into());
    }
    let alerts = store::alerts::list_for_stream(&state.pool, &id, 100).await?;
    Ok(ok(alerts))
}

/// One alert with its live escalation state. The `escalation` block is null
/// once the alert is acknowledged or cleared.
pub async fn get_alert(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let alert = store::alerts::get(&state.pool, &id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("alert {id}")))?;
    let escalation = state.engine.level(&id).map(|level| {
        json!({
            "level": level,
            "volume": state.engine.volume(&id),
            "sound": state.engine.sound(&id),
        })
    });
    Ok(ok(json!({ "alert": alert, "escalation": escalation })))
}

pub async fn acknowledge_alert(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let acked = state.engine.acknowledge(&id).await?;
    Ok(ok(json!({ "acknowledged": acked })))
}

// ---------------------------------------------------------------------------
// Saved profiles
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct CreateProfile {
    pub name: String,
    pub scenario: Scenario,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub preferences: StreamPrefs,
}

pub async fn list_profiles(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(ok(store::profiles::list(&state.pool).await?))
}

pub async fn create_profile(
    State(state): State<AppState>,
    Json(body): Json<CreateProfile>,
) -> Result<impl IntoResponse, ApiError> {
    let profile = UserProfile {
        id: Uuid::new_v4().to_string(),
        user_id: body.user_id,
        name: body.name,
        scenario: body.scenario,
        preferences: body.preferences,
        active: false,
        created_at: Utc::now(),
    };
    store::profiles::insert(&state.pool, &profile).await?;
    Ok((StatusCode::CREATED, ok(profile)))
}

pub async fn delete_profile(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !store::profiles::delete(&state.pool, &id).await? {
        return Err(Error::NotFound(format!("profile {id}")).into());
    }
    Ok(ok(json!({ "deleted": id })))
}

pub async fn activate_profile(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !store::profiles::activate(&state.pool, &id).await? {
        return Err(Error::NotFound(format!("profile {id}")).into());
    }
    Ok(ok(json!({ "activated": id })))
}

// ---------------------------------------------------------------------------
// Review
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct CreateFlag {
    pub stream_id: String,
    pub tier: u8,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub frame_id: Option<String>,
}

pub async fn list_flags(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(ok(store::alerts::list_flags(&state.pool, 200).await?))
}

pub async fn create_flag(
    State(state): State<AppState>,
    Json(body): Json<CreateFlag>,
) -> Result<impl IntoResponse, ApiError> {
    if !(1..=4).contains(&body.tier) {
        return Err(Error::InvalidInput("tier must be 1..=4".into()).into());
    }
    let flag = ContentFlag {
        id: Uuid::new_v4().to_string(),
        stream_id: body.stream_id,
        frame_id: body.frame_id,
        tier: body.tier,
        categories: body.categories,
        status: FlagStatus::Pending,
        created_at: Utc::now(),
    };
    state.review.enqueue(&flag).await?;
    Ok((StatusCode::CREATED, ok(flag)))
}

#[derive(Deserialize)]
pub struct FlagAction {
    pub action: FlagActionKind,
}

#[derive(Deserialize, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum FlagActionKind {
    Approve,
    Reject,
    Escalate,
}

/// `POST /api/review/flags/:id/action` — administrative action on a flag,
/// outside the reviewer lease flow.
pub async fn flag_action(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<FlagAction>,
) -> Result<Json<Value>, ApiError> {
    let flag = store::alerts::get_flag(&state.pool, &id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("flag {id}")))?;

    let (flag_status, queue_status, tier) = match body.action {
        FlagActionKind::Approve => (FlagStatus::Dismissed, FlagStatus::Reviewed, None),
        FlagActionKind::Reject => (FlagStatus::Blocked, FlagStatus::Reviewed, None),
        FlagActionKind::Escalate => (FlagStatus::Escalated, FlagStatus::Pending, Some(4)),
    };

    store::alerts::set_flag_status(&state.pool, &id, flag_status).await?;
    store::review::set_status_for_flag(&state.pool, &id, queue_status, tier).await?;
    if matches!(body.action, FlagActionKind::Reject) {
        state.streams.end(&flag.stream_id).await?;
    }

    Ok(ok(json!({ "flag": id, "status": flag_status })))
}

/// The queue itself — pending first, highest tier first.
pub async fn review_queue(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(ok(store::review::list(&state.pool, 200).await?))
}

#[derive(Deserialize)]
pub struct ReviewNext {
    pub reviewer_id: String,
    #[serde(default)]
    pub privileged: bool,
}

/// `POST /api/review/next` — lease the highest-priority pending item.
pub async fn review_next(
    State(state): State<AppState>,
    Json(body): Json<ReviewNext>,
) -> Result<Json<Value>, ApiError> {
    let item = state
        .review
        .next_for_reviewer(&body.reviewer_id, body.privileged)
        .await?;
    Ok(ok(item))
}

#[derive(Deserialize)]
pub struct ReviewSubmit {
    pub reviewer_id: String,
    pub decision: ReviewDecision,
    #[serde(default)]
    pub notes: Option<String>,
}

/// `POST /api/review/items/:id/submit` — apply the lessee's decision.
pub async fn review_submit(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ReviewSubmit>,
) -> Result<Json<Value>, ApiError> {
    state
        .review
        .submit(&id, &body.reviewer_id, body.decision, body.notes.as_deref())
        .await?;
    Ok(ok(json!({ "item": id, "decision": body.decision })))
}

// ---------------------------------------------------------------------------
// Notification subscriptions
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct PushSubscribe {
    pub endpoint: String,
    /// Browsers send `keys: {p256dh, auth}`; flat fields also accepted.
    #[serde(default)]
    pub keys: Option<PushKeys>,
    #[serde(default)]
    pub p256dh: Option<String>,
    #[serde(default)]
    pub auth: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Deserialize)]
pub struct PushKeys {
    pub p256dh: String,
    pub auth: String,
}

pub async fn subscribe_push(
    State(state): State<AppState>,
    Json(body): Json<PushSubscribe>,
) -> Result<impl IntoResponse, ApiError> {
    let (p256dh, auth) = match (body.keys, body.p256dh, body.auth) {
        (Some(keys), _, _) => (keys.p256dh, keys.auth),
        (None, Some(p256dh), Some(auth)) => (p256dh, auth),
        _ => return Err(Error::InvalidInput("missing p256dh/auth keys".into()).into()),
    };
    let sub = crate::store::types::PushSubscription {
        endpoint: body.endpoint,
        p256dh,
        auth,
        user_id: body.user_id,
    };
    store::subs::upsert_push(&state.pool, &sub).await?;
    Ok((StatusCode::CREATED, ok(json!({ "endpoint": sub.endpoint }))))
}

#[derive(Deserialize)]
pub struct SmsSubscribe {
    pub e164: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

pub async fn subscribe_sms(
    State(state): State<AppState>,
    Json(body): Json<SmsSubscribe>,
) -> Result<impl IntoResponse, ApiError> {
    if !body.e164.starts_with('+') || body.e164.len() < 8 {
        return Err(Error::InvalidInput("phone number must be E.164".into()).into());
    }
    store::subs::upsert_sms(&state.pool, &body.e164, body.user_id.as_deref()).await?;
    Ok((StatusCode::CREATED, ok(json!({ "e164": body.e164 }))))
}

#[derive(Deserialize)]
pub struct ChatSubscribe {
    pub chat_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

pub async fn subscribe_telegram(
    State(state): State<AppState>,
    Json(body): Json<ChatSubscribe>,
) -> Result<impl IntoResponse, ApiError> {
    store::subs::upsert_chat(&state.pool, &body.chat_id, body.user_id.as_deref()).await?;
    Ok((StatusCode::CREATED, ok(json!({ "chat_id": body.chat_id }))))
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::api::test_support;

    async fn send(
        app: axum::Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    // -----------------------------------------------------------------------
    // Status & health
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn status_reports_uptime_and_counts() {
        let state = test_support::state().await;
        let app = crate::api::api_router(state);

        let (status, json) = send(app, "GET", "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["pending_reviews"], 0);
        assert_eq!(json["data"]["streams"]["active"], 0);
        assert!(json["data"]["uptime_secs"].is_number());
    }

    #[tokio::test]
    async fn health_is_ok_with_live_store() {
        let state = test_support::state().await;
        let app = crate::api::api_router(state);
        let (status, json) = send(app, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
    }

    // -----------------------------------------------------------------------
    // Stream CRUD
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn create_stream_returns_201_with_id() {
        let state = test_support::state().await;
        let app = crate::api::api_router(state);

        let (status, json) = send(
            app,
            "POST",
            "/api/streams",
            Some(serde_json::json!({ "name": "Living Room", "scenario": "pet" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["data"]["scenario"], "pet");
        assert_eq!(json["data"]["status"], "active");
        assert!(json["data"]["id"].is_string());
    }

    #[tokio::test]
    async fn invalid_scenario_is_rejected() {
        let state = test_support::state().await;
        let app = crate::api::api_router(state);
        let (status, _) = send(
            app,
            "POST",
            "/api/streams",
            Some(serde_json::json!({ "scenario": "submarine" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn pause_resume_and_get_round_trip() {
        let state = test_support::state().await;
        let app = crate::api::api_router(state.clone());

        let (_, created) = send(
            app.clone(),
            "POST",
            "/api/streams",
            Some(serde_json::json!({ "scenario": "baby" })),
        )
        .await;
        let id = created["data"]["id"].as_str().unwrap().to_string();

        let (status, _) = send(app.clone(), "POST", &format!("/api/streams/{id}/pause"), None).await;
        assert_eq!(status, StatusCode::OK);

        let (_, got) = send(app.clone(), "GET", &format!("/api/streams/{id}"), None).await;
        assert_eq!(got["data"]["stream"]["status"], "paused");
        assert_eq!(got["data"]["analysis_backlog"], 0);

        let (status, _) =
            send(app.clone(), "POST", &format!("/api/streams/{id}/resume"), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(app, "GET", "/api/streams/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_streams_filters_by_scenario_and_activity() {
        let state = test_support::state().await;
        let app = crate::api::api_router(state.clone());

        for scenario in ["pet", "pet", "baby"] {
            send(
                app.clone(),
                "POST",
                "/api/streams",
                Some(serde_json::json!({ "scenario": scenario })),
            )
            .await;
        }

        let (_, pets) = send(app.clone(), "GET", "/api/streams?scenario=pet", None).await;
        assert_eq!(pets["data"].as_array().unwrap().len(), 2);

        let (_, active) = send(app.clone(), "GET", "/api/streams?active=true", None).await;
        assert_eq!(active["data"].as_array().unwrap().len(), 3);

        let (_, all) = send(app, "GET", "/api/streams", None).await;
        assert_eq!(all["data"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn stream_alerts_route_lists_for_one_stream() {
        let state = test_support::state().await;
        let app = crate::api::api_router(state.clone());

        let (_, created) = send(
            app.clone(),
            "POST",
            "/api/streams",
            Some(serde_json::json!({ "scenario": "pet" })),
        )
        .await;
        let id = created["data"]["id"].as_str().unwrap().to_string();

        let (status, listed) = send(app.clone(), "GET", &format!("/api/streams/{id}/alerts"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed["data"].as_array().unwrap().len(), 0);

        let (status, _) = send(app, "GET", "/api/streams/ghost/alerts", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn review_queue_route_orders_pending_by_tier() {
        let state = test_support::state().await;
        let app = crate::api::api_router(state);

        for tier in [2, 4, 1] {
            send(
                app.clone(),
                "POST",
                "/api/review/flags",
                Some(serde_json::json!({ "stream_id": "s-1", "tier": tier })),
            )
            .await;
        }

        let (_, queue) = send(app, "GET", "/api/review/queue", None).await;
        let tiers: Vec<i64> = queue["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|item| item["tier"].as_i64().unwrap())
            .collect();
        assert_eq!(tiers, vec![4, 2, 1]);
    }

    #[tokio::test]
    async fn delete_stream_removes_the_row() {
        let state = test_support::state().await;
        let app = crate::api::api_router(state);

        let (_, created) = send(
            app.clone(),
            "POST",
            "/api/streams",
            Some(serde_json::json!({ "scenario": "pet" })),
        )
        .await;
        let id = created["data"]["id"].as_str().unwrap().to_string();

        let (status, _) = send(app.clone(), "DELETE", &format!("/api/streams/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(app, "GET", &format!("/api/streams/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    // -----------------------------------------------------------------------
    // Review surface
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn flag_lifecycle_over_http() {
        let state = test_support::state().await;
        let app = crate::api::api_router(state);

        let (status, flag) = send(
            app.clone(),
            "POST",
            "/api/review/flags",
            Some(serde_json::json!({ "stream_id": "s-1", "tier": 3, "categories": ["sensitive"] })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let flag_id = flag["data"]["id"].as_str().unwrap().to_string();

        // Lease it, then submit a safe decision.
        let (_, item) = send(
            app.clone(),
            "POST",
            "/api/review/next",
            Some(serde_json::json!({ "reviewer_id": "r1", "privileged": true })),
        )
        .await;
        let item_id = item["data"]["id"].as_str().unwrap().to_string();
        assert_eq!(item["data"]["flag_id"], flag_id.as_str());

        let (status, _) = send(
            app.clone(),
            "POST",
            &format!("/api/review/items/{item_id}/submit"),
            Some(serde_json::json!({ "reviewer_id": "r1", "decision": "safe" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, listed) = send(app, "GET", "/api/review/flags", None).await;
        assert_eq!(listed["data"][0]["status"], "dismissed");
    }

    #[tokio::test]
    async fn wrong_reviewer_submit_conflicts() {
        let state = test_support::state().await;
        let app = crate::api::api_router(state);

        send(
            app.clone(),
            "POST",
            "/api/review/flags",
            Some(serde_json::json!({ "stream_id": "s-1", "tier": 2 })),
        )
        .await;
        let (_, item) = send(
            app.clone(),
            "POST",
            "/api/review/next",
            Some(serde_json::json!({ "reviewer_id": "r1" })),
        )
        .await;
        let item_id = item["data"]["id"].as_str().unwrap().to_string();

        let (status, json) = send(
            app,
            "POST",
            &format!("/api/review/items/{item_id}/submit"),
            Some(serde_json::json!({ "reviewer_id": "someone-else", "decision": "safe" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["success"], false);
    }

    #[tokio::test]
    async fn flag_action_escalate_requeues_at_tier_four() {
        let state = test_support::state().await;
        let app = crate::api::api_router(state);

        let (_, flag) = send(
            app.clone(),
            "POST",
            "/api/review/flags",
            Some(serde_json::json!({ "stream_id": "s-1", "tier": 2 })),
        )
        .await;
        let flag_id = flag["data"]["id"].as_str().unwrap().to_string();

        let (status, _) = send(
            app.clone(),
            "POST",
            &format!("/api/review/flags/{flag_id}/action"),
            Some(serde_json::json!({ "action": "escalate" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, item) = send(
            app,
            "POST",
            "/api/review/next",
            Some(serde_json::json!({ "reviewer_id": "r1", "privileged": true })),
        )
        .await;
        assert_eq!(item["data"]["tier"], 4);
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn push_subscription_accepts_browser_shape_and_dedupes() {
        let state = test_support::state().await;
        let app = crate::api::api_router(state.clone());

        for _ in 0..2 {
            let (status, _) = send(
                app.clone(),
                "POST",
                "/api/notifications/subscribe/push",
                Some(serde_json::json!({
                    "endpoint": "https://push.example/ep1",
                    "keys": { "p256dh": "BKey", "auth": "c2VjcmV0" }
                })),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
        }

        let subs = crate::store::subs::list_push(&state.pool).await.unwrap();
        assert_eq!(subs.len(), 1);
    }

    #[tokio::test]
    async fn sms_subscription_requires_e164() {
        let state = test_support::state().await;
        let app = crate::api::api_router(state);

        let (status, _) = send(
            app.clone(),
            "POST",
            "/api/notifications/subscribe/sms",
            Some(serde_json::json!({ "e164": "5551234" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            app,
            "POST",
            "/api/notifications/subscribe/sms",
            Some(serde_json::json!({ "e164": "+15551234567" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn responses_carry_request_id_header() {
        let state = test_support::state().await;
        let app = crate::api::api_router(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(resp.headers().contains_key("x-request-id"));
    }
}
