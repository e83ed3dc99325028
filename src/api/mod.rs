//! HTTP and WebSocket surface.
//!
//! Two listeners: the JSON REST API on `api_port` and the WebSocket
//! endpoints (stream intake, signaling) on `ws_port`. Handlers are thin —
//! they translate HTTP concerns into calls on the shared [`AppState`]
//! components and back.

pub mod routes;
pub mod signaling_ws;
pub mod stream_ws;

use std::sync::Arc;

use axum::{
    extract::Request,
    http::HeaderValue,
    middleware::Next,
    response::Response,
    routing::{delete, get, post},
    Router,
};
use sqlx::SqlitePool;
use tracing::Instrument as _;
use uuid::Uuid;

use crate::banlist::BanList;
use crate::config::Config;
use crate::escalation::EscalationEngine;
use crate::events::EventBus;
use crate::notify::Notifier;
use crate::pipeline::Pipeline;
use crate::review::ReviewQueue;
use crate::signaling::SignalingSwitch;
use crate::streams::StreamManager;
use crate::telemetry::AnalysisLog;

/// Shared application state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub bus: EventBus,
    pub streams: Arc<StreamManager>,
    pub pipeline: Arc<Pipeline>,
    pub engine: Arc<EscalationEngine>,
    pub signaling: Arc<SignalingSwitch>,
    pub review: Arc<ReviewQueue>,
    pub notifier: Arc<Notifier>,
    pub banlist: Arc<BanList>,
    pub telemetry: Arc<AnalysisLog>,
    pub started_at: std::time::Instant,
}

/// Build the REST router (api_port).
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(routes::status))
        .route("/api/health", get(routes::health))
        .route("/api/streams", get(routes::list_streams).post(routes::create_stream))
        .route(
            "/api/streams/{id}",
            get(routes::get_stream)
                .patch(routes::update_stream)
                .delete(routes::delete_stream),
        )
        .route("/api/streams/{id}/pause", post(routes::pause_stream))
        .route("/api/streams/{id}/resume", post(routes::resume_stream))
        .route("/api/streams/{id}/alerts", get(routes::stream_alerts))
        .route("/api/alerts/{id}", get(routes::get_alert))
        .route("/api/alerts/{id}/acknowledge", post(routes::acknowledge_alert))
        .route("/api/profiles", get(routes::list_profiles).post(routes::create_profile))
        .route("/api/profiles/{id}", delete(routes::delete_profile))
        .route("/api/profiles/{id}/activate", post(routes::activate_profile))
        .route("/api/review/flags", get(routes::list_flags).post(routes::create_flag))
        .route("/api/review/flags/{id}/action", post(routes::flag_action))
        .route("/api/review/queue", get(routes::review_queue))
        .route("/api/review/next", post(routes::review_next))
        .route("/api/review/items/{id}/submit", post(routes::review_submit))
        .route(
            "/api/notifications/subscribe/push",
            post(routes::subscribe_push),
        )
        .route("/api/notifications/subscribe/sms", post(routes::subscribe_sms))
        .route(
            "/api/notifications/subscribe/telegram",
            post(routes::subscribe_telegram),
        )
        .layer(axum::middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Build the WebSocket router (ws_port).
pub fn ws_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/stream/{id}", get(stream_ws::stream_socket))
        .route("/signaling", get(signaling_ws::signaling_socket))
        .with_state(state)
}

/// Assign every request an `X-Request-ID` (caller-provided or fresh), carry
/// it through a tracing span, and echo it on the response.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let span = tracing::debug_span!("request", id = %id);
    req.extensions_mut().insert(id.clone());
    let mut response = next.run(req).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}
