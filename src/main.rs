use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod api;
mod banlist;
mod cloud;
mod config;
mod error;
mod escalation;
mod events;
mod inference;
mod notify;
mod pipeline;
mod profiles;
mod review;
mod signaling;
mod store;
mod streams;
mod telemetry;

pub use config::Config;
pub use error::{ApiError, Error};

/// Exit codes: 0 clean shutdown, 1 fatal init error, 2 config error.
#[tokio::main]
async fn main() {
    match std::env::args().nth(1).as_deref() {
        // Docker HEALTHCHECK entry point — no curl/wget needed in the image.
        Some("--healthcheck") => healthcheck().await,
        // One-shot VAPID keypair generator for first-time setup.
        Some("--gen-vapid") => {
            let (private, public) = notify::generate_vapid_keypair();
            println!("VAPID public key  (config): {public}");
            println!("VAPID private key (env):    {private}");
            return;
        }
        _ => {}
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vigil=info,tower_http=warn".into()),
        )
        .init();

    let config_path = std::env::var("VIGIL_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/vigil/config.toml"));

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %config_path.display(), error = %e, "config error");
            std::process::exit(2);
        }
    };

    if let Err(e) = run(config).await {
        error!(error = %e, "fatal init error");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    info!(
        api_port = config.server.api_port,
        ws_port = config.server.ws_port,
        "vigil starting"
    );

    // --- persistence & shared plumbing ---
    let pool = store::open(&config.store.db_path)
        .await
        .with_context(|| format!("opening store at {}", config.store.db_path))?;
    let banlist = Arc::new(
        banlist::BanList::load(std::path::Path::new(&config.server.ban_list_path))
            .await
            .context("loading ban list")?,
    );
    let bus = events::EventBus::new(256);
    let telemetry = Arc::new(telemetry::AnalysisLog::new(1024));

    // --- components, leaves first ---
    let streams = Arc::new(streams::StreamManager::new(
        pool.clone(),
        bus.clone(),
        Arc::clone(&banlist),
        Duration::from_secs(config.limits.ping_timeout_secs),
    ));

    let push = config
        .push
        .as_ref()
        .map(notify::PushChannel::from_config)
        .transpose()
        .context("building push channel")?
        .flatten();
    let sms = config.sms.as_ref().and_then(notify::SmsChannel::from_config);
    let chat = config.chat.as_ref().and_then(notify::ChatChannel::from_config);
    let notifier = Arc::new(notify::Notifier::new(
        pool.clone(),
        push,
        sms,
        chat,
        &config.limits,
    ));

    let sink: Arc<dyn escalation::EscalationSink> = notifier.clone();
    let engine = escalation::EscalationEngine::new(pool.clone(), bus.clone(), sink);

    let inference_client = Arc::new(inference::InferenceClient::new(
        &config.inference.base_url,
        config.inference.timeout_ms,
    ));
    match inference_client.models().await {
        Ok(models) => info!(?models, "local inference models"),
        Err(e) => tracing::warn!(error = %e, "local inference not reachable at startup"),
    }
    let cloud_chain = Arc::new(cloud::CloudFallback::new(
        &config.fallback_chain(),
        config.cloud.timeout_ms,
    ));

    let pipeline = pipeline::Pipeline::new(
        pool.clone(),
        inference_client,
        config.inference.triage_model.clone(),
        config.inference.analysis_model.clone(),
        cloud_chain,
        profiles::ModerationMap::with_defaults(),
        Arc::clone(&engine),
        Arc::clone(&streams),
        bus.clone(),
        Arc::clone(&telemetry),
        config.limits.frame_queue_capacity,
        config.limits.max_concurrent_analyses,
    );

    let review = Arc::new(review::ReviewQueue::new(
        pool.clone(),
        Arc::clone(&streams),
        Arc::clone(&banlist),
        Duration::from_secs(config.limits.lease_timeout_secs),
    ));
    let switch = Arc::new(signaling::SignalingSwitch::new(
        config.limits.max_rooms,
        config.limits.max_viewers_per_room,
        Duration::from_secs(config.limits.room_timeout_secs),
    ));

    let state = api::AppState {
        config: Arc::clone(&config),
        pool,
        bus,
        streams: Arc::clone(&streams),
        pipeline: Arc::clone(&pipeline),
        engine: Arc::clone(&engine),
        signaling: Arc::clone(&switch),
        review: Arc::clone(&review),
        notifier: Arc::clone(&notifier),
        banlist,
        telemetry,
        started_at: std::time::Instant::now(),
    };

    // --- background work ---
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let notifier = Arc::clone(&notifier);
        async move { notifier.probe().await }
    });
    tokio::spawn(Arc::clone(&pipeline).run(shutdown.clone()));
    tokio::spawn(Arc::clone(&pipeline).watch_streams());
    tokio::spawn(Arc::clone(&pipeline).health_loop(shutdown.clone()));
    tokio::spawn(sweeper_loop(state.clone(), shutdown.clone()));

    // --- listeners ---
    let api_addr: SocketAddr = format!("0.0.0.0:{}", config.server.api_port).parse()?;
    let ws_addr: SocketAddr = format!("0.0.0.0:{}", config.server.ws_port).parse()?;

    let api_listener = tokio::net::TcpListener::bind(api_addr)
        .await
        .with_context(|| format!("binding {api_addr}"))?;
    let ws_listener = tokio::net::TcpListener::bind(ws_addr)
        .await
        .with_context(|| format!("binding {ws_addr}"))?;

    info!(%api_addr, "REST API listening");
    info!(%ws_addr, "WebSocket endpoints listening");

    let trace_layer = || {
        tower_http::trace::TraceLayer::new_for_http()
            .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
            .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO))
    };

    let api_app = api::api_router(state.clone())
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(trace_layer());
    let ws_app = api::ws_router(state.clone()).layer(trace_layer());

    tokio::select! {
        result = axum::serve(api_listener, api_app) => {
            result.context("REST API server error")?;
        }
        result = axum::serve(ws_listener, ws_app) => {
            result.context("WebSocket server error")?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    // Stop intake and timers; in-flight notification sends are allowed to
    // finish inside the engine's sink calls.
    shutdown.cancel();
    engine.clear_all();
    streams.flush().await;
    info!("shutdown complete");
    Ok(())
}

/// Periodic maintenance: stream liveness, stale rooms, expired review
/// leases, counter flushes.
async fn sweeper_loop(state: api::AppState, shutdown: CancellationToken) {
    let mut liveness = tokio::time::interval(Duration::from_secs(10));
    let mut rooms = tokio::time::interval(Duration::from_secs(60));
    let mut leases = tokio::time::interval(Duration::from_secs(30));
    let mut flush = tokio::time::interval(Duration::from_secs(
        state.config.limits.flush_interval_secs.max(1),
    ));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = liveness.tick() => {
                // Ending a silent stream publishes stream:ended; the pipeline's
                // watcher reaps the queue.
                state.streams.sweep_silent().await;
            }
            _ = rooms.tick() => {
                state.signaling.sweep_stale().await;
            }
            _ = leases.tick() => {
                if let Err(e) = state.review.sweep_expired().await {
                    tracing::warn!(error = %e, "lease sweep failed");
                }
            }
            _ = flush.tick() => {
                state.streams.flush().await;
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Lightweight healthcheck: GET /api/health and exit 0 on 200, 1 otherwise.
/// Invoked via `vigil --healthcheck` from a container HEALTHCHECK.
async fn healthcheck() -> ! {
    let port = std::env::var("VIGIL_API_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(8080);

    let url = format!("http://127.0.0.1:{port}/api/health");
    match reqwest::get(&url).await {
        Ok(resp) if resp.status().is_success() => std::process::exit(0),
        _ => std::process::exit(1),
    }
}
