//! Notification fan-out.
//!
//! The notifier owns the channel registry (browser push, SMS, chat bot), the
//! per-target rate limits, and the bounded concurrent send loop. Channels
//! are isolated: a failing provider logs and moves on, it never blocks the
//! others. The escalation engine drives this through the [`EscalationSink`]
//! trait.

mod chat;
mod push;
mod sms;

pub use chat::ChatChannel;
pub use push::{generate_vapid_keypair, PushChannel};
pub use sms::SmsChannel;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt as _;
use sqlx::SqlitePool;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::{LimitsConfig, RateLimit};
use crate::error::Error;
use crate::escalation::{ChannelSet, EscalationSink, LadderStep};
use crate::store;
use crate::store::types::{Alert, PushSubscription, Severity, StreamPrefs};

/// What a channel delivers, shaped once per escalation step.
#[derive(Debug, Clone)]
pub struct NotificationPayload {
    pub title: String,
    pub body: String,
    pub severity: Severity,
    pub stream_id: String,
    pub alert_id: String,
    pub url: Option<String>,
}

impl NotificationPayload {
    pub fn for_alert(alert: &Alert) -> Self {
        Self {
            title: alert.title.clone(),
            body: alert.body.clone(),
            severity: alert.severity,
            stream_id: alert.stream_id.clone(),
            alert_id: alert.id.clone(),
            url: None,
        }
    }
}

/// Terminal state of one delivery attempt.
#[derive(Debug)]
pub enum SendOutcome {
    Delivered,
    /// The target is permanently gone (push 404/410) — prune it.
    Gone,
    Failed(String),
}

/// Sliding-window per-target limiter: at most `max_per_window` sends per
/// target per window. Rate-limited sends are never retried and never reach
/// the provider.
pub struct SendRateLimiter {
    max: u32,
    window: Duration,
    sends: DashMap<String, VecDeque<Instant>>,
}

impl SendRateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            max: limit.max_per_window,
            window: Duration::from_secs(limit.window_secs),
            sends: DashMap::new(),
        }
    }

    /// Consume a slot for `target`, or refuse.
    pub fn check(&self, target: &str) -> Result<(), Error> {
        let now = Instant::now();
        let mut entry = self.sends.entry(target.to_string()).or_default();
        while entry
            .front()
            .is_some_and(|t| now.duration_since(*t) > self.window)
        {
            entry.pop_front();
        }
        if entry.len() >= self.max as usize {
            return Err(Error::RateLimited);
        }
        entry.push_back(now);
        Ok(())
    }
}

enum SendJob {
    Push(PushSubscription),
    Sms(String),
    Chat(String),
}

pub struct Notifier {
    pool: SqlitePool,
    push: Option<PushChannel>,
    sms: Option<SmsChannel>,
    chat: Option<ChatChannel>,
    sms_limiter: SendRateLimiter,
    semaphore: Arc<Semaphore>,
    send_timeout: Duration,
}

impl Notifier {
    pub fn new(
        pool: SqlitePool,
        push: Option<PushChannel>,
        sms: Option<SmsChannel>,
        chat: Option<ChatChannel>,
        limits: &LimitsConfig,
    ) -> Self {
        info!(
            push = push.is_some(),
            sms = sms.is_some(),
            chat = chat.is_some(),
            "notifier channels"
        );
        Self {
            pool,
            push,
            sms,
            chat,
            sms_limiter: SendRateLimiter::new(limits.sms_rate_limit),
            semaphore: Arc::new(Semaphore::new(limits.max_concurrent_sends.max(1))),
            send_timeout: Duration::from_millis(limits.send_timeout_ms),
        }
    }

    /// Which channels are actually deliverable right now.
    pub fn available(&self) -> ChannelSet {
        ChannelSet {
            browser: self.push.is_some(),
            sms: self.sms.is_some(),
            chat: self.chat.is_some(),
        }
    }

    /// Probe configured provider endpoints once, logging outcomes. Run at
    /// startup so a bad credential shows up before the first real alert.
    pub async fn probe(&self) {
        if let Some(sms) = &self.sms {
            match sms.health().await {
                Ok(()) => info!("SMS provider reachable"),
                Err(e) => warn!(error = %e, "SMS provider probe failed"),
            }
        }
        if let Some(chat) = &self.chat {
            match chat.health().await {
                Ok(()) => info!("chat provider reachable"),
                Err(e) => warn!(error = %e, "chat provider probe failed"),
            }
        }
    }

    /// Fan a payload out to every subscription of every selected channel,
    /// honouring per-stream channel opt-outs.
    pub async fn fan_out(
        &self,
        payload: &NotificationPayload,
        channels: ChannelSet,
        prefs: Option<&StreamPrefs>,
    ) {
        let allow = |toggle: Option<bool>| toggle.unwrap_or(true);
        let mut jobs: Vec<SendJob> = Vec::new();

        if channels.browser && self.push.is_some() && allow(prefs.and_then(|p| p.notify_browser)) {
            match store::subs::list_push(&self.pool).await {
                Ok(subs) => jobs.extend(subs.into_iter().map(SendJob::Push)),
                Err(e) => warn!(error = %e, "push subscription listing failed"),
            }
        }
        if channels.sms && self.sms.is_some() && allow(prefs.and_then(|p| p.notify_sms)) {
            match store::subs::list_sms(&self.pool).await {
                Ok(numbers) => jobs.extend(numbers.into_iter().map(SendJob::Sms)),
                Err(e) => warn!(error = %e, "SMS recipient listing failed"),
            }
        }
        if channels.chat && self.chat.is_some() && allow(prefs.and_then(|p| p.notify_chat)) {
            match store::subs::list_chat(&self.pool).await {
                Ok(chats) => jobs.extend(chats.into_iter().map(SendJob::Chat)),
                Err(e) => warn!(error = %e, "chat recipient listing failed"),
            }
        }

        if jobs.is_empty() {
            return;
        }
        debug!(alert = %payload.alert_id, jobs = jobs.len(), "fan-out");

        futures_util::stream::iter(jobs)
            .for_each_concurrent(None, |job| async {
                let _permit = self.semaphore.acquire().await.expect("semaphore closed");
                self.dispatch(job, payload).await;
            })
            .await;
    }

    async fn dispatch(&self, job: SendJob, payload: &NotificationPayload) {
        match job {
            SendJob::Push(sub) => {
                let Some(push) = &self.push else { return };
                match tokio::time::timeout(self.send_timeout, push.send(&sub, payload)).await {
                    Ok(SendOutcome::Delivered) => {}
                    Ok(SendOutcome::Gone) => {
                        info!(endpoint = %sub.endpoint, "push endpoint gone — pruning");
                        if let Err(e) = store::subs::remove_push(&self.pool, &sub.endpoint).await {
                            warn!(error = %e, "push prune failed");
                        }
                    }
                    Ok(SendOutcome::Failed(reason)) => {
                        warn!(endpoint = %sub.endpoint, reason, "push send failed");
                    }
                    Err(_) => warn!(endpoint = %sub.endpoint, "push send timed out"),
                }
            }
            SendJob::Sms(number) => {
                let Some(sms) = &self.sms else { return };
                if self.sms_limiter.check(&number).is_err() {
                    debug!(to = %number, "SMS rate limit — send skipped");
                    return;
                }
                match tokio::time::timeout(self.send_timeout, sms.send(&number, payload)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(Error::RateLimited)) => {
                        debug!(to = %number, "provider rate limit — not retried");
                    }
                    Ok(Err(e)) => warn!(to = %number, error = %e, "SMS send failed"),
                    Err(_) => warn!(to = %number, "SMS send timed out"),
                }
            }
            SendJob::Chat(chat_id) => {
                let Some(chat) = &self.chat else { return };
                match tokio::time::timeout(self.send_timeout, chat.send(&chat_id, payload)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(chat = %chat_id, error = %e, "chat send failed"),
                    Err(_) => warn!(chat = %chat_id, "chat send timed out"),
                }
            }
        }
    }
}

#[async_trait]
impl EscalationSink for Notifier {
    async fn escalate(&self, alert: &Alert, step: &LadderStep) {
        let payload = NotificationPayload::for_alert(alert);
        let prefs = match store::streams::get(&self.pool, &alert.stream_id).await {
            Ok(record) => record.and_then(|r| r.preferences),
            Err(e) => {
                warn!(stream = %alert.stream_id, error = %e, "preference lookup failed");
                None
            }
        };
        self.fan_out(&payload, step.channels, prefs.as_ref()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChatConfig, SmsConfig};
    use wiremock::matchers::{method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn limits() -> LimitsConfig {
        LimitsConfig::default()
    }

    fn payload(severity: Severity) -> NotificationPayload {
        NotificationPayload {
            title: "t".into(),
            body: "b".into(),
            severity,
            stream_id: "s-1".into(),
            alert_id: "a-1".into(),
            url: None,
        }
    }

    fn all_channels() -> ChannelSet {
        ChannelSet { browser: true, sms: true, chat: true }
    }

    async fn sms_channel(server: &MockServer) -> SmsChannel {
        std::env::set_var("VIGIL_TEST_NOTIFY_SMS_TOKEN", "tok");
        SmsChannel::from_config(&SmsConfig {
            account_sid: "AC1".into(),
            auth_token_env: "VIGIL_TEST_NOTIFY_SMS_TOKEN".into(),
            from_number: "+15550001111".into(),
            api_base_url: server.uri(),
        })
        .unwrap()
    }

    async fn chat_channel(server: &MockServer) -> ChatChannel {
        std::env::set_var("VIGIL_TEST_NOTIFY_CHAT_TOKEN", "123:abc");
        ChatChannel::from_config(&ChatConfig {
            bot_token_env: "VIGIL_TEST_NOTIFY_CHAT_TOKEN".into(),
            api_base_url: server.uri(),
        })
        .unwrap()
    }

    // -----------------------------------------------------------------------
    // Rate limiter
    // -----------------------------------------------------------------------

    #[test]
    fn fourth_send_in_window_is_refused() {
        let limiter = SendRateLimiter::new(RateLimit { max_per_window: 3, window_secs: 600 });
        for _ in 0..3 {
            assert!(limiter.check("+15550001111").is_ok());
        }
        assert!(matches!(
            limiter.check("+15550001111").unwrap_err(),
            Error::RateLimited
        ));
    }

    #[test]
    fn limits_are_per_target() {
        let limiter = SendRateLimiter::new(RateLimit { max_per_window: 1, window_secs: 600 });
        assert!(limiter.check("+1000").is_ok());
        assert!(limiter.check("+2000").is_ok());
        assert!(limiter.check("+1000").is_err());
    }

    #[test]
    fn window_expiry_frees_slots() {
        let limiter = SendRateLimiter::new(RateLimit { max_per_window: 1, window_secs: 0 });
        assert!(limiter.check("+1000").is_ok());
        std::thread::sleep(Duration::from_millis(5));
        // window_secs = 0: the previous send has aged out.
        assert!(limiter.check("+1000").is_ok());
    }

    // -----------------------------------------------------------------------
    // Fan-out
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn sms_rate_limit_caps_provider_calls_at_three() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/2010-04-01/Accounts/.*/Messages\.json$"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "sid": "SM1", "status": "queued"
            })))
            .expect(3)
            .mount(&server)
            .await;

        let pool = crate::store::open_in_memory().await.unwrap();
        store::subs::upsert_sms(&pool, "+15559876543", None).await.unwrap();

        let notifier = Notifier::new(
            pool,
            None,
            Some(sms_channel(&server).await),
            None,
            &limits(),
        );

        // Four urgent alerts inside the window: the fourth never reaches the
        // provider.
        for _ in 0..4 {
            notifier
                .fan_out(&payload(Severity::Urgent), all_channels(), None)
                .await;
        }
    }

    #[tokio::test]
    async fn failing_push_does_not_block_chat() {
        let dead_push = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&dead_push)
            .await;

        let chat_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:abc/sendMessage"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "ok": true })))
            .expect(1)
            .mount(&chat_server)
            .await;

        let pool = crate::store::open_in_memory().await.unwrap();
        let (sub, _, _) = push_test_subscription(&format!("{}/ep", dead_push.uri()));
        store::subs::upsert_push(&pool, &sub).await.unwrap();
        store::subs::upsert_chat(&pool, "42", None).await.unwrap();

        let notifier = Notifier::new(
            pool,
            Some(push_test_channel()),
            None,
            Some(chat_channel(&chat_server).await),
            &limits(),
        );

        notifier
            .fan_out(&payload(Severity::Critical), all_channels(), None)
            .await;
    }

    #[tokio::test]
    async fn gone_push_endpoint_is_pruned() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;

        let pool = crate::store::open_in_memory().await.unwrap();
        let (sub, _, _) = push_test_subscription(&format!("{}/ep", server.uri()));
        store::subs::upsert_push(&pool, &sub).await.unwrap();

        let notifier = Notifier::new(pool.clone(), Some(push_test_channel()), None, None, &limits());
        notifier
            .fan_out(&payload(Severity::Critical), all_channels(), None)
            .await;

        assert!(store::subs::list_push(&pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stream_opt_out_suppresses_a_channel() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({})))
            .expect(0)
            .mount(&server)
            .await;

        let pool = crate::store::open_in_memory().await.unwrap();
        store::subs::upsert_sms(&pool, "+15559876543", None).await.unwrap();

        let notifier = Notifier::new(pool, None, Some(sms_channel(&server).await), None, &limits());
        let prefs = StreamPrefs { notify_sms: Some(false), ..Default::default() };
        notifier
            .fan_out(&payload(Severity::Critical), all_channels(), Some(&prefs))
            .await;
    }

    #[tokio::test]
    async fn unselected_channels_are_skipped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({})))
            .expect(0)
            .mount(&server)
            .await;

        let pool = crate::store::open_in_memory().await.unwrap();
        store::subs::upsert_sms(&pool, "+15559876543", None).await.unwrap();

        let notifier = Notifier::new(pool, None, Some(sms_channel(&server).await), None, &limits());
        // Level-2 channel set: browser only.
        let browser_only = ChannelSet { browser: true, sms: false, chat: false };
        notifier
            .fan_out(&payload(Severity::Warning), browser_only, None)
            .await;
    }

    // Helpers bridging into the push module's test key material.

    fn push_test_channel() -> PushChannel {
        let (private, public) = generate_vapid_keypair();
        std::env::set_var("VIGIL_TEST_NOTIFY_VAPID", &private);
        PushChannel::from_config(&crate::config::PushConfig {
            vapid_public_key: public,
            vapid_private_key_env: "VIGIL_TEST_NOTIFY_VAPID".into(),
            vapid_subject: "mailto:ops@vigil.example".into(),
        })
        .unwrap()
        .unwrap()
    }

    fn push_test_subscription(endpoint: &str) -> (PushSubscription, (), ()) {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine as _;
        use p256::elliptic_curve::sec1::ToEncodedPoint;
        use rand::RngCore;

        let ua_secret = p256::SecretKey::random(&mut rand::rngs::OsRng);
        let mut auth = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut auth);
        (
            PushSubscription {
                endpoint: endpoint.into(),
                p256dh: URL_SAFE_NO_PAD
                    .encode(ua_secret.public_key().to_encoded_point(false).as_bytes()),
                auth: URL_SAFE_NO_PAD.encode(auth),
                user_id: None,
            },
            (),
            (),
        )
    }
}
