//! Browser push channel.
//!
//! Implements the real thing end to end: RFC 8291 `aes128gcm` payload
//! encryption (ephemeral P-256 ECDH + HKDF-SHA256 + AES-128-GCM) and
//! RFC 8292 VAPID (ES256-signed JWT bound to the endpoint origin). Endpoints
//! answering 404/410 are reported as gone so the fan-out layer can prune
//! them.

use std::time::Duration;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes128Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hkdf::Hkdf;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use reqwest::Client;
use serde_json::json;
use sha2::Sha256;
use tracing::debug;

use crate::config::PushConfig;
use crate::error::Error;
use crate::store::types::{PushSubscription, Severity};

use super::{NotificationPayload, SendOutcome};

/// Record size for the single-record aes128gcm body.
const RECORD_SIZE: u32 = 4096;
/// VAPID token lifetime — well under the 24 h ceiling.
const VAPID_TTL_SECS: i64 = 12 * 3600;

pub struct PushChannel {
    client: Client,
    vapid_private: SecretKey,
    vapid_public_b64: String,
    subject: String,
}

impl PushChannel {
    /// Build the channel, resolving the VAPID private key from the
    /// environment. Returns `None` (channel unavailable) when the key is
    /// unset; a key that is set but malformed is a hard error.
    pub fn from_config(cfg: &PushConfig) -> anyhow::Result<Option<Self>> {
        let Ok(raw) = std::env::var(&cfg.vapid_private_key_env) else {
            return Ok(None);
        };
        if raw.is_empty() {
            return Ok(None);
        }

        let scalar = b64url_decode(&raw)
            .map_err(|e| anyhow::anyhow!("VAPID private key is not base64url: {e}"))?;
        let vapid_private = SecretKey::from_slice(&scalar)
            .map_err(|e| anyhow::anyhow!("VAPID private key is not a P-256 scalar: {e}"))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build reqwest client");

        Ok(Some(Self {
            client,
            vapid_private,
            vapid_public_b64: cfg.vapid_public_key.clone(),
            subject: cfg.vapid_subject.clone(),
        }))
    }

    /// Deliver one notification to one subscription.
    pub async fn send(&self, sub: &PushSubscription, payload: &NotificationPayload) -> SendOutcome {
        let body = json!({
            "title": payload.title,
            "body": payload.body,
            "severity": payload.severity,
            "stream_id": payload.stream_id,
            "alert_id": payload.alert_id,
            "url": payload.url,
            "icon": "/icons/alert.png",
            "requireInteraction": payload.severity >= Severity::Urgent,
        });

        let ciphertext = match encrypt_payload(&sub.p256dh, &sub.auth, body.to_string().as_bytes()) {
            Ok(c) => c,
            Err(e) => return SendOutcome::Failed(format!("encryption: {e}")),
        };

        let auth_header = match self.vapid_header(&sub.endpoint) {
            Ok(h) => h,
            Err(e) => return SendOutcome::Failed(format!("vapid: {e}")),
        };

        debug!(endpoint = %sub.endpoint, "sending web push");

        let urgency = if payload.severity >= Severity::Urgent { "high" } else { "normal" };
        let response = self
            .client
            .post(&sub.endpoint)
            .header("authorization", auth_header)
            .header("content-encoding", "aes128gcm")
            .header("content-type", "application/octet-stream")
            .header("ttl", "300")
            .header("urgency", urgency)
            .body(ciphertext)
            .send()
            .await;

        match response {
            Ok(r) if r.status().is_success() => SendOutcome::Delivered,
            Ok(r) if r.status() == 404 || r.status() == 410 => SendOutcome::Gone,
            Ok(r) => SendOutcome::Failed(format!("push HTTP {}", r.status())),
            Err(e) => SendOutcome::Failed(e.to_string()),
        }
    }

    /// `Authorization: vapid t=<jwt>, k=<public key>` for an endpoint.
    fn vapid_header(&self, endpoint: &str) -> Result<String, Error> {
        let aud = origin_of(endpoint)
            .ok_or_else(|| Error::InvalidInput(format!("endpoint has no origin: {endpoint}")))?;
        let exp = chrono::Utc::now().timestamp() + VAPID_TTL_SECS;

        let header = URL_SAFE_NO_PAD.encode(br#"{"typ":"JWT","alg":"ES256"}"#);
        let claims = URL_SAFE_NO_PAD.encode(
            json!({ "aud": aud, "exp": exp, "sub": self.subject }).to_string(),
        );
        let signing_input = format!("{header}.{claims}");

        let signing_key = SigningKey::from(&self.vapid_private);
        let signature: Signature = signing_key.sign(signing_input.as_bytes());
        let token = format!(
            "{signing_input}.{}",
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        );

        Ok(format!("vapid t={token}, k={}", self.vapid_public_b64))
    }
}

/// Encrypt `plaintext` for a subscription per RFC 8291 (aes128gcm).
///
/// Output is the complete HTTP body: the 86-byte header (salt, record size,
/// our ephemeral public key) followed by one AES-128-GCM record holding the
/// padded plaintext.
fn encrypt_payload(p256dh: &str, auth: &str, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
    let ua_public_bytes = b64url_decode(p256dh)?;
    let auth_secret = b64url_decode(auth)?;
    if auth_secret.len() != 16 {
        return Err(Error::InvalidInput("auth secret must be 16 bytes".into()));
    }
    let ua_public = PublicKey::from_sec1_bytes(&ua_public_bytes)
        .map_err(|e| Error::InvalidInput(format!("bad p256dh key: {e}")))?;

    let ephemeral = SecretKey::random(&mut OsRng);
    let as_public_bytes = ephemeral.public_key().to_encoded_point(false).as_bytes().to_vec();

    let shared = p256::ecdh::diffie_hellman(ephemeral.to_nonzero_scalar(), ua_public.as_affine());

    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);

    let (cek, nonce) = derive_keys(
        shared.raw_secret_bytes(),
        &auth_secret,
        &ua_public_bytes,
        &as_public_bytes,
        &salt,
    )?;

    // Single record: plaintext, then the 0x02 last-record delimiter.
    let mut record = Vec::with_capacity(plaintext.len() + 1);
    record.extend_from_slice(plaintext);
    record.push(0x02);

    let cipher = Aes128Gcm::new_from_slice(&cek)
        .map_err(|_| Error::InvalidInput("bad content-encryption key length".into()))?;
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), record.as_ref())
        .map_err(|_| Error::InvalidInput("payload encryption failed".into()))?;

    // Header: salt(16) | rs(4) | idlen(1) | keyid(65)
    let mut body = Vec::with_capacity(16 + 4 + 1 + 65 + sealed.len());
    body.extend_from_slice(&salt);
    body.extend_from_slice(&RECORD_SIZE.to_be_bytes());
    body.push(as_public_bytes.len() as u8);
    body.extend_from_slice(&as_public_bytes);
    body.extend_from_slice(&sealed);
    Ok(body)
}

/// RFC 8291 §3.3/§3.4: ECDH secret → (CEK, nonce).
fn derive_keys(
    ecdh_secret: impl AsRef<[u8]>,
    auth_secret: &[u8],
    ua_public: &[u8],
    as_public: &[u8],
    salt: &[u8],
) -> Result<([u8; 16], [u8; 12]), Error> {
    let mut key_info = Vec::with_capacity(14 + 65 + 65);
    key_info.extend_from_slice(b"WebPush: info\0");
    key_info.extend_from_slice(ua_public);
    key_info.extend_from_slice(as_public);

    let mut ikm = [0u8; 32];
    Hkdf::<Sha256>::new(Some(auth_secret), ecdh_secret.as_ref())
        .expand(&key_info, &mut ikm)
        .map_err(|_| Error::InvalidInput("hkdf ikm expand failed".into()))?;

    let hk = Hkdf::<Sha256>::new(Some(salt), &ikm);
    let mut cek = [0u8; 16];
    hk.expand(b"Content-Encoding: aes128gcm\0", &mut cek)
        .map_err(|_| Error::InvalidInput("hkdf cek expand failed".into()))?;
    let mut nonce = [0u8; 12];
    hk.expand(b"Content-Encoding: nonce\0", &mut nonce)
        .map_err(|_| Error::InvalidInput("hkdf nonce expand failed".into()))?;

    Ok((cek, nonce))
}

/// Generate a fresh VAPID keypair as `(private, public)` base64url strings.
/// The public half goes in the config file and the browser subscribe call;
/// the private half goes in the environment.
pub fn generate_vapid_keypair() -> (String, String) {
    let secret = SecretKey::random(&mut OsRng);
    let private = URL_SAFE_NO_PAD.encode(secret.to_bytes());
    let public = URL_SAFE_NO_PAD.encode(secret.public_key().to_encoded_point(false).as_bytes());
    (private, public)
}

/// Decode base64url with or without padding — browsers hand out both.
fn b64url_decode(input: &str) -> Result<Vec<u8>, Error> {
    URL_SAFE_NO_PAD
        .decode(input.trim_end_matches('='))
        .map_err(|e| Error::Parse(format!("base64url: {e}")))
}

/// `scheme://host[:port]` of a push endpoint URL.
fn origin_of(endpoint: &str) -> Option<String> {
    let scheme_end = endpoint.find("://")?;
    let rest = &endpoint[scheme_end + 3..];
    let path_start = rest.find('/').map(|i| scheme_end + 3 + i).unwrap_or(endpoint.len());
    (path_start > scheme_end + 3).then(|| endpoint[..path_start].to_string())
}
