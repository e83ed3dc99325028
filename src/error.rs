//! Error types shared across the backend.
//!
//! [`Error`] enumerates the failure kinds that cross component boundaries;
//! [`ApiError`] wraps them (or any [`anyhow::Error`]) for axum handlers so
//! every handler that can fail returns `Result<T, ApiError>` and propagates
//! with `?` — no manual `map_err`, no boilerplate.
//!
//! # Example
//!
//! ```rust,ignore
//! async fn my_handler(
//!     State(state): State<AppState>,
//! ) -> Result<Json<Value>, ApiError> {
//!     let stream = state.streams.get(&id).ok_or(Error::NotFound("stream".into()))?;
//!     Ok(Json(json!({ "success": true, "data": stream })))
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Failure kinds that cross component boundaries.
///
/// Retry policy lives with the caller, not here: transient-network and
/// provider-unavailable get one local retry before the fallback chain kicks
/// in, rate-limited is never retried, parse errors degrade to a low-concern
/// default inside the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("rate limited")]
    RateLimited,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("bounds exceeded: {0}")]
    BoundsExceeded(String),

    #[error("storage failure: {0}")]
    Storage(#[from] sqlx::Error),
}

impl Error {
    /// HTTP status this error surfaces as when it reaches the gateway.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) | Self::Parse(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::RateLimited | Self::BoundsExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::TransientNetwork(_) | Self::ProviderUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether one local retry is worth attempting before falling through to
    /// the next provider in the chain.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork(_) | Self::ProviderUnavailable(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            Self::TransientNetwork(e.to_string())
        } else {
            Self::ProviderUnavailable(e.to_string())
        }
    }
}

/// Wraps errors so they can be returned from axum handlers.
///
/// Domain [`Error`]s keep their mapped status; anything else (via [`From`]
/// over `anyhow::Error`) becomes a 500. The response body is the gateway-wide
/// `{ "success": false, "error": "..." }` envelope.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self {
            status: e.status_code(),
            message: e.to_string(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!(error = %self.message, "handler error");
        }
        (
            self.status,
            Json(json!({ "success": false, "error": self.message })),
        )
            .into_response()
    }
}
