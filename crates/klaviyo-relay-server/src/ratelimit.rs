//! Rate limiting and request logging middleware.
//!
//! The limiter is a single global quota. It exists to stop a runaway caller,
//! not to shape traffic, so the ceiling is high.

use std::num::NonZeroU32;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{
    Quota, RateLimiter,
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
};
use serde::Serialize;

use crate::state::AppState;

// ─────────────────────────────────────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────────────────────────────────────

/// Rate limiter type alias (uses default clock).
pub type SharedRateLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

/// Rate limit error response.
#[derive(Debug, Serialize)]
struct RateLimitError {
    error: String,
    code: u16,
    retry_after_seconds: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Rate Limiter Factory
// ─────────────────────────────────────────────────────────────────────────────

/// Create a limiter allowing `requests_per_minute`, bursting up to the full quota.
///
/// Zero falls back to one request per minute.
pub fn create_rate_limiter(requests_per_minute: u32) -> SharedRateLimiter {
    let rpm = NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::MIN);
    Arc::new(RateLimiter::direct(Quota::per_minute(rpm)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Middleware
// ─────────────────────────────────────────────────────────────────────────────

/// Global rate limiting middleware.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !state.config.rate_limiting {
        return next.run(request).await;
    }

    match state.limiter.check() {
        Ok(()) => next.run(request).await,
        Err(not_until) => {
            let wait = not_until.wait_time_from(DefaultClock::default().now());
            let retry_after = wait.as_secs().max(1);

            tracing::warn!(
                path = %request.uri().path(),
                retry_after_seconds = retry_after,
                "Rate limit exceeded"
            );

            let error = RateLimitError {
                error: "Rate limit exceeded".to_string(),
                code: 429,
                retry_after_seconds: retry_after,
            };

            (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_after.to_string())],
                axum::Json(error),
            )
                .into_response()
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request Logging
// ─────────────────────────────────────────────────────────────────────────────

/// Logs method, path, status and duration for every request.
pub async fn request_logging_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !state.config.request_logging {
        return next.run(request).await;
    }

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = std::time::Instant::now();

    let response = next.run(request).await;

    let duration_ms = start.elapsed().as_millis() as u64;
    let status = response.status().as_u16();

    if response.status().is_server_error() {
        tracing::error!(%method, %path, status, duration_ms, "Request completed with server error");
    } else if response.status().is_client_error() {
        tracing::warn!(%method, %path, status, duration_ms, "Request completed with client error");
    } else {
        tracing::info!(%method, %path, status, duration_ms, "Request completed");
    }

    response
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
