//! Per-IP rate limiting for the admin HTTP API, keyed by client IP via
//! `governor`'s keyed state rather than the single unkeyed limiter the
//! orchestration API used — a single direct limiter would let one noisy
//! client starve every other caller.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use governor::{
    clock::DefaultClock,
    state::keyed::DefaultKeyedStateStore,
    Quota, RateLimiter,
};
use std::{net::SocketAddr, num::NonZeroU32, sync::Arc};
use tracing::warn;

pub const REQUESTS_PER_MINUTE: u32 = 60;
pub const TASK_SUBMIT_REQUESTS_PER_MINUTE: u32 = 10;

type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

#[derive(Clone)]
pub struct RateLimitState {
    general: Arc<KeyedLimiter>,
    task_submit: Arc<KeyedLimiter>,
}

impl RateLimitState {
    pub fn new() -> Self {
        let general_quota = Quota::per_minute(NonZeroU32::new(REQUESTS_PER_MINUTE).unwrap());
        let task_quota =
            Quota::per_minute(NonZeroU32::new(TASK_SUBMIT_REQUESTS_PER_MINUTE).unwrap());
        Self {
            general: Arc::new(RateLimiter::keyed(general_quota)),
            task_submit: Arc::new(RateLimiter::keyed(task_quota)),
        }
    }
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn rate_limit_middleware(
    State(state): State<Arc<RateLimitState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let ip = client_ip(&request).unwrap_or_else(|| addr.ip().to_string());
    let path = request.uri().path().to_string();

    let limiter = if path == "/tasks" && request.method() == "POST" {
        &state.task_submit
    } else {
        &state.general
    };

    if limiter.check_key(&ip).is_err() {
        warn!(ip, path, "rate limit exceeded");
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }

    Ok(next.run(request).await)
}

fn client_ip(request: &Request) -> Option<String> {
    let headers = request.headers();
    if let Some(v) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = v.split(',').next() {
            return Some(first.trim().to_string());
        }
    }
    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_initial_requests_per_key() {
        let state = RateLimitState::new();
        assert!(state.general.check_key(&"1.2.3.4".to_string()).is_ok());
        assert!(state.task_submit.check_key(&"1.2.3.4".to_string()).is_ok());
    }

    #[test]
    fn task_submit_quota_is_stricter_than_general() {
        let state = RateLimitState::new();
        let key = "5.6.7.8".to_string();
        let mut task_allowed = 0;
        for _ in 0..TASK_SUBMIT_REQUESTS_PER_MINUTE + 5 {
            if state.task_submit.check_key(&key).is_ok() {
                task_allowed += 1;
            }
        }
        assert_eq!(task_allowed, TASK_SUBMIT_REQUESTS_PER_MINUTE);
    }

    #[test]
    fn separate_keys_have_independent_quotas() {
        let state = RateLimitState::new();
        for _ in 0..TASK_SUBMIT_REQUESTS_PER_MINUTE {
            assert!(state
                .task_submit
                .check_key(&"agent-a".to_string())
                .is_ok());
        }
        assert!(state.task_submit.check_key(&"agent-a".to_string()).is_err());
        assert!(state.task_submit.check_key(&"agent-b".to_string()).is_ok());
    }
}
