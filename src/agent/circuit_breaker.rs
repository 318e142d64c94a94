//! Circuit breaker guarding the agent's reconnect loop (C8), adapted from the
//! three-state closed/open/half-open pattern this codebase already uses to
//! protect a flaky downstream call.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub open_duration_ms: u64,
}

pub struct CircuitBreaker {
    state: Arc<RwLock<CircuitState>>,
    consecutive_failures: AtomicU32,
    opened_at_ms: AtomicU64,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: Arc::new(RwLock::new(CircuitState::Closed)),
            consecutive_failures: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            config,
        }
    }

    /// Whether a reconnect attempt should proceed right now.
    pub async fn should_allow(&self) -> bool {
        let state = *self.state.read().await;
        match state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let opened_at = self.opened_at_ms.load(Ordering::SeqCst) as i64;
                if crate::now_ms() - opened_at >= self.config.open_duration_ms as i64 {
                    *self.state.write().await = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub async fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        *self.state.write().await = CircuitState::Closed;
    }

    pub async fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.config.failure_threshold {
            self.opened_at_ms
                .store(crate::now_ms() as u64, Ordering::SeqCst);
            *self.state.write().await = CircuitState::Open;
            tracing::warn!(failures, "circuit breaker opened");
        }
    }

    pub async fn state(&self) -> CircuitState {
        *self.state.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            open_duration_ms: 1_000_000,
        });
        for _ in 0..3 {
            breaker.record_failure().await;
        }
        assert_eq!(breaker.state().await, CircuitState::Open);
        assert!(!breaker.should_allow().await);
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            open_duration_ms: 1_000,
        });
        breaker.record_failure().await;
        breaker.record_failure().await;
        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
        breaker.record_failure().await;
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Closed); // only 2 consecutive now
    }
}
