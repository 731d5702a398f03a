use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum BreakerState {
    Closed,   // Normal operation
    Open,     // Coordination store considered down, fail fast
    HalfOpen, // Probing for recovery
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures inside the window before opening
    pub failure_threshold: u32,
    /// How long to fail fast before probing again
    pub cooldown: Duration,
    /// Successes needed in half-open before closing
    pub success_threshold: u32,
    /// Window within which failures are counted as consecutive
    pub failure_window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            success_threshold: 2,
            failure_window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    last_transition: Instant,
    total_requests: u64,
    total_failures: u64,
}

/// Circuit breaker guarding coordination-store access
///
/// While open, mutating operations fail fast with
/// `COORDINATION_UNAVAILABLE` and the service degrades read-only; after the
/// cooldown a half-open probe decides whether to close again.
#[derive(Debug)]
pub struct CoordinationBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CoordinationBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
                last_transition: Instant::now(),
                total_requests: 0,
                total_failures: 0,
            }),
        }
    }

    /// Whether a coordination request may proceed right now.
    pub async fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock().await;
        inner.total_requests += 1;

        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                if inner.last_transition.elapsed() >= self.config.cooldown {
                    inner.state = BreakerState::HalfOpen;
                    inner.last_transition = Instant::now();
                    inner.success_count = 0;
                    info!("coordination breaker half-open, probing store");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count = 0;
            }
            BreakerState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.last_transition = Instant::now();
                    inner.failure_count = 0;
                    info!("coordination breaker closed, store recovered");
                }
            }
            BreakerState::Open => {}
        }
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.total_failures += 1;
        let now = Instant::now();

        match inner.state {
            BreakerState::Closed => {
                let in_window = inner
                    .last_failure
                    .map(|at| now.duration_since(at) <= self.config.failure_window)
                    .unwrap_or(false);
                inner.failure_count = if in_window { inner.failure_count + 1 } else { 1 };
                inner.last_failure = Some(now);

                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.last_transition = now;
                    warn!(
                        "coordination breaker opened after {} consecutive failures ({} total)",
                        inner.failure_count, inner.total_failures
                    );
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.last_transition = now;
                inner.last_failure = Some(now);
                warn!("coordination probe failed, breaker reopened");
            }
            BreakerState::Open => {
                inner.last_failure = Some(now);
            }
        }
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.lock().await.state
    }

    pub async fn metrics(&self) -> BreakerMetrics {
        let inner = self.inner.lock().await;
        BreakerMetrics {
            state: inner.state,
            failure_count: inner.failure_count,
            total_requests: inner.total_requests,
            total_failures: inner.total_failures,
        }
    }
}

impl Default for CoordinationBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BreakerMetrics {
    pub state: BreakerState,
    pub failure_count: u32,
    pub total_requests: u64,
    pub total_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_millis(50),
            success_threshold: 2,
            failure_window: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let breaker = CoordinationBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure().await;
        }
        assert_eq!(breaker.state().await, BreakerState::Open);
        assert!(!breaker.allow_request().await);
    }

    #[tokio::test]
    async fn test_success_resets_closed_counter() {
        let breaker = CoordinationBreaker::new(fast_config());
        breaker.record_failure().await;
        breaker.record_failure().await;
        breaker.record_success().await;
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_after_cooldown_then_recovery() {
        let breaker = CoordinationBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure().await;
        }
        assert_eq!(breaker.state().await, BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(breaker.allow_request().await);
        assert_eq!(breaker.state().await, BreakerState::HalfOpen);

        breaker.record_success().await;
        breaker.record_success().await;
        assert_eq!(breaker.state().await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = CoordinationBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure().await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(breaker.allow_request().await);
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, BreakerState::Open);
    }
}
