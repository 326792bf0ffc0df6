//! Per-provider-key circuit breaker.
//!
//! State is in-memory only; a restarted process starts every circuit closed.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        })
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    opened_at: Option<Instant>,
    probes_in_flight: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub key: String,
    pub state: CircuitState,
    pub failure_count: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    key: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self {
            key: key.into(),
            config: config.clone(),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_time: None,
                opened_at: None,
                probes_in_flight: 0,
            }),
        }
    }

    /// Whether a call may go out now. An open circuit whose cooldown has
    /// elapsed moves to half-open and admits a limited number of probes.
    pub fn can_attempt(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .is_none_or(|at| at.elapsed() >= self.config.recovery_timeout);
                if cooled_down {
                    tracing::info!(key = %self.key, "Circuit half-open, probing");
                    inner.state = CircuitState::HalfOpen;
                    inner.probes_in_flight = 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.probes_in_flight < self.config.half_open_max_probes {
                    inner.probes_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Give back a half-open probe slot that ended without reaching the provider.
    pub fn release_probe(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }
    }

    pub fn on_success(&self) {
        self.close(&mut self.inner.lock());
    }

    /// The provider answered but refused this particular request. That proves
    /// the provider is reachable, so a half-open circuit closes, but failures
    /// counted while closed are left as they are.
    pub fn on_rejection(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            self.close(&mut inner);
        }
    }

    fn close(&self, inner: &mut Inner) {
        if inner.state != CircuitState::Closed {
            tracing::info!(key = %self.key, "Circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.probes_in_flight = 0;
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.failure_count += 1;
        inner.last_failure_time = Some(now);

        let trip = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.failure_count >= self.config.failure_threshold,
            CircuitState::Open => false,
        };

        if trip {
            tracing::warn!(
                key = %self.key,
                failures = inner.failure_count,
                cooldown = ?self.config.recovery_timeout,
                "Circuit opened"
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
            inner.probes_in_flight = 0;
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    pub fn last_failure_time(&self) -> Option<Instant> {
        self.inner.lock().last_failure_time
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            key: self.key.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
        }
    }
}

/// Lazily created breakers, one per provider key (model name).
#[derive(Debug)]
pub struct CircuitBreakers {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakers {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            config: config.clone(),
            breakers: DashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(key, &self.config)))
            .clone()
    }

    /// Breaker states sorted by key.
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<CircuitSnapshot> =
            self.breakers.iter().map(|b| b.value().snapshot()).collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_probes: 1,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_recovers() {
        let breaker = CircuitBreaker::new("flux", &config());

        for _ in 0..2 {
            assert!(breaker.can_attempt());
            breaker.on_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_attempt());

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!breaker.can_attempt());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(breaker.can_attempt());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Only one probe while half-open
        assert!(!breaker.can_attempt());

        breaker.on_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        assert!(breaker.can_attempt());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens_with_fresh_cooldown() {
        let breaker = CircuitBreaker::new("flux", &config());
        for _ in 0..3 {
            breaker.on_failure();
        }

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.can_attempt());
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        // Cooldown restarted at the probe failure
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(!breaker.can_attempt());
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(breaker.can_attempt());
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_probe_can_be_retaken() {
        let breaker = CircuitBreaker::new("flux", &config());
        for _ in 0..3 {
            breaker.on_failure();
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        assert!(breaker.can_attempt());
        assert!(!breaker.can_attempt());
        breaker.release_probe();
        assert!(breaker.can_attempt());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new("flux", &config());
        breaker.on_failure();
        breaker.on_failure();
        breaker.on_success();
        breaker.on_failure();
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.last_failure_time().is_some());
    }

    #[test]
    fn test_rejections_do_not_hide_outages() {
        let breaker = CircuitBreaker::new("flux", &config());
        breaker.on_failure();
        breaker.on_rejection();
        breaker.on_failure();
        breaker.on_rejection();
        assert_eq!(breaker.failure_count(), 2);

        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_probe_closes_circuit() {
        let breaker = CircuitBreaker::new("flux", &config());
        for _ in 0..3 {
            breaker.on_failure();
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.can_attempt());

        breaker.on_rejection();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn test_registry_isolates_keys() {
        let breakers = CircuitBreakers::new(&config());
        for _ in 0..3 {
            breakers.get("flux").on_failure();
        }

        assert!(!breakers.get("flux").can_attempt());
        assert!(breakers.get("sdxl").can_attempt());

        let snapshot = breakers.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].key, "flux");
        assert_eq!(snapshot[0].state, CircuitState::Open);
        assert_eq!(snapshot[1].state, CircuitState::Closed);
    }
}
