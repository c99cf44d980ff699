/*!
# Circuit Breaker

Per-target failure isolation. A target is usually `worker:<id>`; every
execution through a breaker is an atomic admit-execute-record triple.
*/

use crate::error::{CoordinationError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally
    Closed,
    /// Requests fail fast until the reset timeout elapses
    Open,
    /// A bounded number of probes test recovery
    HalfOpen,
}

/// Breaker tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker
    pub failure_threshold: usize,
    /// Half-open successes required to close
    pub success_threshold: usize,
    /// How long the breaker stays open before probing, in milliseconds
    pub timeout_ms: u64,
    /// Concurrent probes admitted while half-open
    pub half_open_limit: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_ms: 30_000,
            half_open_limit: 1,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: usize,
    successes: usize,
    next_attempt_at: Option<Instant>,
    half_open_in_flight: usize,
}

/// A single per-target breaker
pub struct CircuitBreaker {
    target: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a breaker for a target
    pub fn new(target: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            target: target.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                next_attempt_at: None,
                half_open_in_flight: 0,
            }),
        }
    }

    /// The target this breaker guards
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    /// Admit a request or reject with `CircuitOpen`.
    ///
    /// Callers must pair a successful admission with exactly one
    /// `record_success` or `record_failure`; `call` does this automatically.
    pub fn try_admit(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let due = inner
                    .next_attempt_at
                    .map(|at| Instant::now() >= at)
                    .unwrap_or(true);
                if due {
                    inner.state = CircuitState::HalfOpen;
                    inner.successes = 0;
                    inner.half_open_in_flight = 1;
                    debug!(target = %self.target, "circuit breaker half-open");
                    Ok(())
                } else {
                    Err(CoordinationError::CircuitOpen {
                        target: self.target.clone(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_limit {
                    inner.half_open_in_flight += 1;
                    Ok(())
                } else {
                    Err(CoordinationError::CircuitOpen {
                        target: self.target.clone(),
                    })
                }
            }
        }
    }

    /// Record a successful execution; returns the new state when it changed
    pub fn record_success(&self) -> Option<CircuitState> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => {
                inner.failures = 0;
                None
            }
            CircuitState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.successes += 1;
                if inner.successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failures = 0;
                    inner.successes = 0;
                    inner.next_attempt_at = None;
                    debug!(target = %self.target, "circuit breaker closed");
                    Some(CircuitState::Closed)
                } else {
                    None
                }
            }
            CircuitState::Open => None,
        }
    }

    /// Record a failed execution; returns the new state when it changed
    pub fn record_failure(&self) -> Option<CircuitState> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    self.trip(&mut inner);
                    Some(CircuitState::Open)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                self.trip(&mut inner);
                Some(CircuitState::Open)
            }
            CircuitState::Open => None,
        }
    }

    /// Release an admission without counting it either way, e.g. when the
    /// execution was cancelled rather than judged
    pub fn record_discard(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    fn trip(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.successes = 0;
        inner.next_attempt_at =
            Some(Instant::now() + Duration::from_millis(self.config.timeout_ms));
        warn!(
            target = %self.target,
            failures = inner.failures,
            "circuit breaker opened"
        );
    }

    /// Execute a future through the breaker as one admit-execute-record triple
    pub async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        self.try_admit()?;
        match f.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    /// Operator override of the breaker state
    pub fn force_state(&self, state: CircuitState) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = state;
        inner.failures = 0;
        inner.successes = 0;
        inner.half_open_in_flight = 0;
        inner.next_attempt_at = match state {
            CircuitState::Open => {
                Some(Instant::now() + Duration::from_millis(self.config.timeout_ms))
            }
            _ => None,
        };
        warn!(target = %self.target, ?state, "circuit breaker state forced");
    }
}

/// Lazily-populated registry of breakers keyed by target
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    /// Create a registry; every breaker inherits `config`
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the breaker for a target
    pub fn breaker_for(&self, target: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().unwrap().get(target) {
            return breaker.clone();
        }
        let mut breakers = self.breakers.write().unwrap();
        breakers
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(target, self.config.clone())))
            .clone()
    }

    /// Remove a target's breaker (e.g. on worker deregistration)
    pub fn remove(&self, target: &str) {
        self.breakers.write().unwrap().remove(target);
    }

    /// Snapshot of all breaker states
    pub fn states(&self) -> HashMap<String, CircuitState> {
        self.breakers
            .read()
            .unwrap()
            .iter()
            .map(|(target, breaker)| (target.clone(), breaker.state()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            timeout_ms: 50,
            half_open_limit: 1,
        }
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new("worker:w1", fast_config());
        assert_eq!(breaker.state(), CircuitState::Closed);

        for _ in 0..3 {
            breaker.try_admit().unwrap();
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_admit().is_err());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new("worker:w1", fast_config());
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_recovery() {
        let breaker = CircuitBreaker::new("worker:w1", fast_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;

        // First probe admitted, transitions to half-open
        breaker.try_admit().unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();

        breaker.try_admit().unwrap();
        let changed = breaker.record_success();
        assert_eq!(changed, Some(CircuitState::Closed));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_limit() {
        let breaker = CircuitBreaker::new("worker:w1", fast_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        breaker.try_admit().unwrap();
        // Limit is 1: a second concurrent probe is rejected
        assert!(breaker.try_admit().is_err());
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("worker:w1", fast_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        breaker.try_admit().unwrap();
        let changed = breaker.record_failure();
        assert_eq!(changed, Some(CircuitState::Open));
        assert!(breaker.try_admit().is_err());
    }

    #[tokio::test]
    async fn test_call_triple() {
        let breaker = CircuitBreaker::new("worker:w1", fast_config());
        let value = breaker.call(async { Ok::<_, _>(42) }).await.unwrap();
        assert_eq!(value, 42);

        for _ in 0..3 {
            let _ = breaker
                .call(async { Err::<(), _>(CoordinationError::system("boom")) })
                .await;
        }
        let err = breaker.call(async { Ok::<_, _>(1) }).await.unwrap_err();
        assert!(matches!(err, CoordinationError::CircuitOpen { .. }));
    }

    #[test]
    fn test_force_state() {
        let breaker = CircuitBreaker::new("worker:w1", fast_config());
        breaker.force_state(CircuitState::Open);
        assert!(breaker.try_admit().is_err());
        breaker.force_state(CircuitState::Closed);
        assert!(breaker.try_admit().is_ok());
    }

    #[test]
    fn test_registry_reuses_breakers() {
        let registry = CircuitBreakerRegistry::new(fast_config());
        let a = registry.breaker_for("worker:w1");
        let b = registry.breaker_for("worker:w1");
        assert!(Arc::ptr_eq(&a, &b));

        a.record_failure();
        a.record_failure();
        a.record_failure();
        assert_eq!(registry.states()["worker:w1"], CircuitState::Open);
    }
}
