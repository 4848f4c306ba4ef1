//! Circuit breaker per external agent
//!
//! Trips after `threshold` consecutive failures that all fall inside a
//! sliding window. While open, calls are refused until the cool-down elapses;
//! the next call is then a half-open probe whose result closes or re-opens it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests allowed
    Closed,
    /// Too many failures, reject requests immediately
    Open,
    /// Cool-down elapsed, allow a probe
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    /// Timestamps of the current run of consecutive failures
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
}

/// Circuit breaker for one agent
///
/// ```
/// use keel_agent::CircuitBreaker;
/// use std::time::Duration;
///
/// let cb = CircuitBreaker::new(3, Duration::from_secs(300), Duration::from_secs(60));
/// cb.record_failure();
/// cb.record_failure();
/// cb.record_failure();
/// assert!(!cb.can_execute());
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    threshold: u32,
    window: Duration,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, window: Duration, cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                failures: VecDeque::new(),
                opened_at: None,
            }),
            threshold: threshold.max(1),
            window,
            cooldown,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // State stays consistent even if a holder panicked
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get current circuit state
    pub fn state(&self) -> CircuitState {
        let inner = self.lock();
        match inner.opened_at {
            None => CircuitState::Closed,
            Some(at) if at.elapsed() >= self.cooldown => CircuitState::HalfOpen,
            Some(_) => CircuitState::Open,
        }
    }

    pub fn can_execute(&self) -> bool {
        self.state() != CircuitState::Open
    }

    /// Record a successful call; closes the circuit
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.failures.clear();
        inner.opened_at = None;
    }

    /// Record a failed call, returning true if this failure opened the circuit
    pub fn record_failure(&self) -> bool {
        let now = Instant::now();
        let mut inner = self.lock();

        if inner.opened_at.is_some() {
            // A failed half-open probe restarts the cool-down
            inner.opened_at = Some(now);
            return false;
        }

        inner.failures.push_back(now);
        while let Some(oldest) = inner.failures.front() {
            if now.duration_since(*oldest) > self.window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }

        if inner.failures.len() as u32 >= self.threshold {
            inner.opened_at = Some(now);
            return true;
        }
        false
    }

    /// Consecutive failures currently inside the window
    pub fn failure_count(&self) -> u32 {
        self.lock().failures.len() as u32
    }

    /// Time until a probe is allowed (zero unless open)
    pub fn time_until_retry(&self) -> Duration {
        let inner = self.lock();
        match inner.opened_at {
            Some(at) => self.cooldown.saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        }
    }

    /// Manual reset by an operator
    pub fn reset(&self) {
        self.record_success();
    }
}

/// Breakers for every agent in a run, created on first use
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    threshold: u32,
    window: Duration,
    cooldown: Duration,
}

impl BreakerRegistry {
    pub fn new(threshold: u32, window: Duration, cooldown: Duration) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            threshold,
            window,
            cooldown,
        }
    }

    pub fn get(&self, agent: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers
            .entry(agent.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(self.threshold, self.window, self.cooldown))
            })
            .clone()
    }

    pub fn record_success(&self, agent: &str) {
        self.get(agent).record_success();
    }

    pub fn record_failure(&self, agent: &str) {
        let breaker = self.get(agent);
        if breaker.record_failure() {
            warn!(
                agent = %agent,
                cooldown_secs = self.cooldown.as_secs(),
                "circuit opened"
            );
        }
    }

    /// Agents whose circuit is currently open
    pub fn open_circuits(&self) -> Vec<String> {
        let breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let mut open: Vec<String> = breakers
            .iter()
            .filter(|(_, b)| b.state() == CircuitState::Open)
            .map(|(id, _)| id.clone())
            .collect();
        open.sort();
        open
    }

    pub fn reset_all(&self) {
        let breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        for (agent, breaker) in breakers.iter() {
            if breaker.state() != CircuitState::Closed {
                info!(agent = %agent, "circuit reset");
            }
            breaker.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(3, Duration::from_secs(300), Duration::from_secs(60))
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_state_closed() {
        let cb = breaker();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_execute());
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let cb = breaker();
        assert!(!cb.record_failure());
        assert!(!cb.record_failure());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.record_failure());
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_execute());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failures() {
        let cb = breaker();
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.failure_count(), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_do_not_count() {
        let cb = breaker();
        cb.record_failure();
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(301)).await;
        cb.record_failure();
        assert_eq!(cb.failure_count(), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_cooldown() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure();
        }
        assert!(cb.time_until_retry() > Duration::ZERO);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // Failed probe re-opens
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(61)).await;
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_is_per_agent() {
        let registry = BreakerRegistry::new(2, Duration::from_secs(300), Duration::from_secs(60));
        registry.record_failure("codex");
        registry.record_failure("codex");
        registry.record_failure("gemini");

        assert!(!registry.get("codex").can_execute());
        assert!(registry.get("gemini").can_execute());
        assert_eq!(registry.open_circuits(), vec!["codex".to_string()]);

        registry.reset_all();
        assert!(registry.get("codex").can_execute());
    }
}
