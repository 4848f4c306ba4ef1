//! Sliding-window admission control per agent
//!
//! Each agent has its own bucket behind an async mutex. A caller holds that
//! mutex for the whole check-and-reserve, including any wait for budget, so
//! no other caller can observe the budget between the check and the
//! reservation. Waiters queue on the mutex in arrival order.

use keel_core::config::{AdmissionConfig, AdmissionLimits};
use keel_core::{KeelError, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Counters for one agent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdmissionStats {
    pub admitted: u64,
    /// Requests held back by the budget, directly or queued behind a
    /// throttled request
    pub delayed: u64,
    /// Individual throttle events (one request may be throttled repeatedly)
    pub throttle_events: u64,
}

/// Proof of admission
#[derive(Debug, Clone)]
pub struct Permit {
    pub agent: String,
    pub tokens: u64,
    pub admitted_at: Instant,
    pub waited: Duration,
}

struct Bucket {
    limits: AdmissionLimits,
    /// Admission time and token reservation of every request in the window
    events: VecDeque<(Instant, u64)>,
    consecutive_throttles: u32,
    /// When a throttled request was last admitted
    last_delayed_admission: Option<Instant>,
    stats: AdmissionStats,
}

impl Bucket {
    fn new(limits: AdmissionLimits) -> Self {
        Self {
            limits,
            events: VecDeque::new(),
            consecutive_throttles: 0,
            last_delayed_admission: None,
            stats: AdmissionStats::default(),
        }
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.limits.window_secs)
    }

    fn prune(&mut self, now: Instant) {
        let window = self.window();
        while let Some((at, _)) = self.events.front() {
            if now.duration_since(*at) >= window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    fn fits(&self, tokens: u64) -> bool {
        if self.events.len() as u64 >= u64::from(self.limits.requests_per_window) {
            return false;
        }
        match self.limits.tokens_per_window {
            Some(budget) => {
                let used: u64 = self.events.iter().map(|(_, t)| t).sum();
                used + tokens <= budget
            }
            None => true,
        }
    }

    /// Wait until the oldest reservation leaves the window
    fn until_slot_frees(&self, now: Instant) -> Duration {
        self.events
            .front()
            .map(|(at, _)| (*at + self.window()).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Backoff from the current run of consecutive throttles
    fn backoff(&self) -> Duration {
        let exponent = self.consecutive_throttles.saturating_sub(1).min(16);
        let delay = self.limits.backoff_base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.limits.backoff_max_ms))
    }
}

/// Admission controller for one workflow run
pub struct AdmissionController {
    config: AdmissionConfig,
    buckets: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Bucket>>>>,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn bucket(&self, agent: &str) -> Arc<tokio::sync::Mutex<Bucket>> {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets
            .entry(agent.to_string())
            .or_insert_with(|| {
                Arc::new(tokio::sync::Mutex::new(Bucket::new(
                    self.config.limits_for(agent),
                )))
            })
            .clone()
    }

    /// Reserve budget for one request, waiting (never dropping) while over budget
    pub async fn acquire(&self, agent: &str, tokens: u64) -> Result<Permit> {
        let handle = self.bucket(agent);
        let started = Instant::now();
        let (mut bucket, queued) = match handle.try_lock() {
            Ok(guard) => (guard, false),
            Err(_) => (handle.lock().await, true),
        };
        // Queued behind a request that was throttled while this one waited
        let mut delayed = queued
            && bucket
                .last_delayed_admission
                .map_or(false, |at| at > started);

        if let Some(budget) = bucket.limits.tokens_per_window {
            if tokens > budget {
                return Err(KeelError::Admission(format!(
                    "request of {} tokens exceeds {}'s window budget of {}",
                    tokens, agent, budget
                )));
            }
        }

        loop {
            let now = Instant::now();
            bucket.prune(now);

            if bucket.fits(tokens) {
                bucket.events.push_back((now, tokens));
                bucket.consecutive_throttles = 0;
                bucket.stats.admitted += 1;
                if delayed {
                    bucket.stats.delayed += 1;
                    bucket.last_delayed_admission = Some(now);
                }
                let waited = now.duration_since(started);
                debug!(agent = %agent, tokens, waited_ms = waited.as_millis() as u64, "admitted");
                return Ok(Permit {
                    agent: agent.to_string(),
                    tokens,
                    admitted_at: now,
                    waited,
                });
            }

            delayed = true;
            bucket.consecutive_throttles += 1;
            bucket.stats.throttle_events += 1;
            let wait = bucket.backoff().max(bucket.until_slot_frees(now));
            warn!(
                agent = %agent,
                consecutive = bucket.consecutive_throttles,
                wait_ms = wait.as_millis() as u64,
                "over budget, delaying request"
            );
            // The bucket lock stays held while sleeping
            tokio::time::sleep(wait).await;
        }
    }

    pub async fn stats(&self, agent: &str) -> AdmissionStats {
        self.bucket(agent).lock().await.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(requests: u32, tokens: Option<u64>) -> AdmissionConfig {
        AdmissionConfig {
            requests_per_window: requests,
            window_secs: 60,
            tokens_per_window: tokens,
            backoff_base_ms: 250,
            backoff_max_ms: 10_000,
            agents: Default::default(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_delays_exactly_the_overflow() {
        let controller = Arc::new(AdmissionController::new(config(3, None)));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let controller = Arc::clone(&controller);
                tokio::spawn(async move { controller.acquire("codex", 10).await })
            })
            .collect();

        let mut permits = Vec::new();
        for handle in futures::future::join_all(handles).await {
            permits.push(handle.unwrap().unwrap());
        }

        let stats = controller.stats("codex").await;
        assert_eq!(stats.admitted, 5);
        assert_eq!(stats.delayed, 2);
        assert_eq!(permits.iter().filter(|p| p.waited > Duration::ZERO).count(), 2);

        // Never more than 3 admissions inside any 60s window
        let mut times: Vec<Instant> = permits.iter().map(|p| p.admitted_at).collect();
        times.sort();
        for (i, start) in times.iter().enumerate() {
            let in_window = times[i..]
                .iter()
                .filter(|t| t.duration_since(*start) < Duration::from_secs(60))
                .count();
            assert!(in_window <= 3);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_queueing_behind_an_unthrottled_caller_is_not_a_delay() {
        let controller = Arc::new(AdmissionController::new(config(10, None)));
        let handle = controller.bucket("codex");
        let held = handle.lock().await;

        let queued = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.acquire("codex", 1).await })
        };
        tokio::task::yield_now().await;
        drop(held);
        queued.await.unwrap().unwrap();
        controller.acquire("codex", 1).await.unwrap();

        let stats = controller.stats("codex").await;
        assert_eq!(stats.admitted, 2);
        assert_eq!(stats.delayed, 0);
        assert_eq!(stats.throttle_events, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_agents_have_independent_budgets() {
        let controller = AdmissionController::new(config(1, None));
        let a = controller.acquire("claude", 1).await.unwrap();
        let b = controller.acquire("gemini", 1).await.unwrap();
        assert_eq!(a.waited, Duration::ZERO);
        assert_eq!(b.waited, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_budget() {
        let controller = AdmissionController::new(config(100, Some(1_000)));
        controller.acquire("claude", 800).await.unwrap();
        let second = controller.acquire("claude", 300).await.unwrap();
        assert!(second.waited >= Duration::from_secs(60));

        let err = controller.acquire("claude", 5_000).await.unwrap_err();
        assert!(matches!(err, KeelError::Admission(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_backoff_resets_after_admission() {
        let mut bucket = Bucket::new(config(1, None).shared_limits());
        bucket.consecutive_throttles = 1;
        assert_eq!(bucket.backoff(), Duration::from_millis(250));
        bucket.consecutive_throttles = 3;
        assert_eq!(bucket.backoff(), Duration::from_millis(1_000));
        bucket.consecutive_throttles = 30;
        assert_eq!(bucket.backoff(), Duration::from_millis(10_000));

        let controller = AdmissionController::new(config(1, None));
        controller.acquire("codex", 1).await.unwrap();
        controller.acquire("codex", 1).await.unwrap();
        let stats = controller.stats("codex").await;
        assert_eq!(stats.delayed, 1);
        assert!(stats.throttle_events >= 1);
    }
}
