//! Failure classification and recovery policy
//!
//! The manager itself holds no retry counters. Attempt counts come in on the
//! [`ErrorContext`], loaded from the checkpointed retry budget, so a restart
//! cannot hand out a fresh budget. Circuit breakers are per run.

use keel_agent::BreakerRegistry;
use keel_core::config::RecoveryConfig;
use keel_core::{ErrorContext, ErrorKind};
use rand::Rng;
use std::time::Duration;
use tracing::{info, warn};

/// What to do about one failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Retry the same agent after a delay
    RetryAfter(Duration),
    /// Retry once on the backup agent
    Fallback(String),
    /// Stop and ask a human
    Escalate(String),
    /// End the workflow
    Abort(String),
}

impl RecoveryAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RetryAfter(_) => "retry",
            Self::Fallback(_) => "fallback",
            Self::Escalate(_) => "escalate",
            Self::Abort(_) => "abort",
        }
    }
}

pub struct RecoveryManager {
    config: RecoveryConfig,
    breakers: BreakerRegistry,
}

impl RecoveryManager {
    pub fn new(config: RecoveryConfig) -> Self {
        let breakers = BreakerRegistry::new(
            config.breaker_threshold,
            Duration::from_secs(config.breaker_window_secs),
            Duration::from_secs(config.breaker_cooldown_secs),
        );
        Self { config, breakers }
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Decide how to recover
    ///
    /// `context.retry_count` counts failures recorded for the key, including
    /// this one. Transient failures are retried while it stays within
    /// `max_transient_retries`.
    pub fn decide(&self, context: &ErrorContext, fallback: Option<&str>) -> RecoveryAction {
        let action = match context.kind {
            ErrorKind::Transient => {
                if context.retry_count <= self.config.max_transient_retries {
                    RecoveryAction::RetryAfter(self.delay_for(context.retry_count))
                } else {
                    RecoveryAction::Escalate(format!(
                        "{} failed {} times, retry budget of {} exhausted: {}",
                        context.component,
                        context.retry_count,
                        self.config.max_transient_retries,
                        context.message
                    ))
                }
            }
            ErrorKind::AgentFailure => match fallback {
                Some(backup) if !context.fallback_attempted => {
                    RecoveryAction::Fallback(backup.to_string())
                }
                Some(backup) => RecoveryAction::Escalate(format!(
                    "{} failed after fallback to {}: {}",
                    context.component, backup, context.message
                )),
                None => RecoveryAction::Escalate(format!(
                    "{} failed with no fallback agent: {}",
                    context.component, context.message
                )),
            },
            ErrorKind::SecurityBlock => {
                RecoveryAction::Escalate(format!("security block: {}", context.message))
            }
            ErrorKind::Fatal => RecoveryAction::Abort(context.message.clone()),
        };

        match &action {
            RecoveryAction::RetryAfter(delay) => info!(
                component = %context.component,
                kind = %context.kind,
                attempt = context.retry_count,
                delay_ms = delay.as_millis() as u64,
                "retrying after failure"
            ),
            other => warn!(
                component = %context.component,
                kind = %context.kind,
                attempt = context.retry_count,
                action = other.name(),
                "recovery decision"
            ),
        }
        action
    }

    /// Exponential backoff for the n-th failure, before jitter
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let delay = self.config.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.config.max_delay_ms))
    }

    fn delay_for(&self, failures: u32) -> Duration {
        let base = self.backoff(failures);
        if self.config.jitter <= 0.0 {
            return base;
        }
        let factor = 1.0 + self.config.jitter * rand::thread_rng().gen_range(-1.0..=1.0);
        let millis = (base.as_millis() as f64 * factor).max(0.0) as u64;
        Duration::from_millis(millis.min(self.config.max_delay_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::KeelError;

    fn manager() -> RecoveryManager {
        RecoveryManager::new(RecoveryConfig {
            jitter: 0.0,
            ..RecoveryConfig::default()
        })
    }

    fn timeout_ctx(retries: u32) -> ErrorContext {
        let error = KeelError::AgentTimeout {
            agent: "claude".to_string(),
            timeout_ms: 1000,
        };
        ErrorContext::from_error(&error, "claude").with_retry_count(retries)
    }

    #[test]
    fn test_transient_retries_until_budget_exhausted() {
        let recovery = manager();
        assert_eq!(
            recovery.decide(&timeout_ctx(1), None),
            RecoveryAction::RetryAfter(Duration::from_millis(500))
        );
        assert_eq!(
            recovery.decide(&timeout_ctx(3), None),
            RecoveryAction::RetryAfter(Duration::from_millis(2000))
        );
        // The fourth failure on the same key escalates
        assert!(matches!(
            recovery.decide(&timeout_ctx(4), None),
            RecoveryAction::Escalate(_)
        ));
    }

    #[test]
    fn test_backoff_is_capped() {
        let recovery = manager();
        assert_eq!(recovery.backoff(1), Duration::from_millis(500));
        assert_eq!(recovery.backoff(2), Duration::from_millis(1000));
        assert_eq!(recovery.backoff(40), Duration::from_millis(30_000));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let recovery = RecoveryManager::new(RecoveryConfig::default());
        for _ in 0..50 {
            match recovery.decide(&timeout_ctx(2), None) {
                RecoveryAction::RetryAfter(delay) => {
                    let ms = delay.as_millis();
                    assert!((800..=1200).contains(&ms), "delay {}ms", ms);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_agent_failure_tries_one_fallback() {
        let recovery = manager();
        let error = KeelError::MalformedOutput {
            agent: "gemini".to_string(),
            detail: "no JSON".to_string(),
        };
        let ctx = ErrorContext::from_error(&error, "gemini");

        assert_eq!(
            recovery.decide(&ctx, Some("claude")),
            RecoveryAction::Fallback("claude".to_string())
        );
        let after = ctx.clone().with_fallback_attempted(true);
        assert!(matches!(
            recovery.decide(&after, Some("claude")),
            RecoveryAction::Escalate(_)
        ));
        assert!(matches!(recovery.decide(&ctx, None), RecoveryAction::Escalate(_)));
    }

    #[test]
    fn test_security_block_and_fatal() {
        let recovery = manager();
        let block = ErrorContext::from_error(&KeelError::SecurityBlock("secret".into()), "codex");
        assert!(matches!(
            recovery.decide(&block, Some("claude")),
            RecoveryAction::Escalate(_)
        ));

        let fatal = ErrorContext::from_error(&KeelError::Checkpoint("disk full".into()), "store");
        assert_eq!(
            recovery.decide(&fatal, None),
            RecoveryAction::Abort("Checkpoint error: disk full".to_string())
        );
    }
}
