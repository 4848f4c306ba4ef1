//! Fan-out/fan-in over independent branches
//!
//! Every branch runs concurrently under its own timeout. Results come back
//! sorted by branch name, and decisions are merged with a max-severity
//! reducer, so completion order never changes the outcome.

use futures::future::join_all;
use keel_core::{Result, RoutingDecision};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Result of one branch
#[derive(Debug, Clone, PartialEq)]
pub enum BranchResult<T> {
    Done(T),
    Failed(String),
    TimedOut,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BranchOutcome<T> {
    pub name: String,
    pub result: BranchResult<T>,
}

impl<T> BranchOutcome<T> {
    pub fn value(&self) -> Option<&T> {
        match &self.result {
            BranchResult::Done(value) => Some(value),
            _ => None,
        }
    }
}

/// Run named branches concurrently and wait for all of them
pub async fn fan_out<T, F>(branches: Vec<(String, F)>, timeout: Duration) -> Vec<BranchOutcome<T>>
where
    F: Future<Output = Result<T>>,
{
    let running = branches.into_iter().map(|(name, branch)| async move {
        let result = match tokio::time::timeout(timeout, branch).await {
            Ok(Ok(value)) => BranchResult::Done(value),
            Ok(Err(e)) => {
                warn!(branch = %name, error = %e, "branch failed");
                BranchResult::Failed(e.to_string())
            }
            Err(_) => {
                warn!(branch = %name, timeout_ms = timeout.as_millis() as u64, "branch timed out");
                BranchResult::TimedOut
            }
        };
        BranchOutcome { name, result }
    });

    let mut outcomes = join_all(running).await;
    outcomes.sort_by(|a, b| a.name.cmp(&b.name));
    debug!(branches = outcomes.len(), "fan-in complete");
    outcomes
}

/// Merge decisions by taking the most severe; empty input continues
pub fn reduce<I>(decisions: I) -> RoutingDecision
where
    I: IntoIterator<Item = RoutingDecision>,
{
    decisions
        .into_iter()
        .max()
        .unwrap_or(RoutingDecision::Continue)
}

/// Outcome of a non-review check branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub name: String,
    pub decision: RoutingDecision,
    pub detail: String,
}

impl CheckResult {
    pub fn pass(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            decision: RoutingDecision::Continue,
            detail: String::new(),
        }
    }

    pub fn with(name: impl Into<String>, decision: RoutingDecision, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            decision,
            detail: detail.into(),
        }
    }
}

/// Reduce check branches, treating a failed or timed-out check as `Escalate`
pub fn reduce_checks(outcomes: &[BranchOutcome<CheckResult>]) -> (RoutingDecision, Vec<String>) {
    let mut details = Vec::new();
    let decision = reduce(outcomes.iter().map(|outcome| match &outcome.result {
        BranchResult::Done(check) => {
            if check.decision != RoutingDecision::Continue {
                details.push(format!("{}: {}", check.name, check.detail));
            }
            check.decision
        }
        BranchResult::Failed(e) => {
            details.push(format!("{}: {}", outcome.name, e));
            RoutingDecision::Escalate
        }
        BranchResult::TimedOut => {
            details.push(format!("{}: timed out", outcome.name));
            RoutingDecision::Escalate
        }
    }));
    (decision, details)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::KeelError;
    use std::pin::Pin;

    type Branch = Pin<Box<dyn Future<Output = Result<u32>> + Send>>;

    fn delayed(ms: u64, value: u32) -> Branch {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(value)
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_sorted_by_name() {
        let branches: Vec<(String, Branch)> = vec![
            ("zeta".to_string(), delayed(10, 1)),
            ("alpha".to_string(), delayed(30, 2)),
            ("mid".to_string(), Box::pin(async { Err::<u32, _>(KeelError::Agent("boom".into())) })),
        ];
        let outcomes = fan_out(branches, Duration::from_secs(1)).await;

        let names: Vec<&str> = outcomes.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
        assert_eq!(outcomes[0].value(), Some(&2));
        assert!(matches!(outcomes[1].result, BranchResult::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_branch_times_out_without_blocking_others() {
        let branches: Vec<(String, Branch)> = vec![
            ("fast".to_string(), delayed(5, 1)),
            ("slow".to_string(), delayed(60_000, 2)),
        ];
        let outcomes = fan_out(branches, Duration::from_millis(100)).await;
        assert_eq!(outcomes[0].value(), Some(&1));
        assert_eq!(outcomes[1].result, BranchResult::TimedOut);
    }

    #[test]
    fn test_reducer_is_order_independent() {
        use RoutingDecision::*;
        let a = [Continue, Retry, Escalate];
        let b = [Escalate, Continue, Retry];
        assert_eq!(reduce(a), reduce(b));
        assert_eq!(reduce(a), Escalate);
        assert_eq!(reduce([]), Continue);
        assert_eq!(reduce([Abort, Continue]), Abort);
    }

    #[test]
    fn test_reduce_checks_collects_details() {
        let outcomes = vec![
            BranchOutcome {
                name: "agents".to_string(),
                result: BranchResult::Done(CheckResult::pass("agents")),
            },
            BranchOutcome {
                name: "circuits".to_string(),
                result: BranchResult::Done(CheckResult::with(
                    "circuits",
                    RoutingDecision::Escalate,
                    "codex open",
                )),
            },
            BranchOutcome {
                name: "store".to_string(),
                result: BranchResult::TimedOut,
            },
        ];
        let (decision, details) = reduce_checks(&outcomes);
        assert_eq!(decision, RoutingDecision::Escalate);
        assert_eq!(details.len(), 2);
    }
}
