//! Weighted consensus across reviewer verdicts
//!
//! Reviewers are weighted per topic area by their specialty, and the task type
//! inferred from task metadata picks which topic decides. A security-tagged
//! blocking issue is never outvoted.

use keel_core::config::{ResolutionStrategy, ReviewConfig};
use keel_core::{
    KeelError, MergedDecision, ResolutionResult, Result, ReviewConflict, ReviewVerdict,
    ReviewerRole, RoutingDecision, Task, TaskType, TopicArea,
};
use regex::Regex;
use std::collections::BTreeMap;
use tracing::debug;

/// Infers a task type from titles, criteria and file scopes
pub struct TaskClassifier {
    security: Regex,
    architecture: Regex,
    optimization: Regex,
}

impl TaskClassifier {
    pub fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| KeelError::Config(format!("bad classifier pattern: {}", e)))
        };
        Ok(Self {
            security: compile(
                r"(?i)\b(auth\w*|security|secrets?|tokens?|passwords?|crypt\w*|permissions?|credentials?|vulnerab\w*|sanitiz\w*|csrf|xss|injection|oauth)\b",
            )?,
            architecture: compile(
                r"(?i)\b(architecture|refactor\w*|interfaces?|modules?|layers?|abstractions?|design|migrat\w*|restructur\w*|decoupl\w*)\b",
            )?,
            optimization: compile(
                r"(?i)\b(optimi[sz]\w*|performance|latency|throughput|cach\w*|memory|speed\w*|scal\w*|benchmarks?)\b",
            )?,
        })
    }

    /// Classify a set of tasks by keyword counts
    ///
    /// The highest count wins; ties go security, architecture, optimization.
    /// No matches at all is `General`.
    pub fn classify(&self, tasks: &[Task]) -> TaskType {
        let mut counts = [0usize; 3];
        for task in tasks {
            let texts = std::iter::once(task.title.as_str())
                .chain(task.acceptance_criteria.iter().map(String::as_str))
                .chain(task.file_scope.iter().map(String::as_str));
            for text in texts {
                counts[0] += self.security.find_iter(text).count();
                counts[1] += self.architecture.find_iter(text).count();
                counts[2] += self.optimization.find_iter(text).count();
            }
        }

        let types = [TaskType::Security, TaskType::Architecture, TaskType::Optimization];
        let mut best: Option<(usize, TaskType)> = None;
        for (count, task_type) in counts.into_iter().zip(types) {
            if count > 0 && best.map_or(true, |(c, _)| count > c) {
                best = Some((count, task_type));
            }
        }
        let task_type = best.map(|(_, t)| t).unwrap_or(TaskType::General);
        debug!(?counts, %task_type, "classified tasks");
        task_type
    }
}

/// Raw weight of a reviewer role on a topic
pub fn role_weight(role: ReviewerRole, topic: TopicArea) -> f64 {
    match (role, topic) {
        (ReviewerRole::Security, TopicArea::Security) => 0.8,
        (ReviewerRole::Security, TopicArea::Architecture) => 0.2,
        (ReviewerRole::Architecture, TopicArea::Security) => 0.2,
        (ReviewerRole::Architecture, TopicArea::Architecture) => 0.8,
        _ => 0.5,
    }
}

/// A verdict together with the role of the reviewer that gave it
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedVerdict {
    pub role: ReviewerRole,
    pub verdict: ReviewVerdict,
}

impl WeightedVerdict {
    pub fn new(role: ReviewerRole, verdict: ReviewVerdict) -> Self {
        Self { role, verdict }
    }

    /// Approves with no blocking issue at all
    fn approves(&self) -> bool {
        self.verdict.approve && !self.verdict.has_blockers()
    }
}

/// Normalized weights of the present reviewers on a topic
fn weights(verdicts: &[WeightedVerdict], topic: TopicArea) -> Vec<f64> {
    let raw: Vec<f64> = verdicts.iter().map(|v| role_weight(v.role, topic)).collect();
    let sum: f64 = raw.iter().sum();
    if sum <= 0.0 {
        return vec![1.0 / verdicts.len().max(1) as f64; verdicts.len()];
    }
    raw.into_iter().map(|w| w / sum).collect()
}

fn topic_scores(verdicts: &[WeightedVerdict]) -> BTreeMap<TopicArea, f64> {
    TopicArea::ALL
        .iter()
        .map(|topic| {
            let score = weights(verdicts, *topic)
                .iter()
                .zip(verdicts)
                .map(|(w, v)| w * v.verdict.score.clamp(0.0, 10.0))
                .sum();
            (*topic, score)
        })
        .collect()
}

/// Merge verdicts into one decision
///
/// The merge is order-independent: every quantity is a weighted sum or an
/// any/all over the verdicts.
pub fn resolve(
    verdicts: &[WeightedVerdict],
    task_type: TaskType,
    config: &ReviewConfig,
) -> ResolutionResult {
    if verdicts.is_empty() {
        return ResolutionResult {
            decision: MergedDecision::Escalate,
            task_type,
            topic_scores: BTreeMap::new(),
            aggregate_score: 0.0,
            conflicts: vec![ReviewConflict {
                reviewers: Vec::new(),
                score_spread: 0.0,
                description: "no reviewer returned a verdict".to_string(),
            }],
            security_override: false,
        };
    }

    let topic = task_type.primary_topic();
    let topic_scores = topic_scores(verdicts);
    let aggregate_score = topic_scores.get(&topic).copied().unwrap_or(0.0);
    let security_block = verdicts.iter().any(|v| v.verdict.has_security_block());

    let approvals = verdicts.iter().filter(|v| v.approves()).count();
    let unanimous = approvals == 0 || approvals == verdicts.len();

    let mut reviewers: Vec<String> = verdicts.iter().map(|v| v.verdict.reviewer.clone()).collect();
    reviewers.sort();
    let (low, high) = verdicts.iter().fold((f64::MAX, f64::MIN), |(lo, hi), v| {
        (lo.min(v.verdict.score), hi.max(v.verdict.score))
    });
    let spread = high - low;

    let mut conflicts = Vec::new();
    let decision = if unanimous {
        if approvals == verdicts.len() {
            MergedDecision::Approved
        } else {
            MergedDecision::NeedsChanges
        }
    } else {
        match config.strategy {
            ResolutionStrategy::Weighted => {
                let share: f64 = weights(verdicts, topic)
                    .iter()
                    .zip(verdicts)
                    .filter(|(_, v)| v.approves())
                    .map(|(w, _)| w)
                    .sum();
                if (share - 0.5).abs() < config.weight_margin {
                    conflicts.push(ReviewConflict {
                        reviewers: reviewers.clone(),
                        score_spread: spread,
                        description: format!(
                            "approval share {:.2} on {} is within {:.2} of an even split",
                            share, topic, config.weight_margin
                        ),
                    });
                    MergedDecision::Escalate
                } else if share > 0.5 {
                    MergedDecision::Approved
                } else {
                    MergedDecision::NeedsChanges
                }
            }
            ResolutionStrategy::Conservative => MergedDecision::NeedsChanges,
            ResolutionStrategy::Escalate => {
                if spread > config.score_tolerance {
                    conflicts.push(ReviewConflict {
                        reviewers: reviewers.clone(),
                        score_spread: spread,
                        description: format!(
                            "scores differ by {:.1}, beyond tolerance {:.1}",
                            spread, config.score_tolerance
                        ),
                    });
                    MergedDecision::Escalate
                } else {
                    MergedDecision::NeedsChanges
                }
            }
        }
    };

    let security_override = security_block && decision == MergedDecision::Approved;
    let decision = if security_override {
        MergedDecision::NeedsChanges
    } else {
        decision
    };

    debug!(
        %task_type,
        %decision,
        aggregate_score,
        approvals,
        reviewers = verdicts.len(),
        security_override,
        "resolved review"
    );

    ResolutionResult {
        decision,
        task_type,
        topic_scores,
        aggregate_score,
        conflicts,
        security_override,
    }
}

/// Phase-specific approval rule
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ApprovalPolicy {
    /// No blocking issue from anyone and the aggregate reaches `min_score`
    NoBlockers { min_score: f64 },
    /// Every reviewer answered and approved, and the aggregate reaches `min_score`
    AllMustApprove { min_score: f64 },
}

impl ApprovalPolicy {
    /// Route a resolution; unresolved conflicts always escalate
    pub fn evaluate(
        &self,
        resolution: &ResolutionResult,
        verdicts: &[ReviewVerdict],
        missing: &[String],
    ) -> RoutingDecision {
        if resolution.decision == MergedDecision::Escalate || resolution.has_unresolved_conflicts() {
            return RoutingDecision::Escalate;
        }

        let approved = resolution.decision == MergedDecision::Approved;
        let passes = match self {
            Self::NoBlockers { min_score } => {
                approved
                    && verdicts.iter().all(|v| !v.has_blockers())
                    && resolution.aggregate_score >= *min_score
            }
            Self::AllMustApprove { min_score } => {
                approved
                    && missing.is_empty()
                    && verdicts.iter().all(|v| v.approve)
                    && resolution.aggregate_score >= *min_score
            }
        };

        if passes {
            RoutingDecision::Continue
        } else {
            RoutingDecision::Retry
        }
    }
}
