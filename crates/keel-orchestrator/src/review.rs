//! Parallel review dispatch and merge
//!
//! Every configured reviewer gets the same read-only request for the same
//! artifact. A reviewer that errors or times out is recorded as missing and
//! contributes no verdict; the rest are merged by [`resolve`].

use keel_agent::{AgentRequest, AgentRole, Constraints};
use keel_core::config::{ReviewConfig, ReviewerConfig};
use keel_core::{
    Phase, ResolutionResult, Result, ReviewFeedback, ReviewVerdict, RoutingDecision, Task,
};
use std::sync::Arc;
use tracing::info;

use crate::consensus::{resolve, ApprovalPolicy, TaskClassifier, WeightedVerdict};
use crate::dispatch::AgentDispatcher;
use crate::fan_out::{fan_out, BranchResult};

/// What is being reviewed
#[derive(Debug, Clone)]
pub struct ReviewRequest {
    pub phase: Phase,
    pub prompt: String,
    pub artifact: String,
    /// Tasks the artifact covers, used to infer the task type
    pub tasks: Vec<Task>,
    pub clarifications: Vec<(String, String)>,
    pub policy: ApprovalPolicy,
}

#[derive(Debug, Clone)]
pub struct ReviewOutcome {
    pub verdicts: Vec<ReviewVerdict>,
    /// Reviewers that produced no verdict
    pub missing: Vec<String>,
    pub resolution: ResolutionResult,
    pub decision: RoutingDecision,
}

impl ReviewOutcome {
    pub fn feedback(&self, iteration: u32) -> ReviewFeedback {
        ReviewFeedback {
            iteration,
            resolution: self.resolution.clone(),
            verdicts: self.verdicts.clone(),
            missing_reviewers: self.missing.clone(),
        }
    }
}

pub struct ReviewCoordinator {
    reviewers: Vec<ReviewerConfig>,
    config: ReviewConfig,
    classifier: TaskClassifier,
    dispatcher: Arc<AgentDispatcher>,
}

impl ReviewCoordinator {
    pub fn new(
        reviewers: Vec<ReviewerConfig>,
        config: ReviewConfig,
        dispatcher: Arc<AgentDispatcher>,
    ) -> Result<Self> {
        Ok(Self {
            reviewers,
            config,
            classifier: TaskClassifier::new()?,
            dispatcher,
        })
    }

    pub fn reviewer_ids(&self) -> Vec<String> {
        self.reviewers.iter().map(|r| r.id.clone()).collect()
    }

    /// Fan the artifact out to every reviewer and merge what comes back
    pub async fn review(&self, request: &ReviewRequest) -> ReviewOutcome {
        let timeout = self.config.timeout();
        let constraints = Constraints::new(timeout).read_only();
        let agent_request = AgentRequest::new(AgentRole::Reviewer, request.phase, &request.prompt)
            .with_artifact(&request.artifact)
            .with_clarifications(request.clarifications.clone());

        let branches = self
            .reviewers
            .iter()
            .map(|reviewer| {
                let id = reviewer.id.clone();
                let dispatcher = self.dispatcher.clone();
                let agent_request = agent_request.clone();
                let constraints = constraints.clone();
                let branch = async move {
                    let response = dispatcher
                        .invoke_checked(&id, &agent_request, &constraints, |response| {
                            response.parse_verdict(&id).map(|_| ())
                        })
                        .await?;
                    response.parse_verdict(&id)
                };
                (reviewer.id.clone(), branch)
            })
            .collect();
        let outcomes = fan_out(branches, timeout).await;

        let mut weighted = Vec::new();
        let mut missing = Vec::new();
        for outcome in outcomes {
            match outcome.result {
                BranchResult::Done(verdict) => {
                    let role = self
                        .reviewers
                        .iter()
                        .find(|r| r.id == outcome.name)
                        .map(|r| r.role)
                        .unwrap_or_default();
                    weighted.push(WeightedVerdict::new(role, verdict));
                }
                BranchResult::Failed(_) | BranchResult::TimedOut => missing.push(outcome.name),
            }
        }

        let task_type = self.classifier.classify(&request.tasks);
        let resolution = resolve(&weighted, task_type, &self.config);
        let verdicts: Vec<ReviewVerdict> = weighted.into_iter().map(|w| w.verdict).collect();
        let decision = request.policy.evaluate(&resolution, &verdicts, &missing);

        info!(
            phase = %request.phase,
            %task_type,
            merged = %resolution.decision,
            %decision,
            aggregate = resolution.aggregate_score,
            verdicts = verdicts.len(),
            missing = missing.len(),
            "review complete"
        );

        ReviewOutcome {
            verdicts,
            missing,
            resolution,
            decision,
        }
    }
}
