//! Phase bodies other than implementation
//!
//! Each body reads the state, calls agents through the engine, and returns a
//! [`PhaseVerdict`]. Routing and checkpointing stay in the engine.

use keel_agent::{AgentRequest, AgentResponse, AgentRole};
use keel_core::fail_open::fail_open;
use keel_core::{
    ErrorContext, ErrorKind, ErrorLogEntry, EscalationRequest, KeelError, MergedDecision, Phase,
    PhaseStatus, Result, RoutingDecision, StateDelta, Task, TaskStatus, TopicArea, WorkflowState,
};
use serde::Deserialize;
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, info};

use crate::complexity::apply_splits;
use crate::consensus::ApprovalPolicy;
use crate::engine::{clarification_pairs, retry_notes, Call, CallOutcome, PhaseVerdict, WorkflowEngine};
use crate::fan_out::{fan_out, reduce_checks, CheckResult};
use crate::implementation::BatchResult;
use crate::recovery::RecoveryAction;
use crate::review::{ReviewOutcome, ReviewRequest};
use crate::scheduler::detect_cycles;

const PLAN_SCOPE: &str = "plan";

#[derive(Debug, Deserialize)]
struct PlanOutput {
    tasks: Vec<Task>,
}

/// Read the planner's task list from its structured output, or from an
/// artifact that is itself the JSON plan
pub(crate) fn parse_plan(agent: &str, response: &AgentResponse) -> Result<Vec<Task>> {
    let malformed = |detail: String| KeelError::MalformedOutput {
        agent: agent.to_string(),
        detail,
    };
    let value = match &response.structured {
        Some(value) => value.clone(),
        None => serde_json::from_str(response.artifact.trim())
            .map_err(|e| malformed(format!("no structured plan: {}", e)))?,
    };
    let plan: PlanOutput =
        serde_json::from_value(value).map_err(|e| malformed(format!("invalid plan: {}", e)))?;
    Ok(plan
        .tasks
        .into_iter()
        .map(|task| task.with_status(TaskStatus::Pending))
        .collect())
}

/// Markdown rendering of a task list, used when the planner gave no prose
pub(crate) fn render_plan(tasks: &[Task]) -> String {
    let mut out = String::from("# Plan\n");
    for task in tasks {
        out.push_str(&format!("\n## {} {}\n", task.id, task.title));
        if !task.dependencies.is_empty() {
            out.push_str(&format!("Depends on: {}\n", task.dependencies.join(", ")));
        }
        if !task.file_scope.is_empty() {
            out.push_str(&format!("Files: {}\n", task.file_scope.join(", ")));
        }
        for criterion in &task.acceptance_criteria {
            out.push_str(&format!("- {}\n", criterion));
        }
    }
    out
}

/// Structural check of a task list
fn plan_check(name: &str, tasks: &[Task]) -> CheckResult {
    match name {
        "graph" => {
            let ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
            let unknown: Vec<String> = tasks
                .iter()
                .flat_map(|t| {
                    t.dependencies
                        .iter()
                        .filter(|d| !ids.contains(d.as_str()))
                        .map(move |d| format!("{} -> {}", t.id, d))
                })
                .collect();
            if !unknown.is_empty() {
                return CheckResult::with(
                    name,
                    RoutingDecision::Escalate,
                    format!("unknown dependencies: {}", unknown.join(", ")),
                );
            }
            let cycles = detect_cycles(tasks);
            if cycles.is_empty() {
                CheckResult::pass(name)
            } else {
                let rendered: Vec<String> = cycles.iter().map(|c| c.join(" -> ")).collect();
                CheckResult::with(
                    name,
                    RoutingDecision::Escalate,
                    format!("dependency cycle: {}", rendered.join("; ")),
                )
            }
        }
        "definitions" => {
            if tasks.is_empty() {
                return CheckResult::with(name, RoutingDecision::Retry, "plan has no tasks");
            }
            let mut seen = HashSet::new();
            let mut problems = Vec::new();
            for task in tasks {
                if !seen.insert(task.id.as_str()) {
                    problems.push(format!("duplicate id {}", task.id));
                }
                if task.id.trim().is_empty() || task.title.trim().is_empty() {
                    problems.push(format!("task '{}' has no id or title", task.id));
                }
            }
            if problems.is_empty() {
                CheckResult::pass(name)
            } else {
                CheckResult::with(name, RoutingDecision::Retry, problems.join(", "))
            }
        }
        other => CheckResult::with(other, RoutingDecision::Escalate, "unknown check"),
    }
}

impl WorkflowEngine {
    pub(crate) async fn run_prerequisites(&self, state: &mut WorkflowState) -> Result<PhaseVerdict> {
        if let Some(removed) =
            fail_open("cleanup_contexts", || self.isolation.cleanup_orphans()).await
        {
            if removed > 0 {
                info!(removed, "removed orphaned contexts");
            }
        }

        let branches = ["agents", "artifacts", "circuits"]
            .into_iter()
            .map(|name| (name.to_string(), self.prerequisite_check(name)))
            .collect();
        let outcomes = fan_out(branches, self.config.engine.agent_timeout()).await;
        let (decision, details) = reduce_checks(&outcomes);
        debug!(run_id = %state.run_id, %decision, "prerequisites checked");

        Ok(match decision {
            RoutingDecision::Continue => PhaseVerdict::Continue,
            RoutingDecision::Retry => PhaseVerdict::Retry(details),
            RoutingDecision::Escalate => PhaseVerdict::Escalate(
                EscalationRequest::new(Phase::Prerequisites, details.join("; "))
                    .with_kind(ErrorKind::Transient),
            ),
            RoutingDecision::Abort => PhaseVerdict::Abort(details.join("; ")),
        })
    }

    async fn prerequisite_check(&self, name: &'static str) -> Result<CheckResult> {
        match name {
            "agents" => {
                let registry = self.dispatcher.registry();
                let mut required = BTreeSet::new();
                required.insert(self.config.agents.planner.clone());
                required.insert(self.config.agents.worker.clone());
                required.extend(self.reviews.reviewer_ids());
                let missing: Vec<String> = required
                    .into_iter()
                    .filter(|id| !registry.contains(id))
                    .collect();
                if missing.is_empty() {
                    Ok(CheckResult::pass(name))
                } else {
                    Ok(CheckResult::with(
                        name,
                        RoutingDecision::Abort,
                        format!("agents not registered: {}", missing.join(", ")),
                    ))
                }
            }
            "artifacts" => {
                self.isolation.store().check().await?;
                Ok(CheckResult::pass(name))
            }
            "circuits" => {
                let open = self.recovery.breakers().open_circuits();
                if open.is_empty() {
                    Ok(CheckResult::pass(name))
                } else {
                    Ok(CheckResult::with(
                        name,
                        RoutingDecision::Escalate,
                        format!("circuit open for {}", open.join(", ")),
                    ))
                }
            }
            other => Err(KeelError::Phase(format!("unknown prerequisite {}", other))),
        }
    }

    pub(crate) async fn run_planning(&self, state: &mut WorkflowState) -> Result<PhaseVerdict> {
        let iteration = state.iteration(Phase::Planning);
        if !state.tasks.is_empty() && iteration == 0 {
            // Supplied plan: check it as-is
            let tasks = state.tasks.clone();
            return self.accept_plan(state, Phase::Planning, tasks, None).await;
        }

        let prompt = format!(
            "Break the feature \"{}\" into implementation tasks. Answer with \
             {{\"tasks\": [...]}} where each task has id, title, dependencies, \
             file_scope, acceptance_criteria, priority and complexity.",
            state.feature
        );
        let request = AgentRequest::new(AgentRole::Planner, Phase::Planning, prompt)
            .with_feedback(retry_notes(state, Phase::Planning))
            .with_clarifications(clarification_pairs(state, Phase::Planning, None));
        self.request_plan(state, Phase::Planning, request).await
    }

    pub(crate) async fn run_validation(&self, state: &mut WorkflowState) -> Result<PhaseVerdict> {
        let iteration = state.iteration(Phase::Validation);
        if iteration > 0 || changes_requested(state, Phase::Validation) {
            let artifact = state
                .plan_artifact
                .clone()
                .unwrap_or_else(|| render_plan(&state.tasks));
            let request = AgentRequest::new(
                AgentRole::Planner,
                Phase::Validation,
                format!(
                    "Revise the plan for \"{}\" to address the review feedback. \
                     Answer with the full task list as {{\"tasks\": [...]}}.",
                    state.feature
                ),
            )
            .with_artifact(artifact)
            .with_feedback(state.latest_feedback_notes(Phase::Validation))
            .with_clarifications(clarification_pairs(state, Phase::Validation, None));
            let revised = self.request_plan(state, Phase::Validation, request).await?;
            if !matches!(revised, PhaseVerdict::Continue) {
                return Ok(revised);
            }
        }

        let request = ReviewRequest {
            phase: Phase::Validation,
            prompt: format!(
                "Review the implementation plan for \"{}\". Check task boundaries, \
                 dependencies, file scopes and acceptance criteria.",
                state.feature
            ),
            artifact: state
                .plan_artifact
                .clone()
                .unwrap_or_else(|| render_plan(&state.tasks)),
            tasks: state.tasks.clone(),
            clarifications: clarification_pairs(state, Phase::Validation, None),
            policy: ApprovalPolicy::NoBlockers {
                min_score: self.config.review.validation_min_score,
            },
        };
        let outcome = self.reviews.review(&request).await;
        self.record_review(state, Phase::Validation, iteration, outcome)
    }

    pub(crate) async fn run_verification(&self, state: &mut WorkflowState) -> Result<PhaseVerdict> {
        let iteration = state.iteration(Phase::Verification);
        if iteration > 0 || changes_requested(state, Phase::Verification) {
            let scope = union_scope(&state.tasks);
            let fixup = Task::new(
                format!("fixup-{}", iteration),
                "Address verification feedback",
            )
            .with_file_scope(scope);
            let feedback = state.latest_feedback_notes(Phase::Verification);
            match self
                .run_batch(state, Phase::Verification, vec![fixup], false, feedback)
                .await?
            {
                BatchResult::Done => {}
                BatchResult::Stopped(verdict) => return Ok(verdict),
            }
        }

        let artifact = self.implementation_summary(state).await?;
        let request = ReviewRequest {
            phase: Phase::Verification,
            prompt: format!(
                "Verify the implementation of \"{}\" against the plan and each \
                 task's acceptance criteria.",
                state.feature
            ),
            artifact,
            tasks: state.tasks.clone(),
            clarifications: clarification_pairs(state, Phase::Verification, None),
            policy: ApprovalPolicy::AllMustApprove {
                min_score: self.config.review.verification_min_score,
            },
        };
        let outcome = self.reviews.review(&request).await;
        self.record_review(state, Phase::Verification, iteration, outcome)
    }

    pub(crate) async fn run_completion(&self, state: &mut WorkflowState) -> Result<PhaseVerdict> {
        let tasks = state.tasks.clone();
        let statuses: Vec<(Phase, PhaseStatus)> = Phase::PIPELINE
            .iter()
            .filter(|p| **p != Phase::Completion)
            .map(|p| (*p, state.status_of(*p)))
            .collect();

        let branches = ["phases", "tasks"]
            .into_iter()
            .map(|name| {
                let tasks = &tasks;
                let statuses = &statuses;
                let check = async move {
                    Ok(match name {
                        "tasks" => {
                            let open: Vec<&str> = tasks
                                .iter()
                                .filter(|t| {
                                    !matches!(t.status, TaskStatus::Completed | TaskStatus::Blocked)
                                })
                                .map(|t| t.id.as_str())
                                .collect();
                            if open.is_empty() {
                                CheckResult::pass(name)
                            } else {
                                CheckResult::with(
                                    name,
                                    RoutingDecision::Escalate,
                                    format!("tasks not finished: {}", open.join(", ")),
                                )
                            }
                        }
                        _ => {
                            let unfinished: Vec<String> = statuses
                                .iter()
                                .filter(|(_, status)| *status != PhaseStatus::Completed)
                                .map(|(phase, status)| format!("{} is {}", phase, status))
                                .collect();
                            if unfinished.is_empty() {
                                CheckResult::pass(name)
                            } else {
                                CheckResult::with(
                                    name,
                                    RoutingDecision::Escalate,
                                    unfinished.join(", "),
                                )
                            }
                        }
                    })
                };
                (name.to_string(), check)
            })
            .collect();
        let outcomes = fan_out(branches, self.config.engine.agent_timeout()).await;
        let (decision, details) = reduce_checks(&outcomes);

        Ok(match decision {
            RoutingDecision::Continue => {
                let skipped = state
                    .tasks
                    .iter()
                    .filter(|t| t.status == TaskStatus::Blocked)
                    .count();
                info!(
                    run_id = %state.run_id,
                    completed = state.completed_task_ids.len(),
                    skipped,
                    "all work accounted for"
                );
                PhaseVerdict::Continue
            }
            RoutingDecision::Retry => PhaseVerdict::Retry(details),
            RoutingDecision::Escalate => PhaseVerdict::Escalate(EscalationRequest::new(
                Phase::Completion,
                details.join("; "),
            )),
            RoutingDecision::Abort => PhaseVerdict::Abort(details.join("; ")),
        })
    }

    /// Call the planner and run the plan checks on what it returns
    async fn request_plan(
        &self,
        state: &mut WorkflowState,
        phase: Phase,
        request: AgentRequest,
    ) -> Result<PhaseVerdict> {
        let call = Call {
            scope: PLAN_SCOPE.to_string(),
            agent: self.config.agents.planner.clone(),
            request,
            constraints: self.agent_constraints(),
        };
        let outcome = self
            .invoke_one(state, phase, call, |agent, response| {
                parse_plan(agent, response).map(|_| ())
            })
            .await?;
        match outcome {
            CallOutcome::Success { agent, response } => {
                let tasks = parse_plan(&agent, &response)?;
                let prose = Some(response.artifact).filter(|a| !a.trim().is_empty());
                self.accept_plan(state, phase, tasks, prose).await
            }
            other => Ok(other.into_verdict(phase)),
        }
    }

    /// Check a plan, split oversized tasks and install it in the state
    async fn accept_plan(
        &self,
        state: &mut WorkflowState,
        phase: Phase,
        tasks: Vec<Task>,
        prose: Option<String>,
    ) -> Result<PhaseVerdict> {
        let branches = ["definitions", "graph"]
            .into_iter()
            .map(|name| {
                let tasks = &tasks;
                (name.to_string(), async move { Ok(plan_check(name, tasks)) })
            })
            .collect();
        let outcomes = fan_out(branches, self.config.engine.agent_timeout()).await;
        let (decision, details) = reduce_checks(&outcomes);
        match decision {
            RoutingDecision::Continue => {}
            RoutingDecision::Retry => return Ok(PhaseVerdict::Retry(details)),
            RoutingDecision::Escalate => {
                return Ok(PhaseVerdict::Escalate(
                    EscalationRequest::new(phase, details.join("; ")).with_kind(ErrorKind::Fatal),
                ))
            }
            RoutingDecision::Abort => return Ok(PhaseVerdict::Abort(details.join("; "))),
        }

        let (tasks, splits) = apply_splits(tasks, self.config.engine.complexity_threshold);
        for split in &splits {
            info!(
                parent = %split.parent,
                strategy = ?split.strategy,
                children = split.children.len(),
                "split oversized task"
            );
        }
        let artifact = match prose {
            Some(prose) if splits.is_empty() => prose,
            _ => render_plan(&tasks),
        };
        state.replace_tasks(tasks)?;
        state.plan_artifact = Some(artifact);
        Ok(PhaseVerdict::Continue)
    }

    /// Store review feedback and turn the outcome into a verdict
    fn record_review(
        &self,
        state: &mut WorkflowState,
        phase: Phase,
        iteration: u32,
        outcome: ReviewOutcome,
    ) -> Result<PhaseVerdict> {
        let feedback = outcome.feedback(iteration);
        let notes = feedback.notes();
        state.apply(StateDelta::new().with_feedback(phase, feedback))?;

        let findings = security_findings(&outcome);
        if !findings.is_empty() {
            let detail = findings.join("; ");
            let error = KeelError::SecurityBlock(detail.clone());
            let mut context = ErrorContext::from_error(&error, format!("{} review", phase))
                .with_retry_count(iteration);
            context.message = detail;
            state.log_error(ErrorLogEntry::new(phase, None, context.clone()));
            let cause = match self.recovery.decide(&context, None) {
                RecoveryAction::Abort(reason) => return Ok(PhaseVerdict::Abort(reason)),
                RecoveryAction::Escalate(reason) => reason,
                _ => error.to_string(),
            };
            let mut request = EscalationRequest::new(phase, cause)
                .with_kind(ErrorKind::SecurityBlock)
                .with_prior_attempts(iteration);
            for finding in findings {
                request = request.with_transcript(finding);
            }
            return Ok(PhaseVerdict::Escalate(request));
        }

        Ok(match outcome.decision {
            RoutingDecision::Continue => PhaseVerdict::Continue,
            RoutingDecision::Retry => PhaseVerdict::Retry(notes),
            RoutingDecision::Escalate => {
                let cause = if outcome.resolution.has_unresolved_conflicts() {
                    outcome
                        .resolution
                        .conflicts
                        .iter()
                        .map(|c| c.description.clone())
                        .collect::<Vec<_>>()
                        .join("; ")
                } else {
                    format!("reviewers could not agree on the {}", phase)
                };
                let mut request = EscalationRequest::new(phase, cause).with_prior_attempts(iteration);
                for verdict in &outcome.verdicts {
                    request = request.with_transcript(format!(
                        "{}: {} ({:.1})",
                        verdict.reviewer,
                        if verdict.approve { "approve" } else { "reject" },
                        verdict.score
                    ));
                }
                PhaseVerdict::Escalate(request)
            }
            RoutingDecision::Abort => PhaseVerdict::Abort(format!("{} review aborted", phase)),
        })
    }

    /// What reviewers see in verification: integrated files at their current content
    async fn implementation_summary(&self, state: &WorkflowState) -> Result<String> {
        let mut out = format!("# Implementation of {}\n", state.feature);
        let mut files = BTreeSet::new();
        for record in &state.integrations {
            let title = state
                .task(&record.task_id)
                .map(|t| t.title.as_str())
                .unwrap_or("");
            out.push_str(&format!(
                "\n- {} {}: {}\n",
                record.task_id,
                title,
                record.files.join(", ")
            ));
            files.extend(record.files.iter().cloned());
        }

        let store = self.isolation.store();
        for path in files {
            match store.read(&path).await? {
                Some(content) => out.push_str(&format!("\n## {}\n```\n{}\n```\n", path, content)),
                None => out.push_str(&format!("\n## {} (deleted)\n", path)),
            }
        }
        Ok(out)
    }
}

/// Security blockers raised by any reviewer, approving or not
fn security_findings(outcome: &ReviewOutcome) -> Vec<String> {
    let mut findings: Vec<String> = outcome
        .verdicts
        .iter()
        .flat_map(|verdict| {
            verdict
                .blocking_issues
                .iter()
                .filter(|issue| issue.topic == TopicArea::Security)
                .map(move |issue| format!("{}: {}", verdict.reviewer, issue.description))
        })
        .collect();
    if findings.is_empty() && outcome.resolution.security_override {
        findings.push("security block overrode the reviewers' approval".to_string());
    }
    findings
}

/// Whether the last review of `phase` asked for changes
fn changes_requested(state: &WorkflowState, phase: Phase) -> bool {
    state
        .review_feedback
        .get(&phase)
        .and_then(|history| history.last())
        .map_or(false, |feedback| {
            feedback.resolution.decision != MergedDecision::Approved
        })
}

/// Scope covering every task; an unscoped task makes the union unscoped
fn union_scope(tasks: &[Task]) -> Vec<String> {
    if tasks.iter().any(|t| t.file_scope.is_empty()) {
        return Vec::new();
    }
    let patterns: BTreeSet<String> = tasks
        .iter()
        .flat_map(|t| t.file_scope.iter().cloned())
        .collect();
    patterns.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_plan_from_structured_output() {
        let response = AgentResponse::success("Two steps").with_structured(json!({
            "tasks": [
                {"id": "T1", "title": "Schema", "file_scope": ["db/**"]},
                {"id": "T2", "title": "Handlers", "dependencies": ["T1"], "status": "completed"}
            ]
        }));
        let tasks = parse_plan("claude", &response).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].dependencies, vec!["T1".to_string()]);
        // Planner output never arrives pre-completed
        assert_eq!(tasks[1].status, TaskStatus::Pending);
    }

    #[test]
    fn test_parse_plan_from_artifact_json() {
        let response = AgentResponse::success(r#"{"tasks": [{"id": "A", "title": "Only"}]}"#);
        let tasks = parse_plan("claude", &response).unwrap();
        assert_eq!(tasks[0].id, "A");

        let prose = AgentResponse::success("I think we should start with the schema");
        assert!(matches!(
            parse_plan("claude", &prose),
            Err(KeelError::MalformedOutput { .. })
        ));
    }

    #[test]
    fn test_graph_check_escalates_cycles_and_unknown_deps() {
        let cyclic = vec![
            Task::new("A", "a").with_dependencies(["B"]),
            Task::new("B", "b").with_dependencies(["A"]),
        ];
        let check = plan_check("graph", &cyclic);
        assert_eq!(check.decision, RoutingDecision::Escalate);
        assert!(check.detail.contains("cycle"));

        let dangling = vec![Task::new("A", "a").with_dependencies(["Z"])];
        let check = plan_check("graph", &dangling);
        assert_eq!(check.decision, RoutingDecision::Escalate);
        assert!(check.detail.contains("A -> Z"));
    }

    #[test]
    fn test_definitions_check_retries() {
        assert_eq!(plan_check("definitions", &[]).decision, RoutingDecision::Retry);

        let duplicate = vec![Task::new("A", "a"), Task::new("A", "again")];
        let check = plan_check("definitions", &duplicate);
        assert_eq!(check.decision, RoutingDecision::Retry);
        assert!(check.detail.contains("duplicate id A"));

        let fine = vec![Task::new("A", "a"), Task::new("B", "b")];
        assert_eq!(plan_check("definitions", &fine).decision, RoutingDecision::Continue);
    }

    #[test]
    fn test_union_scope() {
        let scoped = vec![
            Task::new("A", "a").with_file_scope(["src/api/**"]),
            Task::new("B", "b").with_file_scope(["src/db/**", "src/api/**"]),
        ];
        assert_eq!(union_scope(&scoped), vec!["src/api/**", "src/db/**"]);

        let open = vec![Task::new("A", "a"), Task::new("B", "b").with_file_scope(["x"])];
        assert!(union_scope(&open).is_empty());
    }

    #[test]
    fn test_render_plan_lists_tasks() {
        let plan = render_plan(&[Task::new("T1", "Schema")
            .with_acceptance_criteria(["migrations run"])]);
        assert!(plan.contains("## T1 Schema"));
        assert!(plan.contains("- migrations run"));
    }
}
