//! Workflow state, the single record every checkpoint serializes
//!
//! Only the engine mutates a `WorkflowState`. Subsystems that compute changes
//! return a [`StateDelta`] which [`WorkflowState::apply`] validates in full
//! before touching anything.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use crate::error::{ErrorContext, KeelError, Result};
use crate::escalation::EscalationRequest;
use crate::review::{ResolutionResult, ReviewVerdict};
use crate::types::{Phase, PhaseStatus, RoutingDecision, Task, TaskId, TaskStatus};

/// Retry counter for one `(scope, phase)` key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBudget {
    pub attempts: u32,
    pub fallback_used: bool,
}

/// Key under which a retry budget is stored
pub fn retry_key(scope: &str, phase: Phase) -> String {
    format!("{}@{}", scope, phase)
}

/// One entry of the bounded error log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub timestamp: DateTime<Utc>,
    pub phase: Phase,
    #[serde(default)]
    pub task_id: Option<TaskId>,
    pub context: ErrorContext,
}

impl ErrorLogEntry {
    pub fn new(phase: Phase, task_id: Option<TaskId>, context: ErrorContext) -> Self {
        Self {
            timestamp: Utc::now(),
            phase,
            task_id,
            context,
        }
    }
}

/// Review outcome recorded for a phase iteration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewFeedback {
    pub iteration: u32,
    pub resolution: ResolutionResult,
    pub verdicts: Vec<ReviewVerdict>,
    /// Reviewers that timed out or errored
    #[serde(default)]
    pub missing_reviewers: Vec<String>,
}

impl ReviewFeedback {
    /// Blocking issues and recommendations, flattened for the next agent prompt
    pub fn notes(&self) -> Vec<String> {
        let mut notes = Vec::new();
        for verdict in &self.verdicts {
            for issue in &verdict.blocking_issues {
                notes.push(format!(
                    "[{}] {}: {}",
                    verdict.reviewer, issue.topic, issue.description
                ));
            }
            for rec in &verdict.recommendations {
                notes.push(format!("[{}] {}", verdict.reviewer, rec));
            }
        }
        for conflict in &self.resolution.conflicts {
            notes.push(format!("conflict: {}", conflict.description));
        }
        notes
    }
}

/// A task's context merged into the shared artifact set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationRecord {
    pub task_id: TaskId,
    pub context_id: String,
    pub files: Vec<String>,
    pub integrated_at: DateTime<Utc>,
}

/// A clarification question answered by a human
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clarification {
    pub phase: Phase,
    #[serde(default)]
    pub task_id: Option<TaskId>,
    pub question: String,
    pub answer: String,
    pub answered_at: DateTime<Utc>,
}

/// Changes computed by a subsystem, applied atomically by the engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDelta {
    pub task_status: Vec<(TaskId, TaskStatus)>,
    pub completed: Vec<TaskId>,
    pub feedback: Vec<(Phase, ReviewFeedback)>,
    pub errors: Vec<ErrorLogEntry>,
    pub integrations: Vec<IntegrationRecord>,
    pub retry_cleared: Vec<String>,
}

impl StateDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_task_status(mut self, id: impl Into<String>, status: TaskStatus) -> Self {
        self.task_status.push((id.into(), status));
        self
    }

    pub fn with_completed(mut self, id: impl Into<String>) -> Self {
        self.completed.push(id.into());
        self
    }

    pub fn with_feedback(mut self, phase: Phase, feedback: ReviewFeedback) -> Self {
        self.feedback.push((phase, feedback));
        self
    }

    pub fn with_error(mut self, entry: ErrorLogEntry) -> Self {
        self.errors.push(entry);
        self
    }

    pub fn with_integration(mut self, record: IntegrationRecord) -> Self {
        self.integrations.push(record);
        self
    }

    pub fn with_retry_cleared(mut self, key: impl Into<String>) -> Self {
        self.retry_cleared.push(key.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.task_status.is_empty()
            && self.completed.is_empty()
            && self.feedback.is_empty()
            && self.errors.is_empty()
            && self.integrations.is_empty()
            && self.retry_cleared.is_empty()
    }
}

fn default_error_log_limit() -> usize {
    100
}

/// Complete state of one workflow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub run_id: String,
    pub feature: String,
    pub phase: Phase,
    pub phase_status: BTreeMap<Phase, PhaseStatus>,
    pub tasks: Vec<Task>,
    pub completed_task_ids: BTreeSet<TaskId>,
    pub error_log: VecDeque<ErrorLogEntry>,
    #[serde(default = "default_error_log_limit")]
    pub error_log_limit: usize,
    pub review_feedback: BTreeMap<Phase, Vec<ReviewFeedback>>,
    pub last_decision: Option<RoutingDecision>,
    /// Iteration counter per phase, bumped by every explicit retry
    pub iterations: BTreeMap<Phase, u32>,
    pub retry_budgets: BTreeMap<String, RetryBudget>,
    #[serde(default)]
    pub plan_artifact: Option<String>,
    #[serde(default)]
    pub integrations: Vec<IntegrationRecord>,
    #[serde(default)]
    pub clarifications: Vec<Clarification>,
    #[serde(default)]
    pub escalation: Option<EscalationRequest>,
    #[serde(default)]
    pub abort_reason: Option<String>,
    /// Sequence of the checkpoint this state was (or will be) saved as
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
}

impl WorkflowState {
    pub fn new(feature: impl Into<String>) -> Self {
        let phase_status = Phase::PIPELINE
            .iter()
            .map(|phase| (*phase, PhaseStatus::Pending))
            .collect();

        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            feature: feature.into(),
            phase: Phase::Prerequisites,
            phase_status,
            tasks: Vec::new(),
            completed_task_ids: BTreeSet::new(),
            error_log: VecDeque::new(),
            error_log_limit: default_error_log_limit(),
            review_feedback: BTreeMap::new(),
            last_decision: None,
            iterations: BTreeMap::new(),
            retry_budgets: BTreeMap::new(),
            plan_artifact: None,
            integrations: Vec::new(),
            clarifications: Vec::new(),
            escalation: None,
            abort_reason: None,
            sequence: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_tasks(mut self, tasks: Vec<Task>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn with_error_log_limit(mut self, limit: usize) -> Self {
        self.error_log_limit = limit.max(1);
        self
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn status_of(&self, phase: Phase) -> PhaseStatus {
        self.phase_status.get(&phase).copied().unwrap_or_default()
    }

    pub fn iteration(&self, phase: Phase) -> u32 {
        self.iterations.get(&phase).copied().unwrap_or(0)
    }

    /// Set a phase's status, refusing any silent regression
    pub fn set_phase_status(&mut self, phase: Phase, status: PhaseStatus) -> Result<()> {
        if !phase.is_pipeline() {
            return Err(KeelError::InvalidTransition(format!(
                "{} has no phase status",
                phase
            )));
        }
        let current = self.status_of(phase);
        if current.regresses_to(status) {
            return Err(KeelError::InvalidTransition(format!(
                "{} cannot move from {} to {} without a retry",
                phase, current, status
            )));
        }
        self.phase_status.insert(phase, status);
        Ok(())
    }

    /// Explicit retry: reset the phase to pending and bump its iteration
    pub fn reopen_phase(&mut self, phase: Phase) -> u32 {
        self.phase_status.insert(phase, PhaseStatus::Pending);
        let iteration = self.iterations.entry(phase).or_insert(0);
        *iteration += 1;
        *iteration
    }

    /// Human-granted retry: the phase starts over with a fresh iteration count
    pub fn reset_phase(&mut self, phase: Phase) {
        self.phase_status.insert(phase, PhaseStatus::Pending);
        self.iterations.insert(phase, 0);
        let suffix = format!("@{}", phase);
        self.retry_budgets.retain(|key, _| !key.ends_with(&suffix));
    }

    /// Hand a blocked phase back to the engine after a human decision,
    /// keeping its iteration count
    pub fn release_phase(&mut self, phase: Phase) {
        self.phase_status.insert(phase, PhaseStatus::Pending);
    }

    pub fn log_error(&mut self, entry: ErrorLogEntry) {
        self.error_log.push_back(entry);
        while self.error_log.len() > self.error_log_limit {
            self.error_log.pop_front();
        }
    }

    pub fn retry_budget(&self, key: &str) -> RetryBudget {
        self.retry_budgets.get(key).copied().unwrap_or_default()
    }

    /// Count one more failed attempt against `key`, returning the new total
    pub fn record_attempt(&mut self, key: &str) -> u32 {
        let budget = self.retry_budgets.entry(key.to_string()).or_default();
        budget.attempts += 1;
        budget.attempts
    }

    pub fn mark_fallback_used(&mut self, key: &str) {
        self.retry_budgets
            .entry(key.to_string())
            .or_default()
            .fallback_used = true;
    }

    pub fn clear_retry(&mut self, key: &str) {
        self.retry_budgets.remove(key);
    }

    /// Answered clarifications for a phase, oldest first
    pub fn clarifications_for(&self, phase: Phase) -> Vec<&Clarification> {
        self.clarifications
            .iter()
            .filter(|c| c.phase == phase)
            .collect()
    }

    /// Feedback notes from the latest review of a phase
    pub fn latest_feedback_notes(&self, phase: Phase) -> Vec<String> {
        self.review_feedback
            .get(&phase)
            .and_then(|entries| entries.last())
            .map(ReviewFeedback::notes)
            .unwrap_or_default()
    }

    /// Replace the task list (after planning or splitting)
    ///
    /// Completed ids that no longer name a task are dropped so the subset rule
    /// keeps holding.
    pub fn replace_tasks(&mut self, tasks: Vec<Task>) -> Result<()> {
        check_unique_ids(&tasks)?;
        let ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        self.completed_task_ids.retain(|id| ids.contains(id.as_str()));
        self.tasks = tasks;
        Ok(())
    }

    /// Tasks that are neither completed nor blocked
    pub fn incomplete_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks
            .iter()
            .filter(|t| !matches!(t.status, TaskStatus::Completed | TaskStatus::Blocked))
    }

    /// Check the structural invariants
    pub fn validate(&self) -> Result<()> {
        check_unique_ids(&self.tasks)?;
        let ids: HashSet<&str> = self.tasks.iter().map(|t| t.id.as_str()).collect();
        if let Some(stray) = self
            .completed_task_ids
            .iter()
            .find(|id| !ids.contains(id.as_str()))
        {
            return Err(KeelError::InvalidTransition(format!(
                "completed id {} is not a known task",
                stray
            )));
        }
        Ok(())
    }

    /// Apply a delta, all or nothing
    pub fn apply(&mut self, delta: StateDelta) -> Result<()> {
        for (id, status) in &delta.task_status {
            let task = self
                .task(id)
                .ok_or_else(|| KeelError::TaskNotFound(id.clone()))?;
            if task.status == TaskStatus::Completed && *status != TaskStatus::Completed {
                return Err(KeelError::InvalidTransition(format!(
                    "task {} is completed and cannot move to {}",
                    id, status
                )));
            }
        }
        if let Some(id) = delta.completed.iter().find(|id| self.task(id).is_none()) {
            return Err(KeelError::TaskNotFound(id.clone()));
        }
        if let Some((phase, _)) = delta.feedback.iter().find(|(p, _)| !p.is_pipeline()) {
            return Err(KeelError::InvalidTransition(format!(
                "feedback recorded against {}",
                phase
            )));
        }

        for (id, status) in delta.task_status {
            if let Some(task) = self.tasks.iter_mut().find(|t| t.id == id) {
                task.status = status;
            }
        }
        for id in delta.completed {
            if let Some(task) = self.tasks.iter_mut().find(|t| t.id == id) {
                task.status = TaskStatus::Completed;
            }
            self.completed_task_ids.insert(id);
        }
        for (phase, feedback) in delta.feedback {
            self.review_feedback.entry(phase).or_default().push(feedback);
        }
        for entry in delta.errors {
            self.log_error(entry);
        }
        self.integrations.extend(delta.integrations);
        for key in delta.retry_cleared {
            self.retry_budgets.remove(&key);
        }
        Ok(())
    }
}

fn check_unique_ids(tasks: &[Task]) -> Result<()> {
    let mut seen = HashSet::new();
    for task in tasks {
        if !seen.insert(task.id.as_str()) {
            return Err(KeelError::Scheduler(format!("duplicate task id {}", task.id)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn state_with_tasks() -> WorkflowState {
        WorkflowState::new("login").with_tasks(vec![
            Task::new("A", "schema"),
            Task::new("B", "handler").with_dependencies(["A"]),
        ])
    }

    fn ctx(msg: &str) -> ErrorContext {
        ErrorContext {
            kind: ErrorKind::Transient,
            recoverable: true,
            retry_count: 0,
            fallback_attempted: false,
            component: "test".to_string(),
            message: msg.to_string(),
        }
    }

    #[test]
    fn test_new_state_has_pending_pipeline() {
        let state = WorkflowState::new("feature");
        assert_eq!(state.phase, Phase::Prerequisites);
        assert_eq!(state.phase_status.len(), Phase::PIPELINE.len());
        assert!(state
            .phase_status
            .values()
            .all(|s| *s == PhaseStatus::Pending));
        assert_eq!(state.sequence, 0);
    }

    #[test]
    fn test_phase_status_never_regresses_silently() {
        let mut state = WorkflowState::new("feature");
        state
            .set_phase_status(Phase::Validation, PhaseStatus::Completed)
            .unwrap();
        let err = state
            .set_phase_status(Phase::Validation, PhaseStatus::InProgress)
            .unwrap_err();
        assert!(matches!(err, KeelError::InvalidTransition(_)));

        // Only an explicit retry walks it back
        assert_eq!(state.reopen_phase(Phase::Validation), 1);
        assert_eq!(state.status_of(Phase::Validation), PhaseStatus::Pending);
        assert_eq!(state.iteration(Phase::Validation), 1);
    }

    #[test]
    fn test_error_log_is_bounded() {
        let mut state = WorkflowState::new("feature").with_error_log_limit(3);
        for i in 0..5 {
            state.log_error(ErrorLogEntry::new(
                Phase::Planning,
                None,
                ctx(&format!("e{}", i)),
            ));
        }
        assert_eq!(state.error_log.len(), 3);
        assert_eq!(state.error_log.front().unwrap().context.message, "e2");
    }

    #[test]
    fn test_retry_budget_tracking() {
        let mut state = WorkflowState::new("feature");
        let key = retry_key("T1", Phase::Implementation);
        assert_eq!(key, "T1@IMPLEMENTATION");

        assert_eq!(state.record_attempt(&key), 1);
        assert_eq!(state.record_attempt(&key), 2);
        state.mark_fallback_used(&key);
        assert!(state.retry_budget(&key).fallback_used);

        state.reset_phase(Phase::Implementation);
        assert_eq!(state.retry_budget(&key), RetryBudget::default());
    }

    #[test]
    fn test_apply_delta_marks_completed() {
        let mut state = state_with_tasks();
        let delta = StateDelta::new()
            .with_task_status("B", TaskStatus::InProgress)
            .with_completed("A");
        state.apply(delta).unwrap();

        assert!(state.completed_task_ids.contains("A"));
        assert!(state.task("A").unwrap().is_complete());
        assert_eq!(state.task("B").unwrap().status, TaskStatus::InProgress);
        state.validate().unwrap();
    }

    #[test]
    fn test_apply_delta_rejects_unknown_ids_without_partial_writes() {
        let mut state = state_with_tasks();
        let before = state.clone();
        let delta = StateDelta::new()
            .with_task_status("A", TaskStatus::InProgress)
            .with_completed("Z");

        assert!(matches!(state.apply(delta), Err(KeelError::TaskNotFound(_))));
        assert_eq!(state, before);
    }

    #[test]
    fn test_apply_delta_rejects_completed_regression() {
        let mut state = state_with_tasks();
        state.apply(StateDelta::new().with_completed("A")).unwrap();
        let err = state
            .apply(StateDelta::new().with_task_status("A", TaskStatus::Pending))
            .unwrap_err();
        assert!(matches!(err, KeelError::InvalidTransition(_)));
    }

    #[test]
    fn test_replace_tasks_keeps_subset_rule() {
        let mut state = state_with_tasks();
        state.apply(StateDelta::new().with_completed("A")).unwrap();
        state.replace_tasks(vec![Task::new("C", "other")]).unwrap();
        assert!(state.completed_task_ids.is_empty());

        let dup = vec![Task::new("X", "one"), Task::new("X", "two")];
        assert!(state.replace_tasks(dup).is_err());
    }

    #[test]
    fn test_state_json_roundtrip_is_exact() {
        let mut state = state_with_tasks();
        state.log_error(ErrorLogEntry::new(
            Phase::Implementation,
            Some("A".to_string()),
            ctx("timeout"),
        ));
        state.record_attempt("A@IMPLEMENTATION");
        state.escalation = Some(EscalationRequest::new(Phase::Validation, "split vote"));

        let json = serde_json::to_string(&state).unwrap();
        let back: WorkflowState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
        assert_eq!(serde_json::to_string(&back).unwrap(), json);
    }
}
