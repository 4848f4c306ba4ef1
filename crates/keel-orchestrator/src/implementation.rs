//! Implementation phase: scheduled batches of isolated workers
//!
//! Each batch gets one context per task. Workers run concurrently; their
//! contexts are integrated one at a time under the isolation layer's writer
//! lock, and each successful integration is checkpointed before the next.

use keel_agent::{AgentRequest, AgentResponse, AgentRole};
use keel_core::{
    retry_key, EscalationRequest, IntegrationRecord, KeelError, Phase, Result, StateDelta, Task,
    TaskId, TaskStatus, WorkflowState,
};
use serde::Deserialize;
use tracing::{info, warn};

use crate::engine::{clarification_pairs, Call, CallOutcome, PhaseVerdict, WorkflowEngine};
use crate::isolation::{IntegrationResult, IsolatedContext};
use crate::scheduler::{Signal, TaskScheduler};

pub(crate) enum BatchResult {
    Done,
    /// Some work did not land; integrated tasks stay integrated
    Stopped(PhaseVerdict),
}

#[derive(Debug, Deserialize)]
struct WorkerOutput {
    #[serde(default)]
    files: Vec<FileEdit>,
}

#[derive(Debug, Deserialize)]
struct FileEdit {
    path: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    deleted: bool,
}

fn worker_prompt(task: &Task) -> String {
    let mut prompt = format!("Implement task {}: {}\n", task.id, task.title);
    if !task.acceptance_criteria.is_empty() {
        prompt.push_str("\nAcceptance criteria:\n");
        for criterion in &task.acceptance_criteria {
            prompt.push_str(&format!("- {}\n", criterion));
        }
    }
    if !task.file_scope.is_empty() {
        prompt.push_str(&format!(
            "\nOnly touch files matching: {}\n",
            task.file_scope.join(", ")
        ));
    }
    prompt.push_str(
        "\nEdit files in the working directory, or answer with \
         {\"files\": [{\"path\": ..., \"content\": ...}]}.",
    );
    prompt
}

/// Parse the structured file list, if the worker sent one
fn parse_edits(agent: &str, response: &AgentResponse) -> Result<Vec<FileEdit>> {
    let Some(value) = &response.structured else {
        return Ok(Vec::new());
    };
    let malformed = |detail: String| KeelError::MalformedOutput {
        agent: agent.to_string(),
        detail,
    };
    let output: WorkerOutput = serde_json::from_value(value.clone())
        .map_err(|e| malformed(format!("invalid file list: {}", e)))?;
    for edit in &output.files {
        if !edit.deleted && edit.content.is_none() {
            return Err(malformed(format!("{} has no content", edit.path)));
        }
    }
    Ok(output.files)
}

fn as_malformed(agent: &str, error: KeelError) -> KeelError {
    match error {
        KeelError::Isolation(detail) => KeelError::MalformedOutput {
            agent: agent.to_string(),
            detail,
        },
        other => other,
    }
}

/// Reject a worker response before anything reaches its context
///
/// A bad file list or a path outside the task's scope is malformed output,
/// which recovery hands to the fallback agent.
pub(crate) fn check_worker_output(
    context: &IsolatedContext,
    agent: &str,
    response: &AgentResponse,
) -> Result<()> {
    for edit in parse_edits(agent, response)? {
        context
            .admits(&edit.path)
            .map_err(|e| as_malformed(agent, e))?;
    }
    Ok(())
}

/// Move a worker's edits into its context
///
/// Files written to the materialized directory are picked up first, then
/// any edits listed in the structured output.
pub(crate) async fn apply_worker_output(
    context: &mut IsolatedContext,
    agent: &str,
    response: &AgentResponse,
) -> Result<()> {
    context.sync_from_dir().await?;
    for edit in parse_edits(agent, response)? {
        let applied = match edit.content {
            Some(content) if !edit.deleted => context.write(&edit.path, content),
            _ => context.delete(&edit.path),
        };
        applied.map_err(|e| as_malformed(agent, e))?;
    }
    Ok(())
}

/// Keep the most severe verdict seen so far
fn keep_worst(stop: &mut Option<PhaseVerdict>, verdict: PhaseVerdict) {
    let worse = stop
        .as_ref()
        .map_or(true, |current| verdict.decision() > current.decision());
    if worse {
        *stop = Some(verdict);
    }
}

impl WorkflowEngine {
    pub(crate) async fn run_implementation(
        &self,
        state: &mut WorkflowState,
    ) -> Result<PhaseVerdict> {
        let mut scheduler = TaskScheduler::new(&state.tasks, &state.completed_task_ids);
        let max_workers = self.config.engine.max_parallel_workers;

        loop {
            match scheduler.poll() {
                Signal::Ready => {}
                Signal::Done => {
                    info!(
                        run_id = %state.run_id,
                        completed = scheduler.completed_count(),
                        "all tasks integrated"
                    );
                    return Ok(PhaseVerdict::Continue);
                }
                Signal::Blocked(stall) => {
                    return Ok(PhaseVerdict::Escalate(EscalationRequest::new(
                        Phase::Implementation,
                        format!("scheduler stalled: {}", stall),
                    )))
                }
                Signal::Waiting => {
                    return Err(KeelError::Scheduler(
                        "tasks still in flight between batches".to_string(),
                    ))
                }
            }

            let batch = scheduler.next_batch(max_workers);
            let ids: Vec<TaskId> = batch.iter().map(|t| t.id.clone()).collect();
            info!(run_id = %state.run_id, tasks = ?ids, "starting batch");
            match self
                .run_batch(state, Phase::Implementation, batch, true, Vec::new())
                .await?
            {
                BatchResult::Done => {
                    for id in &ids {
                        scheduler.mark_completed(id);
                    }
                }
                BatchResult::Stopped(verdict) => return Ok(verdict),
            }
        }
    }

    /// Run one batch of workers in isolated contexts and integrate the results
    ///
    /// With `track` set the tasks are real plan tasks: their status moves
    /// through in-progress to completed and escalations name them. Without
    /// it (verification fix-ups) only the integration is recorded.
    pub(crate) async fn run_batch(
        &self,
        state: &mut WorkflowState,
        phase: Phase,
        tasks: Vec<Task>,
        track: bool,
        feedback: Vec<String>,
    ) -> Result<BatchResult> {
        if track {
            let delta = tasks.iter().fold(StateDelta::new(), |delta, task| {
                delta.with_task_status(task.id.clone(), TaskStatus::InProgress)
            });
            state.apply(delta)?;
            self.checkpoint(state).await?;
        }

        let mut contexts = self.isolation.create_batch(&tasks).await?;
        let result = self
            .work_batch(state, phase, &tasks, &mut contexts, track, feedback)
            .await;
        for context in contexts {
            self.isolation.cleanup(context).await;
        }
        let result = result?;

        if track && matches!(result, BatchResult::Stopped(_)) {
            let delta = tasks
                .iter()
                .filter(|task| {
                    state
                        .task(&task.id)
                        .map(|t| t.status == TaskStatus::InProgress)
                        .unwrap_or(false)
                })
                .fold(StateDelta::new(), |delta, task| {
                    delta.with_task_status(task.id.clone(), TaskStatus::Pending)
                });
            state.apply(delta)?;
        }
        Ok(result)
    }

    async fn work_batch(
        &self,
        state: &mut WorkflowState,
        phase: Phase,
        tasks: &[Task],
        contexts: &mut [IsolatedContext],
        track: bool,
        feedback: Vec<String>,
    ) -> Result<BatchResult> {
        let calls: Vec<Call> = tasks
            .iter()
            .zip(contexts.iter())
            .map(|(task, context)| {
                let mut request = AgentRequest::new(AgentRole::Worker, phase, worker_prompt(task))
                    .with_feedback(feedback.clone())
                    .with_clarifications(clarification_pairs(state, phase, Some(task.id.as_str())));
                if track {
                    request = request.with_task(task.id.clone());
                }
                if let Some(plan) = &state.plan_artifact {
                    request = request.with_artifact(plan.clone());
                }
                if let Some(dir) = context.dir() {
                    request = request.with_workdir(dir);
                }
                Call {
                    scope: task.id.clone(),
                    agent: self.config.agents.worker.clone(),
                    request,
                    constraints: self.agent_constraints(),
                }
            })
            .collect();
        let checked: &[IsolatedContext] = &*contexts;
        let outcomes = self
            .invoke_with_recovery(state, phase, calls, |index, agent, response| {
                check_worker_output(&checked[index], agent, response)
            })
            .await?;

        let mut stop = None;
        for ((task, context), outcome) in tasks.iter().zip(contexts.iter_mut()).zip(outcomes) {
            let (agent, response) = match outcome {
                CallOutcome::Success { agent, response } => (agent, response),
                other => {
                    keep_worst(&mut stop, other.into_verdict(phase));
                    continue;
                }
            };

            if let Err(e) = apply_worker_output(context, &agent, &response).await {
                warn!(task_id = %task.id, error = %e, "worker output rejected");
                let mut request = EscalationRequest::new(phase, e.to_string()).with_kind(e.kind());
                if track {
                    request = request.with_task(task.id.clone());
                }
                keep_worst(&mut stop, PhaseVerdict::Escalate(request));
                continue;
            }

            match self.isolation.integrate(context).await? {
                IntegrationResult::Integrated { files } => {
                    let record = IntegrationRecord {
                        task_id: task.id.clone(),
                        context_id: context.id.clone(),
                        files,
                        integrated_at: chrono::Utc::now(),
                    };
                    let mut delta = StateDelta::new()
                        .with_integration(record)
                        .with_retry_cleared(retry_key(&task.id, phase));
                    if track {
                        delta = delta.with_completed(task.id.clone());
                    }
                    state.apply(delta)?;
                    self.checkpoint(state).await?;
                }
                IntegrationResult::Conflict(report) => {
                    let mut request = EscalationRequest::new(phase, report.to_string())
                        .with_remedy("integration was not applied; the shared set is unchanged");
                    if track {
                        request = request.with_task(task.id.clone());
                    }
                    keep_worst(&mut stop, PhaseVerdict::Escalate(request));
                }
            }
        }

        Ok(match stop {
            Some(verdict) => BatchResult::Stopped(verdict),
            None => BatchResult::Done,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::{IsolationLayer, MemoryArtifactStore};
    use serde_json::json;
    use std::sync::Arc;

    async fn context_for(task: Task) -> (IsolationLayer, IsolatedContext) {
        let store = Arc::new(MemoryArtifactStore::new().with_file("src/api.rs", "fn api() {}\n"));
        let layer = IsolationLayer::new(store);
        let mut contexts = layer.create_batch(&[task]).await.unwrap();
        let context = contexts.remove(0);
        (layer, context)
    }

    #[tokio::test]
    async fn test_apply_worker_output_writes_and_deletes() {
        let task = Task::new("T1", "api").with_file_scope(["src/**"]);
        let (_layer, mut context) = context_for(task).await;

        let response = AgentResponse::success("done").with_structured(json!({
            "files": [
                {"path": "src/new.rs", "content": "fn new() {}\n"},
                {"path": "src/api.rs", "deleted": true}
            ]
        }));
        apply_worker_output(&mut context, "claude", &response)
            .await
            .unwrap();

        assert_eq!(context.read("src/new.rs"), Some("fn new() {}\n"));
        assert_eq!(context.read("src/api.rs"), None);
        assert_eq!(context.changed_files(), vec!["src/api.rs", "src/new.rs"]);
    }

    #[tokio::test]
    async fn test_out_of_scope_write_is_malformed_output() {
        let task = Task::new("T1", "api").with_file_scope(["src/**"]);
        let (_layer, mut context) = context_for(task).await;

        let response = AgentResponse::success("done").with_structured(json!({
            "files": [{"path": "Cargo.toml", "content": "[package]"}]
        }));
        let err = apply_worker_output(&mut context, "claude", &response)
            .await
            .unwrap_err();
        assert!(matches!(err, KeelError::MalformedOutput { .. }));
        assert!(context.changed_files().is_empty());
    }

    #[tokio::test]
    async fn test_check_worker_output_rejects_before_touching_context() {
        let task = Task::new("T1", "api").with_file_scope(["src/**"]);
        let (_layer, context) = context_for(task).await;

        let not_a_list = AgentResponse::success("done").with_structured(json!({"files": "src/a.rs"}));
        let escaping = AgentResponse::success("done").with_structured(json!({
            "files": [{"path": "../outside.rs", "content": "x"}]
        }));
        let no_content = AgentResponse::success("done").with_structured(json!({
            "files": [{"path": "src/a.rs"}]
        }));
        for response in [not_a_list, escaping, no_content] {
            let err = check_worker_output(&context, "claude", &response).unwrap_err();
            assert!(matches!(err, KeelError::MalformedOutput { .. }), "{:?}", err);
        }

        let fine = AgentResponse::success("done").with_structured(json!({
            "files": [{"path": "src/a.rs", "content": "fn a() {}\n"}]
        }));
        check_worker_output(&context, "claude", &fine).unwrap();
        check_worker_output(&context, "claude", &AgentResponse::success("prose")).unwrap();
        assert!(context.changes().is_empty());
    }

    #[tokio::test]
    async fn test_plain_response_changes_nothing() {
        let (_layer, mut context) = context_for(Task::new("T1", "api")).await;
        apply_worker_output(&mut context, "claude", &AgentResponse::success("no edits"))
            .await
            .unwrap();
        assert!(context.changes().is_empty());
    }

    #[test]
    fn test_keep_worst_prefers_abort() {
        let mut stop = None;
        keep_worst(
            &mut stop,
            PhaseVerdict::Escalate(EscalationRequest::new(Phase::Implementation, "conflict")),
        );
        keep_worst(&mut stop, PhaseVerdict::Abort("fatal".to_string()));
        keep_worst(&mut stop, PhaseVerdict::Retry(Vec::new()));
        assert!(matches!(stop, Some(PhaseVerdict::Abort(_))));
    }

    #[test]
    fn test_worker_prompt_mentions_scope_and_criteria() {
        let task = Task::new("T1", "Add login")
            .with_file_scope(["src/auth/**"])
            .with_acceptance_criteria(["rejects bad passwords"]);
        let prompt = worker_prompt(&task);
        assert!(prompt.contains("T1: Add login"));
        assert!(prompt.contains("src/auth/**"));
        assert!(prompt.contains("- rejects bad passwords"));
    }
}
