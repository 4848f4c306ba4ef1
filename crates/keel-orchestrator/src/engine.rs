//! Workflow engine
//!
//! The engine is the single writer of [`WorkflowState`]. Every phase runs
//! between two checkpoints: one when it starts and one after its routing
//! decision is applied. Agent failures go through the [`RecoveryManager`]
//! with budgets kept in the state, so a restart never hands out fresh
//! retries.

use futures::future::join_all;
use keel_agent::{
    AdmissionController, AgentRegistry, AgentRequest, AgentResponse, Constraints, InvokeStatus,
};
use keel_core::fail_open::fail_open;
use keel_core::{
    retry_key, Clarification, ErrorContext, ErrorKind, ErrorLogEntry, EscalationRequest,
    HumanDecision, KeelConfig, KeelError, Phase, PhaseStatus, Result, RoutingDecision, StateDelta,
    Task, TaskId, TaskStatus, WorkflowState,
};
use keel_store::CheckpointStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::dispatch::AgentDispatcher;
use crate::escalation::{DeferredEscalation, EscalationHandler};
use crate::isolation::{ArtifactStore, IsolationLayer};
use crate::recovery::{RecoveryAction, RecoveryManager};
use crate::report::write_status;
use crate::review::ReviewCoordinator;
use crate::state_machine::{route, Transition};

/// How a call to `start` or `resume` ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    Aborted { reason: String },
    /// Checkpointed and waiting for `resume` with a decision
    AwaitingHuman(EscalationRequest),
}

/// Result of one phase body, before routing
#[derive(Debug, Clone)]
pub(crate) enum PhaseVerdict {
    Continue,
    /// Re-run the phase; the notes go to the agent on the next iteration
    Retry(Vec<String>),
    Escalate(EscalationRequest),
    Abort(String),
}

impl PhaseVerdict {
    pub(crate) fn decision(&self) -> RoutingDecision {
        match self {
            Self::Continue => RoutingDecision::Continue,
            Self::Retry(_) => RoutingDecision::Retry,
            Self::Escalate(_) => RoutingDecision::Escalate,
            Self::Abort(_) => RoutingDecision::Abort,
        }
    }
}

/// One agent call with its retry scope
#[derive(Debug, Clone)]
pub(crate) struct Call {
    /// Task id, or a phase-level name such as `plan`
    pub scope: String,
    pub agent: String,
    pub request: AgentRequest,
    pub constraints: Constraints,
}

/// What recovery made of a call
#[derive(Debug, Clone)]
pub(crate) enum CallOutcome {
    Success {
        agent: String,
        response: AgentResponse,
    },
    Clarification {
        task_id: Option<TaskId>,
        question: String,
    },
    Escalate(EscalationRequest),
    Abort(String),
}

impl CallOutcome {
    /// Verdict for a call that did not succeed
    pub(crate) fn into_verdict(self, phase: Phase) -> PhaseVerdict {
        match self {
            Self::Success { .. } => PhaseVerdict::Continue,
            Self::Clarification { task_id, question } => {
                let mut request = EscalationRequest::new(phase, "agent asked for clarification")
                    .with_clarification(question);
                if let Some(task_id) = task_id {
                    request = request.with_task(task_id);
                }
                PhaseVerdict::Escalate(request)
            }
            Self::Escalate(request) => PhaseVerdict::Escalate(request),
            Self::Abort(reason) => PhaseVerdict::Abort(reason),
        }
    }
}

/// Drives a feature through the phase pipeline
pub struct WorkflowEngine {
    pub(crate) config: KeelConfig,
    pub(crate) store: Arc<dyn CheckpointStore>,
    pub(crate) dispatcher: Arc<AgentDispatcher>,
    pub(crate) recovery: Arc<RecoveryManager>,
    pub(crate) reviews: ReviewCoordinator,
    pub(crate) isolation: IsolationLayer,
    escalation: Arc<dyn EscalationHandler>,
    status_report: Option<PathBuf>,
}

impl WorkflowEngine {
    pub fn new(
        config: KeelConfig,
        registry: AgentRegistry,
        store: Arc<dyn CheckpointStore>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Result<Self> {
        config.validate()?;
        let recovery = Arc::new(RecoveryManager::new(config.recovery.clone()));
        let admission = AdmissionController::new(config.admission.clone());
        let dispatcher = Arc::new(AgentDispatcher::new(registry, admission, recovery.clone()));
        let reviews = ReviewCoordinator::new(
            config.agents.reviewers.clone(),
            config.review.clone(),
            dispatcher.clone(),
        )?;

        Ok(Self {
            config,
            store,
            dispatcher,
            recovery,
            reviews,
            isolation: IsolationLayer::new(artifacts),
            escalation: Arc::new(DeferredEscalation),
            status_report: None,
        })
    }

    /// Answer escalations in-process instead of returning `AwaitingHuman`
    pub fn with_escalation_handler(mut self, handler: Arc<dyn EscalationHandler>) -> Self {
        self.escalation = handler;
        self
    }

    /// Rewrite a Markdown status report after every phase
    pub fn with_status_report(mut self, path: impl Into<PathBuf>) -> Self {
        self.status_report = Some(path.into());
        self
    }

    /// Materialize isolated contexts as directories, so CLI workers can edit them
    pub fn with_contexts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.isolation = self.isolation.with_contexts_dir(dir);
        self
    }

    pub fn recovery(&self) -> &RecoveryManager {
        &self.recovery
    }

    /// Latest checkpointed state, if a run exists
    pub async fn status(&self) -> Result<Option<WorkflowState>> {
        self.store.load_latest().await
    }

    /// Start a new run, optionally with a plan supplied up front
    pub async fn start(&self, feature: &str, tasks: Option<Vec<Task>>) -> Result<RunOutcome> {
        let mut state = WorkflowState::new(feature)
            .with_error_log_limit(self.config.engine.error_log_limit);
        if let Some(tasks) = tasks {
            state.replace_tasks(tasks)?;
        }
        // Sequences are shared by every run in the store
        if let Some(latest) = self.store.latest_sequence().await? {
            state.sequence = latest;
        }
        info!(run_id = %state.run_id, feature, tasks = state.tasks.len(), "starting workflow");

        self.checkpoint(&mut state).await?;
        self.drive(&mut state).await
    }

    /// Continue from the latest checkpoint
    ///
    /// A run parked in human escalation needs a decision; without one the
    /// pending request is returned again. Any other run picks up at the
    /// phase it was in, re-running it from the start.
    pub async fn resume(&self, decision: Option<HumanDecision>) -> Result<RunOutcome> {
        let mut state = self
            .store
            .load_latest()
            .await?
            .ok_or_else(|| KeelError::Checkpoint("no checkpoint to resume from".to_string()))?;
        info!(
            run_id = %state.run_id,
            phase = %state.phase,
            sequence = state.sequence,
            "resuming workflow"
        );

        if state.phase == Phase::HumanEscalation {
            match decision {
                Some(decision) => {
                    self.apply_decision(&mut state, decision)?;
                    self.checkpoint(&mut state).await?;
                }
                None => {
                    let request = pending_escalation(&state)?;
                    return Ok(RunOutcome::AwaitingHuman(request));
                }
            }
        } else if let Some(decision) = decision {
            warn!(%decision, phase = %state.phase, "no escalation pending, decision ignored");
        }

        self.drive(&mut state).await
    }

    async fn drive(&self, state: &mut WorkflowState) -> Result<RunOutcome> {
        loop {
            match state.phase {
                Phase::Completed => {
                    info!(run_id = %state.run_id, "workflow completed");
                    return Ok(RunOutcome::Completed);
                }
                Phase::Aborted => {
                    let reason = state.abort_reason.clone().unwrap_or_default();
                    warn!(run_id = %state.run_id, %reason, "workflow aborted");
                    return Ok(RunOutcome::Aborted { reason });
                }
                Phase::HumanEscalation => {
                    let request = pending_escalation(state)?;
                    match self.escalation.decide(&request).await? {
                        Some(decision) => {
                            self.apply_decision(state, decision)?;
                            self.checkpoint(state).await?;
                        }
                        None => {
                            info!(
                                run_id = %state.run_id,
                                phase = %request.phase,
                                cause = %request.root_cause,
                                "waiting for human decision"
                            );
                            return Ok(RunOutcome::AwaitingHuman(request));
                        }
                    }
                }
                phase => self.step(state, phase).await?,
            }
        }
    }

    async fn step(&self, state: &mut WorkflowState, phase: Phase) -> Result<()> {
        state.set_phase_status(phase, PhaseStatus::InProgress)?;
        self.checkpoint(state).await?;
        info!(
            run_id = %state.run_id,
            %phase,
            iteration = state.iteration(phase),
            "phase started"
        );

        let timeout = self.config.engine.phase_timeout();
        let verdict = match tokio::time::timeout(timeout, self.run_phase(state, phase)).await {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(e)) => verdict_for_error(phase, &e),
            Err(_) => {
                fail_open("cleanup_contexts", || self.isolation.cleanup_orphans()).await;
                PhaseVerdict::Escalate(
                    EscalationRequest::new(
                        phase,
                        format!("{} exceeded its {}s timeout", phase, timeout.as_secs()),
                    )
                    .with_kind(ErrorKind::Transient),
                )
            }
        };

        self.apply_verdict(state, phase, verdict)?;
        self.checkpoint(state).await?;
        if let Some(path) = &self.status_report {
            write_status(path, state).await;
        }
        Ok(())
    }

    async fn run_phase(&self, state: &mut WorkflowState, phase: Phase) -> Result<PhaseVerdict> {
        match phase {
            Phase::Prerequisites => self.run_prerequisites(state).await,
            Phase::Planning => self.run_planning(state).await,
            Phase::Validation => self.run_validation(state).await,
            Phase::Implementation => self.run_implementation(state).await,
            Phase::Verification => self.run_verification(state).await,
            Phase::Completion => self.run_completion(state).await,
            other => Err(KeelError::Phase(format!("{} has no phase body", other))),
        }
    }

    fn apply_verdict(
        &self,
        state: &mut WorkflowState,
        phase: Phase,
        verdict: PhaseVerdict,
    ) -> Result<()> {
        let retries = state.iteration(phase);
        let transition = route(
            phase,
            verdict.decision(),
            retries,
            self.config.engine.max_phase_retries,
        );
        state.last_decision = transition.decision();
        info!(run_id = %state.run_id, %phase, transition = ?transition, "routing");

        match transition {
            Transition::Advance { from, to } => {
                state.set_phase_status(from, PhaseStatus::Completed)?;
                state.phase = to;
            }
            Transition::Retry { phase, .. } => {
                if let PhaseVerdict::Retry(notes) = &verdict {
                    if !notes.is_empty() {
                        state.log_error(ErrorLogEntry::new(
                            phase,
                            None,
                            routing_context(notes.join("; "), retries),
                        ));
                    }
                }
                state.reopen_phase(phase);
            }
            Transition::Escalate { from, forced } => {
                state.set_phase_status(from, PhaseStatus::Blocked)?;
                let request = match verdict {
                    PhaseVerdict::Escalate(request) => request,
                    PhaseVerdict::Retry(notes) if forced => {
                        let mut request = EscalationRequest::new(
                            from,
                            format!("{} did not pass after {} retries", from, retries),
                        )
                        .with_prior_attempts(retries);
                        for note in notes {
                            request = request.with_remedy(note);
                        }
                        request
                    }
                    other => EscalationRequest::new(
                        from,
                        format!("unexpected escalation from {:?}", other.decision()),
                    ),
                };
                state.escalation = Some(request);
                state.phase = Phase::HumanEscalation;
            }
            Transition::Abort { from } => {
                state.set_phase_status(from, PhaseStatus::Failed)?;
                let reason = match verdict {
                    PhaseVerdict::Abort(reason) => reason,
                    _ => format!("{} aborted", from),
                };
                state.abort_reason = Some(reason);
                state.phase = Phase::Aborted;
            }
            Transition::Invalid { reason } => return Err(KeelError::InvalidTransition(reason)),
        }
        Ok(())
    }

    /// Apply a human decision to a run parked in escalation
    fn apply_decision(&self, state: &mut WorkflowState, decision: HumanDecision) -> Result<()> {
        let request = state
            .escalation
            .take()
            .ok_or_else(|| KeelError::Phase("no escalation is pending".to_string()))?;
        let phase = request.phase;
        info!(
            run_id = %state.run_id,
            %phase,
            task = ?request.task_id,
            %decision,
            "applying human decision"
        );
        state.phase = phase;
        self.recovery.breakers().reset_all();

        match (decision, request.task_id) {
            (HumanDecision::Abort(reason), _) => {
                state.set_phase_status(phase, PhaseStatus::Failed)?;
                state.abort_reason = Some(reason);
                state.phase = Phase::Aborted;
            }
            (HumanDecision::AnswerClarification(answer), task_id) => {
                state.clarifications.push(Clarification {
                    phase,
                    task_id,
                    question: request.clarification_question.unwrap_or_default(),
                    answer,
                    answered_at: chrono::Utc::now(),
                });
                state.release_phase(phase);
            }
            (HumanDecision::Retry, Some(task_id)) => {
                state.clear_retry(&retry_key(&task_id, phase));
                state.release_phase(phase);
            }
            (HumanDecision::Skip, Some(task_id)) => {
                if !state.completed_task_ids.contains(&task_id) && state.task(&task_id).is_some() {
                    state.apply(
                        StateDelta::new()
                            .with_task_status(task_id.clone(), TaskStatus::Blocked)
                            .with_retry_cleared(retry_key(&task_id, phase)),
                    )?;
                }
                state.release_phase(phase);
            }
            (HumanDecision::Continue, Some(task_id)) => {
                if state.task(&task_id).is_some() {
                    state.apply(
                        StateDelta::new()
                            .with_completed(task_id.clone())
                            .with_retry_cleared(retry_key(&task_id, phase)),
                    )?;
                }
                state.release_phase(phase);
            }
            (HumanDecision::Retry, None) => {
                state.reset_phase(phase);
                if phase == Phase::Planning {
                    // A retried plan comes from the planner, not the rejected one
                    state.replace_tasks(Vec::new())?;
                    state.plan_artifact = None;
                }
            }
            (HumanDecision::Skip | HumanDecision::Continue, None) => {
                state.set_phase_status(phase, PhaseStatus::Completed)?;
                state.phase = phase.next();
            }
        }
        Ok(())
    }

    /// Validate, then persist under the next sequence number
    pub(crate) async fn checkpoint(&self, state: &mut WorkflowState) -> Result<u64> {
        state.validate()?;
        let previous = state.sequence;
        state.sequence += 1;
        match self.store.save(state).await {
            Ok(sequence) => {
                debug!(sequence, phase = %state.phase, "checkpoint saved");
                Ok(sequence)
            }
            Err(e) => {
                state.sequence = previous;
                Err(e)
            }
        }
    }

    /// Run agent calls concurrently, applying recovery until each settles
    ///
    /// Every failure is counted against `scope@PHASE` in the state and
    /// checkpointed before the next attempt, so a crash mid-retry resumes
    /// with the budget already spent. `check` sees each successful response
    /// with its call index and agent; a rejection is handled like any other
    /// agent failure, fallback included. Outcomes are returned in call order.
    pub(crate) async fn invoke_with_recovery<F>(
        &self,
        state: &mut WorkflowState,
        phase: Phase,
        calls: Vec<Call>,
        check: F,
    ) -> Result<Vec<CallOutcome>>
    where
        F: Fn(usize, &str, &AgentResponse) -> Result<()>,
    {
        let mut outcomes: Vec<Option<CallOutcome>> = vec![None; calls.len()];
        let mut pending: Vec<(usize, Call, String)> = calls
            .into_iter()
            .enumerate()
            .map(|(index, call)| {
                let key = retry_key(&call.scope, phase);
                let agent = if state.retry_budget(&key).fallback_used {
                    self.dispatcher
                        .registry()
                        .fallback_for(&call.agent)
                        .unwrap_or(&call.agent)
                        .to_string()
                } else {
                    call.agent.clone()
                };
                (index, call, agent)
            })
            .collect();

        while !pending.is_empty() {
            let check = &check;
            let responses = join_all(pending.iter().map(|(index, call, agent)| {
                self.dispatcher
                    .invoke_checked(agent, &call.request, &call.constraints, move |response| {
                        check(*index, agent, response)
                    })
            }))
            .await;

            let mut next = Vec::new();
            let mut delay = Duration::ZERO;
            let mut failed = false;
            for ((index, call, agent), response) in pending.into_iter().zip(responses) {
                let key = retry_key(&call.scope, phase);
                let error = match response {
                    Ok(response) if response.status == InvokeStatus::NeedsClarification => {
                        outcomes[index] = Some(CallOutcome::Clarification {
                            task_id: call.request.task_id.clone(),
                            question: response.clarification.unwrap_or_default(),
                        });
                        continue;
                    }
                    Ok(response) => {
                        state.clear_retry(&key);
                        outcomes[index] = Some(CallOutcome::Success { agent, response });
                        continue;
                    }
                    Err(e) => e,
                };

                failed = true;
                let attempts = state.record_attempt(&key);
                let budget = state.retry_budget(&key);
                let context = ErrorContext::from_error(&error, agent.clone())
                    .with_retry_count(attempts)
                    .with_fallback_attempted(budget.fallback_used);
                state.log_error(ErrorLogEntry::new(
                    phase,
                    call.request.task_id.clone(),
                    context.clone(),
                ));

                let fallback = self
                    .dispatcher
                    .registry()
                    .fallback_for(&call.agent)
                    .map(str::to_string);
                match self.recovery.decide(&context, fallback.as_deref()) {
                    RecoveryAction::RetryAfter(wait) => {
                        delay = delay.max(wait);
                        next.push((index, call, agent));
                    }
                    RecoveryAction::Fallback(backup) => {
                        state.mark_fallback_used(&key);
                        next.push((index, call, backup));
                    }
                    RecoveryAction::Escalate(reason) => {
                        let request = self.escalation_for(state, phase, &call, &context, reason);
                        outcomes[index] = Some(CallOutcome::Escalate(request));
                    }
                    RecoveryAction::Abort(reason) => {
                        outcomes[index] = Some(CallOutcome::Abort(reason));
                    }
                }
            }

            if failed {
                self.checkpoint(state).await?;
            }
            if !next.is_empty() && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            pending = next;
        }

        outcomes
            .into_iter()
            .map(|outcome| {
                outcome.ok_or_else(|| KeelError::Other("agent call left without an outcome".into()))
            })
            .collect()
    }

    /// Single-call convenience over [`Self::invoke_with_recovery`]
    pub(crate) async fn invoke_one<F>(
        &self,
        state: &mut WorkflowState,
        phase: Phase,
        call: Call,
        check: F,
    ) -> Result<CallOutcome>
    where
        F: Fn(&str, &AgentResponse) -> Result<()>,
    {
        self.invoke_with_recovery(state, phase, vec![call], |_, agent, response| {
            check(agent, response)
        })
        .await?
            .pop()
            .ok_or_else(|| KeelError::Other("agent call returned no outcome".to_string()))
    }

    fn escalation_for(
        &self,
        state: &WorkflowState,
        phase: Phase,
        call: &Call,
        context: &ErrorContext,
        reason: String,
    ) -> EscalationRequest {
        let mut request = EscalationRequest::new(phase, reason)
            .with_kind(context.kind)
            .with_prior_attempts(context.retry_count);
        if let Some(task_id) = &call.request.task_id {
            request = request.with_task(task_id.clone());
        }
        if context.retry_count > 1 {
            request = request.with_remedy(format!("{} attempts with backoff", context.retry_count));
        }
        if context.fallback_attempted {
            if let Some(backup) = self.dispatcher.registry().fallback_for(&call.agent) {
                request = request.with_remedy(format!("fallback to {}", backup));
            }
        }

        let transcripts: Vec<String> = state
            .error_log
            .iter()
            .rev()
            .filter(|entry| entry.phase == phase && entry.task_id == call.request.task_id)
            .take(context.retry_count as usize)
            .map(|entry| format!("{}: {}", entry.context.component, entry.context.message))
            .collect();
        for transcript in transcripts.into_iter().rev() {
            request = request.with_transcript(transcript);
        }
        request
    }

    pub(crate) fn agent_constraints(&self) -> Constraints {
        Constraints::new(self.config.engine.agent_timeout())
    }
}

/// Notes recorded by the last routed retry of `phase`
pub(crate) fn retry_notes(state: &WorkflowState, phase: Phase) -> Vec<String> {
    state
        .error_log
        .iter()
        .rev()
        .find(|entry| entry.phase == phase && entry.context.component == "routing")
        .map(|entry| vec![entry.context.message.clone()])
        .unwrap_or_default()
}

/// Answered clarifications for a phase and, when given, one task
pub(crate) fn clarification_pairs(
    state: &WorkflowState,
    phase: Phase,
    task_id: Option<&str>,
) -> Vec<(String, String)> {
    state
        .clarifications_for(phase)
        .into_iter()
        .filter(|c| c.task_id.is_none() || c.task_id.as_deref() == task_id)
        .map(|c| (c.question.clone(), c.answer.clone()))
        .collect()
}

fn routing_context(message: String, retries: u32) -> ErrorContext {
    ErrorContext {
        kind: ErrorKind::AgentFailure,
        recoverable: true,
        retry_count: retries,
        fallback_attempted: false,
        component: "routing".to_string(),
        message,
    }
}

fn verdict_for_error(phase: Phase, error: &KeelError) -> PhaseVerdict {
    warn!(%phase, error = %error, kind = %error.kind(), "phase body failed");
    match error.kind() {
        ErrorKind::Fatal => PhaseVerdict::Abort(error.to_string()),
        kind => PhaseVerdict::Escalate(
            EscalationRequest::new(phase, error.to_string()).with_kind(kind),
        ),
    }
}

fn pending_escalation(state: &WorkflowState) -> Result<EscalationRequest> {
    state.escalation.clone().ok_or_else(|| {
        KeelError::Phase("workflow is in human escalation without a request".to_string())
    })
}
