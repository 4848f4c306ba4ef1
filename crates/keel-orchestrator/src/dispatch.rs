//! Single path for every agent call
//!
//! Circuit check, admission, the call under its timeout, and breaker
//! bookkeeping happen here so the engine and the review coordinator only
//! see one `invoke`.

use keel_agent::{
    AdmissionController, AgentRegistry, AgentRequest, AgentResponse, Constraints, InvokeStatus,
};
use keel_core::{KeelError, Result};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::recovery::RecoveryManager;

pub struct AgentDispatcher {
    registry: AgentRegistry,
    admission: AdmissionController,
    recovery: Arc<RecoveryManager>,
}

impl AgentDispatcher {
    pub fn new(
        registry: AgentRegistry,
        admission: AdmissionController,
        recovery: Arc<RecoveryManager>,
    ) -> Self {
        Self {
            registry,
            admission,
            recovery,
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn recovery(&self) -> &RecoveryManager {
        &self.recovery
    }

    /// Invoke `agent_id`, waiting for admission and honoring the circuit
    ///
    /// A `failed` status from the agent is returned as `KeelError::Agent`.
    /// A clarification request is a successful call.
    pub async fn invoke(
        &self,
        agent_id: &str,
        request: &AgentRequest,
        constraints: &Constraints,
    ) -> Result<AgentResponse> {
        self.invoke_checked(agent_id, request, constraints, |_| Ok(()))
            .await
    }

    /// [`Self::invoke`], with `check` deciding whether a successful response
    /// is usable
    ///
    /// A rejected response counts against the agent's circuit like any other
    /// failure. Clarification requests are not checked.
    pub async fn invoke_checked<F>(
        &self,
        agent_id: &str,
        request: &AgentRequest,
        constraints: &Constraints,
        check: F,
    ) -> Result<AgentResponse>
    where
        F: FnOnce(&AgentResponse) -> Result<()>,
    {
        let breakers = self.recovery.breakers();
        let breaker = breakers.get(agent_id);
        if !breaker.can_execute() {
            return Err(KeelError::CircuitOpen {
                agent: agent_id.to_string(),
                retry_after_ms: breaker.time_until_retry().as_millis() as u64,
            });
        }

        let agent = self.registry.get(agent_id)?;
        let permit = self
            .admission
            .acquire(agent_id, request.estimated_tokens())
            .await?;
        debug!(
            agent = %agent_id,
            request_id = %request.request_id,
            phase = %request.phase,
            tokens = permit.tokens,
            waited_ms = permit.waited.as_millis() as u64,
            "invoking agent"
        );

        let call = agent.invoke(request, constraints);
        let result = match tokio::time::timeout(constraints.timeout, call).await {
            Ok(Ok(response)) if response.status == InvokeStatus::Failed => Err(KeelError::Agent(
                format!("{} reported failure: {}", agent_id, response.artifact),
            )),
            Ok(Ok(response)) if response.status == InvokeStatus::Success => {
                check(&response).map(|()| response)
            }
            Ok(result) => result,
            Err(_) => Err(KeelError::AgentTimeout {
                agent: agent_id.to_string(),
                timeout_ms: constraints.timeout.as_millis() as u64,
            }),
        };

        match &result {
            Ok(_) => breakers.record_success(agent_id),
            Err(e) => {
                warn!(
                    agent = %agent_id,
                    request_id = %request.request_id,
                    error = %e,
                    "agent call failed"
                );
                breakers.record_failure(agent_id);
            }
        }
        result
    }
}
