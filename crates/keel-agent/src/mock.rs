//! Scripted agent for tests

use async_trait::async_trait;
use keel_core::{KeelError, Result, ReviewVerdict};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::agent::Agent;
use crate::types::{AgentRequest, AgentResponse, Constraints};

/// One scripted result
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Respond(AgentResponse),
    /// Fails with `KeelError::AgentTimeout`
    Timeout,
    /// Fails with `KeelError::Agent`
    Error(String),
    /// Fails with `KeelError::MalformedOutput`
    Malformed(String),
}

/// Mock agent that replays scripted outcomes in order
///
/// Once the script is exhausted every call returns the default outcome.
pub struct MockAgent {
    id: String,
    script: Mutex<VecDeque<MockOutcome>>,
    default: MockOutcome,
    delay: Option<Duration>,
    calls: AtomicUsize,
    requests: Mutex<Vec<AgentRequest>>,
}

impl MockAgent {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            script: Mutex::new(VecDeque::new()),
            default: MockOutcome::Respond(AgentResponse::success("ok")),
            delay: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A reviewer that always returns `verdict`
    pub fn reviewer(id: impl Into<String>, verdict: ReviewVerdict) -> Self {
        Self::new(id).with_default(MockOutcome::Respond(AgentResponse::verdict(&verdict)))
    }

    pub fn with_outcome(mut self, outcome: MockOutcome) -> Self {
        self.script.get_mut().push_back(outcome);
        self
    }

    pub fn with_response(self, response: AgentResponse) -> Self {
        self.with_outcome(MockOutcome::Respond(response))
    }

    pub fn with_verdict(self, verdict: ReviewVerdict) -> Self {
        self.with_response(AgentResponse::verdict(&verdict))
    }

    pub fn with_default(mut self, outcome: MockOutcome) -> Self {
        self.default = outcome;
        self
    }

    /// Sleep before answering (tokio time, so paused-clock tests stay instant)
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl Agent for MockAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(
        &self,
        request: &AgentRequest,
        _constraints: &Constraints,
    ) -> Result<AgentResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().await.push(request.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let outcome = self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| self.default.clone());

        match outcome {
            MockOutcome::Respond(response) => Ok(response),
            MockOutcome::Timeout => Err(KeelError::AgentTimeout {
                agent: self.id.clone(),
                timeout_ms: 0,
            }),
            MockOutcome::Error(message) => Err(KeelError::Agent(message)),
            MockOutcome::Malformed(detail) => Err(KeelError::MalformedOutput {
                agent: self.id.clone(),
                detail,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentRole, InvokeStatus};
    use keel_core::Phase;

    #[tokio::test]
    async fn test_mock_replays_script_then_default() {
        let agent = MockAgent::new("claude")
            .with_outcome(MockOutcome::Timeout)
            .with_response(AgentResponse::failed("lint errors"));
        let request = AgentRequest::new(AgentRole::Worker, Phase::Implementation, "do it");
        let constraints = Constraints::default();

        assert!(matches!(
            agent.invoke(&request, &constraints).await,
            Err(KeelError::AgentTimeout { .. })
        ));
        let second = agent.invoke(&request, &constraints).await.unwrap();
        assert_eq!(second.status, InvokeStatus::Failed);
        let third = agent.invoke(&request, &constraints).await.unwrap();
        assert_eq!(third.status, InvokeStatus::Success);

        assert_eq!(agent.calls(), 3);
        assert_eq!(agent.requests().await.len(), 3);
    }
}
