//! Human escalation boundary
//!
//! An interactive front end implements [`EscalationHandler`]. Without one the
//! engine checkpoints the request and returns, and the decision arrives later
//! through `resume`.

use async_trait::async_trait;
use keel_core::{EscalationRequest, HumanDecision, Result};
use std::collections::VecDeque;
use std::sync::Mutex;

#[async_trait]
pub trait EscalationHandler: Send + Sync {
    /// Answer an escalation now, or `None` to leave the run waiting
    async fn decide(&self, request: &EscalationRequest) -> Result<Option<HumanDecision>>;
}

/// Leaves every escalation for a later `resume`
pub struct DeferredEscalation;

#[async_trait]
impl EscalationHandler for DeferredEscalation {
    async fn decide(&self, _request: &EscalationRequest) -> Result<Option<HumanDecision>> {
        Ok(None)
    }
}

/// Replays prepared decisions in order, then defers
#[derive(Default)]
pub struct ScriptedEscalation {
    decisions: Mutex<VecDeque<HumanDecision>>,
    seen: Mutex<Vec<EscalationRequest>>,
}

impl ScriptedEscalation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_decision(self, decision: HumanDecision) -> Self {
        self.decisions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(decision);
        self
    }

    /// Requests this handler was asked about
    pub fn requests(&self) -> Vec<EscalationRequest> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl EscalationHandler for ScriptedEscalation {
    async fn decide(&self, request: &EscalationRequest) -> Result<Option<HumanDecision>> {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        Ok(self
            .decisions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::Phase;

    #[tokio::test]
    async fn test_scripted_then_deferred() {
        let handler = ScriptedEscalation::new().with_decision(HumanDecision::Retry);
        let request = EscalationRequest::new(Phase::Validation, "reviewers split");

        assert_eq!(handler.decide(&request).await.unwrap(), Some(HumanDecision::Retry));
        assert_eq!(handler.decide(&request).await.unwrap(), None);
        assert_eq!(handler.requests().len(), 2);
        assert_eq!(DeferredEscalation.decide(&request).await.unwrap(), None);
    }
}
