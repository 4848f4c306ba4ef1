//! Human escalation boundary types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::types::{Phase, TaskId};

/// Everything a human needs to act on a stalled workflow
///
/// Persisted inside the workflow state so that `keel resume` can present it
/// after the process that raised it has exited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRequest {
    /// Phase the workflow was in when it escalated
    pub phase: Phase,
    #[serde(default)]
    pub task_id: Option<TaskId>,
    #[serde(default)]
    pub kind: Option<ErrorKind>,
    pub root_cause: String,
    #[serde(default)]
    pub attempted_remedies: Vec<String>,
    #[serde(default)]
    pub prior_attempts: u32,
    #[serde(default)]
    pub clarification_question: Option<String>,
    /// Failure output from the primary and fallback agents
    #[serde(default)]
    pub transcripts: Vec<String>,
    pub raised_at: DateTime<Utc>,
}

impl EscalationRequest {
    pub fn new(phase: Phase, root_cause: impl Into<String>) -> Self {
        Self {
            phase,
            task_id: None,
            kind: None,
            root_cause: root_cause.into(),
            attempted_remedies: Vec::new(),
            prior_attempts: 0,
            clarification_question: None,
            transcripts: Vec::new(),
            raised_at: Utc::now(),
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_remedy(mut self, remedy: impl Into<String>) -> Self {
        self.attempted_remedies.push(remedy.into());
        self
    }

    pub fn with_prior_attempts(mut self, attempts: u32) -> Self {
        self.prior_attempts = attempts;
        self
    }

    pub fn with_clarification(mut self, question: impl Into<String>) -> Self {
        self.clarification_question = Some(question.into());
        self
    }

    pub fn with_transcript(mut self, transcript: impl Into<String>) -> Self {
        self.transcripts.push(transcript.into());
        self
    }

    /// Decisions a human may choose from
    pub fn options(&self) -> Vec<&'static str> {
        let mut options = vec!["retry", "skip", "continue"];
        if self.clarification_question.is_some() {
            options.push("answer_clarification");
        }
        options.push("abort");
        options
    }
}

/// A human's answer to an escalation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "detail", rename_all = "snake_case")]
pub enum HumanDecision {
    /// Re-run the escalated phase with a fresh iteration and retry budget
    Retry,
    /// Drop the escalated task (or phase) and move on
    Skip,
    /// Accept the current result and advance
    Continue,
    /// Answer the pending clarification and re-run the phase
    AnswerClarification(String),
    /// Stop the workflow with a reason
    Abort(String),
}

impl HumanDecision {
    /// Parse a decision name plus optional free text from the CLI
    pub fn parse(name: &str, text: Option<String>) -> std::result::Result<Self, String> {
        match name.to_lowercase().replace('-', "_").as_str() {
            "retry" => Ok(Self::Retry),
            "skip" => Ok(Self::Skip),
            "continue" => Ok(Self::Continue),
            "answer" | "answer_clarification" => text
                .map(Self::AnswerClarification)
                .ok_or_else(|| "answer_clarification requires an answer".to_string()),
            "abort" => Ok(Self::Abort(
                text.unwrap_or_else(|| "aborted by operator".to_string()),
            )),
            other => Err(format!("Invalid decision: {}", other)),
        }
    }
}

impl std::fmt::Display for HumanDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retry => write!(f, "retry"),
            Self::Skip => write!(f, "skip"),
            Self::Continue => write!(f, "continue"),
            Self::AnswerClarification(_) => write!(f, "answer_clarification"),
            Self::Abort(_) => write!(f, "abort"),
        }
    }
}
