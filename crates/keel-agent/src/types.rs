//! Type definitions for agent interactions

use keel_core::{KeelError, Phase, Result, ReviewVerdict, TaskId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// What the agent is being asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Planner,
    Worker,
    Reviewer,
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentRole::Planner => write!(f, "planner"),
            AgentRole::Worker => write!(f, "worker"),
            AgentRole::Reviewer => write!(f, "reviewer"),
        }
    }
}

/// One request to an external agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub request_id: String,
    pub role: AgentRole,
    pub phase: Phase,
    pub task_id: Option<TaskId>,
    pub prompt: String,
    /// Artifact under review or being revised
    pub artifact: Option<String>,
    /// Directory the agent works in (an isolated context for workers)
    pub workdir: Option<PathBuf>,
    /// Notes from earlier review rounds
    pub feedback: Vec<String>,
    /// Answered clarification questions, `(question, answer)`
    pub clarifications: Vec<(String, String)>,
}

impl AgentRequest {
    pub fn new(role: AgentRole, phase: Phase, prompt: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            role,
            phase,
            task_id: None,
            prompt: prompt.into(),
            artifact: None,
            workdir: None,
            feedback: Vec::new(),
            clarifications: Vec::new(),
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifact = Some(artifact.into());
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn with_feedback(mut self, feedback: Vec<String>) -> Self {
        self.feedback = feedback;
        self
    }

    pub fn with_clarifications(mut self, clarifications: Vec<(String, String)>) -> Self {
        self.clarifications = clarifications;
        self
    }

    /// Rough token estimate used for admission (4 bytes per token)
    pub fn estimated_tokens(&self) -> u64 {
        let mut bytes = self.prompt.len();
        bytes += self.artifact.as_ref().map_or(0, String::len);
        bytes += self.feedback.iter().map(String::len).sum::<usize>();
        bytes += self
            .clarifications
            .iter()
            .map(|(q, a)| q.len() + a.len())
            .sum::<usize>();
        (bytes as u64).div_ceil(4).max(1)
    }

    /// Full text sent to a CLI agent on stdin
    pub fn render(&self) -> String {
        let mut out = self.prompt.clone();
        if let Some(artifact) = &self.artifact {
            out.push_str("\n\n## Artifact\n\n");
            out.push_str(artifact);
        }
        if !self.feedback.is_empty() {
            out.push_str("\n\n## Feedback from previous review\n\n");
            for note in &self.feedback {
                out.push_str("- ");
                out.push_str(note);
                out.push('\n');
            }
        }
        if !self.clarifications.is_empty() {
            out.push_str("\n\n## Clarifications\n\n");
            for (question, answer) in &self.clarifications {
                out.push_str(&format!("Q: {}\nA: {}\n", question, answer));
            }
        }
        out
    }
}

/// Limits a single invocation runs under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraints {
    pub timeout: Duration,
    /// The agent must not modify files
    pub read_only: bool,
    pub max_tokens: Option<u64>,
}

impl Constraints {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            read_only: false,
            max_tokens: None,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

impl Default for Constraints {
    fn default() -> Self {
        Self::new(Duration::from_secs(900))
    }
}

/// Status reported by the agent itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvokeStatus {
    Success,
    Failed,
    NeedsClarification,
}

/// Token usage information
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Agent output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub status: InvokeStatus,
    #[serde(default)]
    pub artifact: String,
    #[serde(default)]
    pub structured: Option<serde_json::Value>,
    #[serde(default)]
    pub clarification: Option<String>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

impl AgentResponse {
    pub fn success(artifact: impl Into<String>) -> Self {
        Self {
            status: InvokeStatus::Success,
            artifact: artifact.into(),
            structured: None,
            clarification: None,
            usage: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: InvokeStatus::Failed,
            ..Self::success(message)
        }
    }

    pub fn needs_clarification(question: impl Into<String>) -> Self {
        Self {
            status: InvokeStatus::NeedsClarification,
            clarification: Some(question.into()),
            ..Self::success("")
        }
    }

    pub fn with_structured(mut self, value: serde_json::Value) -> Self {
        self.structured = Some(value);
        self
    }

    /// A reviewer response carrying its verdict as structured output
    pub fn verdict(verdict: &ReviewVerdict) -> Self {
        let value = serde_json::to_value(verdict).unwrap_or(serde_json::Value::Null);
        Self::success(format!("score {}", verdict.score)).with_structured(value)
    }

    /// Decode the structured output as a review verdict from `reviewer`
    pub fn parse_verdict(&self, reviewer: &str) -> Result<ReviewVerdict> {
        let value = self
            .structured
            .clone()
            .ok_or_else(|| KeelError::MalformedOutput {
                agent: reviewer.to_string(),
                detail: "no structured verdict".to_string(),
            })?;

        let mut verdict: ReviewVerdict =
            serde_json::from_value(value).map_err(|e| KeelError::MalformedOutput {
                agent: reviewer.to_string(),
                detail: e.to_string(),
            })?;

        if !(0.0..=10.0).contains(&verdict.score) {
            return Err(KeelError::MalformedOutput {
                agent: reviewer.to_string(),
                detail: format!("score {} outside 0-10", verdict.score),
            });
        }
        verdict.reviewer = reviewer.to_string();
        Ok(verdict)
    }
}
