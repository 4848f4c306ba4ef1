//! Unified error types for Keel

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for all Keel operations
#[derive(Error, Debug)]
pub enum KeelError {
    // Checkpoint errors
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Checkpoint {sequence} failed integrity check: expected {expected}, found {actual}")]
    CheckpointIntegrity {
        sequence: u64,
        expected: String,
        actual: String,
    },

    // Scheduling errors
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Dependency cycle detected: {0}")]
    DependencyCycle(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    // Agent errors
    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Agent {agent} timed out after {timeout_ms}ms")]
    AgentTimeout { agent: String, timeout_ms: u64 },

    #[error("Malformed output from agent {agent}: {detail}")]
    MalformedOutput { agent: String, detail: String },

    #[error("Circuit open for agent {agent} (retry in {retry_after_ms}ms)")]
    CircuitOpen { agent: String, retry_after_ms: u64 },

    #[error("Admission error: {0}")]
    Admission(String),

    // Isolation errors
    #[error("Isolation error: {0}")]
    Isolation(String),

    #[error("Integration conflict: {0}")]
    IntegrationConflict(String),

    // Review / workflow errors
    #[error("Review error: {0}")]
    Review(String),

    #[error("Phase error: {0}")]
    Phase(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Security block: {0}")]
    SecurityBlock(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl KeelError {
    /// Classify this error into the recovery taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AgentTimeout { .. } | Self::Io(_) => ErrorKind::Transient,
            Self::Agent(_)
            | Self::Admission(_)
            | Self::AgentNotFound(_)
            | Self::MalformedOutput { .. }
            | Self::CircuitOpen { .. }
            | Self::Serialization(_)
            | Self::Review(_) => ErrorKind::AgentFailure,
            Self::SecurityBlock(_) => ErrorKind::SecurityBlock,
            Self::Checkpoint(_)
            | Self::CheckpointIntegrity { .. }
            | Self::Scheduler(_)
            | Self::DependencyCycle(_)
            | Self::TaskNotFound(_)
            | Self::Isolation(_)
            | Self::IntegrationConflict(_)
            | Self::Phase(_)
            | Self::InvalidTransition(_)
            | Self::Config(_)
            | Self::Other(_) => ErrorKind::Fatal,
        }
    }
}

/// Result type alias using KeelError
pub type Result<T> = std::result::Result<T, KeelError>;

/// Failure classes driving recovery policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network/timeout class, retried locally with backoff
    Transient,
    /// The agent itself errored or produced unusable output
    AgentFailure,
    /// Security finding, always escalated
    SecurityBlock,
    /// Unrecoverable, aborts the workflow
    Fatal,
}

impl ErrorKind {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Transient | Self::AgentFailure)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::AgentFailure => write!(f, "agent_failure"),
            Self::SecurityBlock => write!(f, "security_block"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// Context attached to a failure when it reaches the recovery layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub kind: ErrorKind,
    pub recoverable: bool,
    /// Attempts already spent on this task/phase key (loaded from the checkpoint)
    pub retry_count: u32,
    /// Whether the backup agent has already been tried for this key
    pub fallback_attempted: bool,
    /// Component or agent the failure originated from
    pub component: String,
    pub message: String,
}

impl ErrorContext {
    pub fn from_error(error: &KeelError, component: impl Into<String>) -> Self {
        let kind = error.kind();
        Self {
            kind,
            recoverable: kind.is_recoverable(),
            retry_count: 0,
            fallback_attempted: false,
            component: component.into(),
            message: error.to_string(),
        }
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_fallback_attempted(mut self, attempted: bool) -> Self {
        self.fallback_attempted = attempted;
        self
    }
}
