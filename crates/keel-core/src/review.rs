//! Review verdicts and resolution results

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Topic area a blocking issue is filed under
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicArea {
    Security,
    Architecture,
    Quality,
    Scalability,
    Testing,
}

impl TopicArea {
    pub const ALL: [TopicArea; 5] = [
        TopicArea::Security,
        TopicArea::Architecture,
        TopicArea::Quality,
        TopicArea::Scalability,
        TopicArea::Testing,
    ];
}

impl std::fmt::Display for TopicArea {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Security => write!(f, "security"),
            Self::Architecture => write!(f, "architecture"),
            Self::Quality => write!(f, "quality"),
            Self::Scalability => write!(f, "scalability"),
            Self::Testing => write!(f, "testing"),
        }
    }
}

/// Specialty of a configured reviewer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewerRole {
    Security,
    Architecture,
    #[default]
    General,
}

impl std::fmt::Display for ReviewerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Security => write!(f, "security"),
            Self::Architecture => write!(f, "architecture"),
            Self::General => write!(f, "general"),
        }
    }
}

impl std::str::FromStr for ReviewerRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "security" => Ok(Self::Security),
            "architecture" => Ok(Self::Architecture),
            "general" => Ok(Self::General),
            _ => Err(format!("Invalid reviewer role: {}", s)),
        }
    }
}

/// Task type inferred from task metadata, selects the weight profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Security,
    Architecture,
    Optimization,
    General,
}

impl TaskType {
    /// Topic whose weights decide the aggregate for this task type
    pub fn primary_topic(&self) -> TopicArea {
        match self {
            Self::Security => TopicArea::Security,
            Self::Architecture => TopicArea::Architecture,
            Self::Optimization => TopicArea::Scalability,
            Self::General => TopicArea::Quality,
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Security => write!(f, "security"),
            Self::Architecture => write!(f, "architecture"),
            Self::Optimization => write!(f, "optimization"),
            Self::General => write!(f, "general"),
        }
    }
}

/// A blocking issue raised by a reviewer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockingIssue {
    pub topic: TopicArea,
    pub description: String,
}

impl BlockingIssue {
    pub fn new(topic: TopicArea, description: impl Into<String>) -> Self {
        Self {
            topic,
            description: description.into(),
        }
    }
}

/// One reviewer's verdict on an artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewVerdict {
    pub reviewer: String,
    pub approve: bool,
    /// 0-10
    pub score: f64,
    #[serde(default)]
    pub blocking_issues: Vec<BlockingIssue>,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

impl ReviewVerdict {
    pub fn approve(reviewer: impl Into<String>, score: f64) -> Self {
        Self {
            reviewer: reviewer.into(),
            approve: true,
            score,
            blocking_issues: Vec::new(),
            strengths: Vec::new(),
            recommendations: Vec::new(),
        }
    }

    pub fn reject(reviewer: impl Into<String>, score: f64) -> Self {
        Self {
            approve: false,
            ..Self::approve(reviewer, score)
        }
    }

    pub fn with_issue(mut self, topic: TopicArea, description: impl Into<String>) -> Self {
        self.blocking_issues.push(BlockingIssue::new(topic, description));
        self
    }

    /// A security-tagged blocking issue; this can never be outvoted
    pub fn has_security_block(&self) -> bool {
        self.blocking_issues
            .iter()
            .any(|issue| issue.topic == TopicArea::Security)
    }

    pub fn has_blockers(&self) -> bool {
        !self.blocking_issues.is_empty()
    }
}

/// Merged decision across reviewers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergedDecision {
    Approved,
    NeedsChanges,
    Escalate,
}

impl std::fmt::Display for MergedDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approved => write!(f, "approved"),
            Self::NeedsChanges => write!(f, "needs_changes"),
            Self::Escalate => write!(f, "escalate"),
        }
    }
}

/// Disagreement between reviewers that weighting could not settle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewConflict {
    pub reviewers: Vec<String>,
    pub score_spread: f64,
    pub description: String,
}

/// Output of conflict resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionResult {
    pub decision: MergedDecision,
    pub task_type: TaskType,
    /// Weighted score per topic area (0-10)
    pub topic_scores: BTreeMap<TopicArea, f64>,
    /// Score on the task type's primary topic
    pub aggregate_score: f64,
    pub conflicts: Vec<ReviewConflict>,
    /// A security block forced the decision
    pub security_override: bool,
}

impl ResolutionResult {
    pub fn has_unresolved_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}
