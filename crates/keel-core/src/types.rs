//! Core type definitions for Keel workflows

use serde::{Deserialize, Serialize};

/// Task identifier as it appears in the plan
pub type TaskId = String;

/// Workflow phases, including the side states
///
/// Declaration order is the pipeline order, so `Ord` sorts phases the way a
/// run visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Prerequisites,
    Planning,
    Validation,
    Implementation,
    Verification,
    Completion,
    HumanEscalation,
    Aborted,
    Completed,
}

impl Phase {
    /// Phases that carry a body and a status entry
    pub const PIPELINE: [Phase; 6] = [
        Phase::Prerequisites,
        Phase::Planning,
        Phase::Validation,
        Phase::Implementation,
        Phase::Verification,
        Phase::Completion,
    ];

    /// Next phase on `continue`
    pub fn next(&self) -> Phase {
        match self {
            Self::Prerequisites => Self::Planning,
            Self::Planning => Self::Validation,
            Self::Validation => Self::Implementation,
            Self::Implementation => Self::Verification,
            Self::Verification => Self::Completion,
            Self::Completion => Self::Completed,
            // Side states have no successor on the main line
            Self::HumanEscalation | Self::Aborted | Self::Completed => *self,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Aborted | Self::Completed)
    }

    pub fn is_pipeline(&self) -> bool {
        Self::PIPELINE.contains(self)
    }

    /// Whether the phase ends with a fan-out/fan-in step
    pub fn fans_out(&self) -> bool {
        self.is_pipeline() && *self != Self::Implementation
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Prerequisites => "PREREQUISITES",
            Self::Planning => "PLANNING",
            Self::Validation => "VALIDATION",
            Self::Implementation => "IMPLEMENTATION",
            Self::Verification => "VERIFICATION",
            Self::Completion => "COMPLETION",
            Self::HumanEscalation => "HUMAN_ESCALATION",
            Self::Aborted => "ABORTED",
            Self::Completed => "COMPLETED",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().replace('-', "_").as_str() {
            "PREREQUISITES" => Ok(Self::Prerequisites),
            "PLANNING" => Ok(Self::Planning),
            "VALIDATION" => Ok(Self::Validation),
            "IMPLEMENTATION" => Ok(Self::Implementation),
            "VERIFICATION" => Ok(Self::Verification),
            "COMPLETION" => Ok(Self::Completion),
            "HUMAN_ESCALATION" => Ok(Self::HumanEscalation),
            "ABORTED" => Ok(Self::Aborted),
            "COMPLETED" => Ok(Self::Completed),
            _ => Err(format!("Invalid phase: {}", s)),
        }
    }
}

/// Status of a pipeline phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Blocked,
}

impl PhaseStatus {
    /// Whether moving from `self` to `to` walks backwards
    pub fn regresses_to(&self, to: PhaseStatus) -> bool {
        match self {
            Self::Completed => to != Self::Completed,
            Self::Failed | Self::Blocked => matches!(to, Self::Pending | Self::InProgress),
            Self::Pending | Self::InProgress => false,
        }
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Blocked => write!(f, "blocked"),
        }
    }
}

/// Task status
///
/// `Blocked` marks a task the workflow gave up on (retries exhausted or
/// skipped by a human); its dependents can never become available.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Blocked,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Blocked => write!(f, "blocked"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "in_progress" | "inprogress" => Ok(Self::InProgress),
            "completed" | "done" => Ok(Self::Completed),
            "blocked" => Ok(Self::Blocked),
            _ => Err(format!("Invalid status: {}", s)),
        }
    }
}

/// Task priority levels (lower discriminant runs first)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical = 0,
    High = 1,
    #[default]
    Medium = 2,
    Low = 3,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" | "0" => Ok(Self::Critical),
            "high" | "1" => Ok(Self::High),
            "medium" | "2" => Ok(Self::Medium),
            "low" | "3" => Ok(Self::Low),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}

/// Routing decision produced after a phase's fan-in
///
/// Variants are ordered by severity; the fan-in reducer takes the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingDecision {
    Continue,
    Retry,
    Escalate,
    Abort,
}

impl std::fmt::Display for RoutingDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Continue => write!(f, "continue"),
            Self::Retry => write!(f, "retry"),
            Self::Escalate => write!(f, "escalate"),
            Self::Abort => write!(f, "abort"),
        }
    }
}

/// Sub-score dimensions that can drive a split
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityDimension {
    FileScope,
    CrossFileCoupling,
    SemanticDifficulty,
}

/// Weighted task complexity (0-13)
///
/// Each sub-score is normalized to 0.0-1.0; the weights below sum to 13.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplexityScore {
    pub file_scope: f64,
    pub cross_file_coupling: f64,
    pub semantic_difficulty: f64,
    pub requirement_uncertainty: f64,
    pub context_budget_penalty: f64,
}

impl ComplexityScore {
    pub const FILE_SCOPE_WEIGHT: f64 = 3.0;
    pub const COUPLING_WEIGHT: f64 = 3.0;
    pub const SEMANTIC_WEIGHT: f64 = 3.0;
    pub const UNCERTAINTY_WEIGHT: f64 = 2.0;
    pub const CONTEXT_WEIGHT: f64 = 2.0;
    pub const MAX: f64 = 13.0;

    pub fn new(
        file_scope: f64,
        cross_file_coupling: f64,
        semantic_difficulty: f64,
        requirement_uncertainty: f64,
        context_budget_penalty: f64,
    ) -> Self {
        Self {
            file_scope,
            cross_file_coupling,
            semantic_difficulty,
            requirement_uncertainty,
            context_budget_penalty,
        }
    }

    /// Weighted total, clamped to 0-13
    pub fn total(&self) -> f64 {
        let total = Self::FILE_SCOPE_WEIGHT * unit(self.file_scope)
            + Self::COUPLING_WEIGHT * unit(self.cross_file_coupling)
            + Self::SEMANTIC_WEIGHT * unit(self.semantic_difficulty)
            + Self::UNCERTAINTY_WEIGHT * unit(self.requirement_uncertainty)
            + Self::CONTEXT_WEIGHT * unit(self.context_budget_penalty);
        total.clamp(0.0, Self::MAX)
    }

    /// Total in thousandths, for use as an ordering key
    pub fn total_millis(&self) -> u32 {
        (self.total() * 1000.0).round() as u32
    }

    /// The split-driving dimension with the largest weighted contribution
    ///
    /// Ties resolve in the order file scope, coupling, semantic difficulty.
    pub fn dominant(&self) -> ComplexityDimension {
        let candidates = [
            (
                ComplexityDimension::FileScope,
                Self::FILE_SCOPE_WEIGHT * unit(self.file_scope),
            ),
            (
                ComplexityDimension::CrossFileCoupling,
                Self::COUPLING_WEIGHT * unit(self.cross_file_coupling),
            ),
            (
                ComplexityDimension::SemanticDifficulty,
                Self::SEMANTIC_WEIGHT * unit(self.semantic_difficulty),
            ),
        ];

        let mut best = candidates[0];
        for candidate in &candidates[1..] {
            if candidate.1 > best.1 {
                best = *candidate;
            }
        }
        best.0
    }

    /// Scale the split-driving sub-scores for a child holding `share` of the work
    pub fn scaled(&self, share: f64) -> Self {
        let share = unit(share);
        Self {
            file_scope: self.file_scope * share,
            cross_file_coupling: self.cross_file_coupling * share,
            semantic_difficulty: self.semantic_difficulty * share,
            requirement_uncertainty: self.requirement_uncertainty,
            context_budget_penalty: self.context_budget_penalty * share,
        }
    }
}

fn unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// A unit of implementation work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    /// Ordered dependency ids
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub complexity: ComplexityScore,
    /// Glob patterns of the files this task may touch
    #[serde(default)]
    pub file_scope: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Id of the task this one was split from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_from: Option<TaskId>,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            dependencies: Vec::new(),
            status: TaskStatus::Pending,
            priority: Priority::default(),
            complexity: ComplexityScore::default(),
            file_scope: Vec::new(),
            acceptance_criteria: Vec::new(),
            split_from: None,
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_complexity(mut self, complexity: ComplexityScore) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_file_scope<I, S>(mut self, scope: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.file_scope = scope.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_acceptance_criteria<I, S>(mut self, criteria: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.acceptance_criteria = criteria.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_complete(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_pipeline_order() {
        let mut phase = Phase::Prerequisites;
        let mut visited = vec![phase];
        while !phase.is_terminal() {
            phase = phase.next();
            visited.push(phase);
        }
        assert_eq!(visited.len(), 7);
        assert_eq!(visited.last(), Some(&Phase::Completed));
        assert!(!Phase::Implementation.fans_out());
        assert!(Phase::Verification.fans_out());
        assert!(!Phase::HumanEscalation.fans_out());
    }

    #[test]
    fn test_phase_parse_roundtrip() {
        for phase in Phase::PIPELINE {
            assert_eq!(phase.to_string().parse::<Phase>().unwrap(), phase);
        }
        assert_eq!(
            "human-escalation".parse::<Phase>().unwrap(),
            Phase::HumanEscalation
        );
        assert!("deploy".parse::<Phase>().is_err());
    }

    #[test]
    fn test_phase_status_regression() {
        assert!(PhaseStatus::Completed.regresses_to(PhaseStatus::Pending));
        assert!(PhaseStatus::Blocked.regresses_to(PhaseStatus::InProgress));
        assert!(!PhaseStatus::InProgress.regresses_to(PhaseStatus::Completed));
        assert!(!PhaseStatus::Pending.regresses_to(PhaseStatus::InProgress));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::High < Priority::Medium);
        assert!(Priority::Medium < Priority::Low);
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
    }

    #[test]
    fn test_routing_severity() {
        assert!(RoutingDecision::Continue < RoutingDecision::Retry);
        assert!(RoutingDecision::Retry < RoutingDecision::Escalate);
        assert!(RoutingDecision::Escalate < RoutingDecision::Abort);
    }

    #[test]
    fn test_complexity_total_is_bounded() {
        let max = ComplexityScore::new(1.0, 1.0, 1.0, 1.0, 1.0);
        assert!((max.total() - 13.0).abs() < f64::EPSILON);

        let overflow = ComplexityScore::new(5.0, 2.0, 9.0, 1.5, f64::NAN);
        assert!(overflow.total() <= 13.0);
        assert!(ComplexityScore::default().total().abs() < f64::EPSILON);
    }

    #[test]
    fn test_complexity_dominant() {
        let files = ComplexityScore::new(0.9, 0.2, 0.3, 0.0, 0.0);
        assert_eq!(files.dominant(), ComplexityDimension::FileScope);

        let coupling = ComplexityScore::new(0.3, 0.8, 0.3, 1.0, 1.0);
        assert_eq!(coupling.dominant(), ComplexityDimension::CrossFileCoupling);

        let semantic = ComplexityScore::new(0.1, 0.1, 0.6, 0.0, 0.0);
        assert_eq!(semantic.dominant(), ComplexityDimension::SemanticDifficulty);

        // Ties go to file scope
        let tie = ComplexityScore::new(0.5, 0.5, 0.5, 0.0, 0.0);
        assert_eq!(tie.dominant(), ComplexityDimension::FileScope);
    }

    #[test]
    fn test_task_deserialize_with_defaults() {
        let json = r#"{"id": "T1", "title": "Add login", "dependencies": ["T0"]}"#;
        let task: Task = serde_json::from_str(json).unwrap();

        assert_eq!(task.id, "T1");
        assert_eq!(task.dependencies, vec!["T0".to_string()]);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, Priority::Medium);
        assert!(task.split_from.is_none());
    }
}
