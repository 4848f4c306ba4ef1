//! Configuration management for Keel
//!
//! Repository-level settings live in `.keel/config.toml`. Every field has a
//! default, so a partial file (or no file at all) is valid.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::review::ReviewerRole;
use crate::{KeelError, Result};

/// Repository-level Keel configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeelConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub review: ReviewConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    #[serde(default)]
    pub admission: AdmissionConfig,

    #[serde(default)]
    pub agents: AgentsConfig,

    #[serde(default)]
    pub paths: PathsConfig,
}

/// Phase loop limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Retries of a phase without `continue` before escalation is forced
    #[serde(default = "default_max_phase_retries")]
    pub max_phase_retries: u32,

    #[serde(default = "default_phase_timeout_secs")]
    pub phase_timeout_secs: u64,

    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,

    /// Complexity at or above which a task is split
    #[serde(default = "default_complexity_threshold")]
    pub complexity_threshold: f64,

    #[serde(default = "default_max_parallel_workers")]
    pub max_parallel_workers: usize,

    #[serde(default = "default_error_log_limit")]
    pub error_log_limit: usize,
}

/// Conflict resolution strategy for reviewer disagreement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStrategy {
    #[default]
    Weighted,
    Conservative,
    Escalate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewConfig {
    #[serde(default)]
    pub strategy: ResolutionStrategy,

    /// Score spread beyond which two verdicts count as disagreeing
    #[serde(default = "default_score_tolerance")]
    pub score_tolerance: f64,

    /// Weighted approval share must clear 0.5 by this much to settle a split
    #[serde(default = "default_weight_margin")]
    pub weight_margin: f64,

    #[serde(default = "default_review_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_validation_min_score")]
    pub validation_min_score: f64,

    #[serde(default = "default_verification_min_score")]
    pub verification_min_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_max_transient_retries")]
    pub max_transient_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Fraction of the delay added or removed at random
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Consecutive failures inside the window that trip an agent's breaker
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,

    #[serde(default = "default_breaker_window_secs")]
    pub breaker_window_secs: u64,

    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,
}

/// Sliding-window budget for one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionLimits {
    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: u32,

    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    #[serde(default)]
    pub tokens_per_window: Option<u64>,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

/// Shared admission limits plus per-agent overrides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: u32,

    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    #[serde(default)]
    pub tokens_per_window: Option<u64>,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Per-agent overrides keyed by agent id
    #[serde(default)]
    pub agents: BTreeMap<String, AdmissionLimits>,
}

/// A reviewer slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewerConfig {
    pub id: String,
    #[serde(default)]
    pub role: ReviewerRole,
}

/// Agent CLI brand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentBrand {
    Claude,
    Codex,
    Gemini,
}

impl AgentBrand {
    pub fn default_program(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: String,
    pub brand: AgentBrand,
    /// Executable, defaults to the brand's CLI name
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

impl AgentDefinition {
    pub fn program(&self) -> &str {
        self.program
            .as_deref()
            .unwrap_or_else(|| self.brand.default_program())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default = "default_planner")]
    pub planner: String,

    #[serde(default = "default_worker")]
    pub worker: String,

    #[serde(default = "default_reviewers")]
    pub reviewers: Vec<ReviewerConfig>,

    /// Backup agent per primary agent id
    #[serde(default = "default_fallbacks")]
    pub fallbacks: BTreeMap<String, String>,

    #[serde(default = "default_definitions")]
    pub definitions: Vec<AgentDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_checkpoints_dir")]
    pub checkpoints: PathBuf,

    #[serde(default = "default_contexts_dir")]
    pub contexts: PathBuf,

    #[serde(default = "default_artifact_root")]
    pub artifact_root: PathBuf,

    #[serde(default = "default_status_report")]
    pub status_report: PathBuf,
}

// Default value providers
fn default_max_phase_retries() -> u32 {
    3
}

fn default_phase_timeout_secs() -> u64 {
    3600
}

fn default_agent_timeout_secs() -> u64 {
    900
}

fn default_complexity_threshold() -> f64 {
    5.0
}

fn default_max_parallel_workers() -> usize {
    4
}

fn default_error_log_limit() -> usize {
    100
}

fn default_score_tolerance() -> f64 {
    3.0
}

fn default_weight_margin() -> f64 {
    0.15
}

fn default_review_timeout_secs() -> u64 {
    600
}

fn default_validation_min_score() -> f64 {
    6.0
}

fn default_verification_min_score() -> f64 {
    7.0
}

fn default_max_transient_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.2
}

fn default_breaker_threshold() -> u32 {
    3
}

fn default_breaker_window_secs() -> u64 {
    300
}

fn default_breaker_cooldown_secs() -> u64 {
    60
}

fn default_requests_per_window() -> u32 {
    50
}

fn default_window_secs() -> u64 {
    60
}

fn default_backoff_base_ms() -> u64 {
    250
}

fn default_backoff_max_ms() -> u64 {
    10_000
}

fn default_planner() -> String {
    "claude".to_string()
}

fn default_worker() -> String {
    "claude".to_string()
}

fn default_reviewers() -> Vec<ReviewerConfig> {
    vec![
        ReviewerConfig {
            id: "codex".to_string(),
            role: ReviewerRole::Security,
        },
        ReviewerConfig {
            id: "gemini".to_string(),
            role: ReviewerRole::Architecture,
        },
    ]
}

fn default_fallbacks() -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    map.insert("claude".to_string(), "codex".to_string());
    map.insert("codex".to_string(), "claude".to_string());
    map.insert("gemini".to_string(), "claude".to_string());
    map
}

fn default_definitions() -> Vec<AgentDefinition> {
    [AgentBrand::Claude, AgentBrand::Codex, AgentBrand::Gemini]
        .into_iter()
        .map(|brand| AgentDefinition {
            id: brand.default_program().to_string(),
            brand,
            program: None,
            args: Vec::new(),
        })
        .collect()
}

fn default_checkpoints_dir() -> PathBuf {
    PathBuf::from(".keel/checkpoints")
}

fn default_contexts_dir() -> PathBuf {
    PathBuf::from(".keel/contexts")
}

fn default_artifact_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_status_report() -> PathBuf {
    PathBuf::from(".keel/status.md")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_phase_retries: default_max_phase_retries(),
            phase_timeout_secs: default_phase_timeout_secs(),
            agent_timeout_secs: default_agent_timeout_secs(),
            complexity_threshold: default_complexity_threshold(),
            max_parallel_workers: default_max_parallel_workers(),
            error_log_limit: default_error_log_limit(),
        }
    }
}

impl EngineConfig {
    pub fn phase_timeout(&self) -> Duration {
        Duration::from_secs(self.phase_timeout_secs)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            strategy: ResolutionStrategy::default(),
            score_tolerance: default_score_tolerance(),
            weight_margin: default_weight_margin(),
            timeout_secs: default_review_timeout_secs(),
            validation_min_score: default_validation_min_score(),
            verification_min_score: default_verification_min_score(),
        }
    }
}

impl ReviewConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_transient_retries: default_max_transient_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            breaker_threshold: default_breaker_threshold(),
            breaker_window_secs: default_breaker_window_secs(),
            breaker_cooldown_secs: default_breaker_cooldown_secs(),
        }
    }
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            requests_per_window: default_requests_per_window(),
            window_secs: default_window_secs(),
            tokens_per_window: None,
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            requests_per_window: default_requests_per_window(),
            window_secs: default_window_secs(),
            tokens_per_window: None,
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            agents: BTreeMap::new(),
        }
    }
}

impl AdmissionConfig {
    pub fn shared_limits(&self) -> AdmissionLimits {
        AdmissionLimits {
            requests_per_window: self.requests_per_window,
            window_secs: self.window_secs,
            tokens_per_window: self.tokens_per_window,
            backoff_base_ms: self.backoff_base_ms,
            backoff_max_ms: self.backoff_max_ms,
        }
    }

    /// Limits for an agent, falling back to the shared ones
    pub fn limits_for(&self, agent: &str) -> AdmissionLimits {
        self.agents
            .get(agent)
            .cloned()
            .unwrap_or_else(|| self.shared_limits())
    }
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            planner: default_planner(),
            worker: default_worker(),
            reviewers: default_reviewers(),
            fallbacks: default_fallbacks(),
            definitions: default_definitions(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            checkpoints: default_checkpoints_dir(),
            contexts: default_contexts_dir(),
            artifact_root: default_artifact_root(),
            status_report: default_status_report(),
        }
    }
}

impl PathsConfig {
    /// Resolve every relative path against the repository root
    pub fn resolve(&self, repo_root: &Path) -> PathsConfig {
        let join = |p: &PathBuf| {
            if p.is_absolute() {
                p.clone()
            } else {
                repo_root.join(p)
            }
        };
        PathsConfig {
            checkpoints: join(&self.checkpoints),
            contexts: join(&self.contexts),
            artifact_root: join(&self.artifact_root),
            status_report: join(&self.status_report),
        }
    }
}

impl KeelConfig {
    pub const CONFIG_PATH: &'static str = ".keel/config.toml";

    /// Load configuration from `.keel/config.toml` or use defaults
    pub fn load_or_default(repo_root: &Path) -> Result<Self> {
        let config_path = repo_root.join(Self::CONFIG_PATH);

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Self::parse(&content)
        } else {
            Ok(Self::default())
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| KeelError::Config(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write default configuration to `.keel/config.toml`
    pub fn write_default(repo_root: &Path) -> Result<PathBuf> {
        let config_path = repo_root.join(Self::CONFIG_PATH);
        if let Some(dir) = config_path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| KeelError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&config_path, content)?;
        Ok(config_path)
    }

    /// Reject values no run could work with
    pub fn validate(&self) -> Result<()> {
        if self.agents.reviewers.is_empty() {
            return Err(KeelError::Config("at least one reviewer is required".into()));
        }
        if self.admission.requests_per_window == 0
            || self
                .admission
                .agents
                .values()
                .any(|l| l.requests_per_window == 0)
        {
            return Err(KeelError::Config(
                "requests_per_window must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.recovery.jitter) {
            return Err(KeelError::Config("jitter must be within 0.0-1.0".into()));
        }
        if !(0.0..0.5).contains(&self.review.weight_margin) {
            return Err(KeelError::Config(
                "weight_margin must be within 0.0-0.5".into(),
            ));
        }
        Ok(())
    }

    pub fn definition(&self, agent: &str) -> Option<&AgentDefinition> {
        self.agents.definitions.iter().find(|d| d.id == agent)
    }
}
