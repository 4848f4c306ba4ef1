//! # keel-orchestrator
//!
//! The workflow engine and everything it coordinates.
//!
//! This crate provides:
//! - [`WorkflowEngine`], the single writer of workflow state, driving the
//!   phase pipeline with a checkpoint around every phase
//! - Pure routing ([`route`]) and fan-out/fan-in with a max-severity reducer
//! - Dependency-aware scheduling and complexity-driven task splitting
//! - Parallel review with weighted conflict resolution
//! - Error classification, retry budgets, fallback agents and circuit breaking
//! - Isolated per-task contexts with single-writer integration

mod complexity;
mod consensus;
mod dispatch;
mod engine;
mod escalation;
mod fan_out;
mod implementation;
mod isolation;
mod phases;
mod recovery;
mod report;
mod review;
mod scheduler;
mod state_machine;

pub use complexity::{apply_splits, plan_split, SplitPlan, SplitStrategy};
pub use consensus::{resolve, role_weight, ApprovalPolicy, TaskClassifier, WeightedVerdict};
pub use dispatch::AgentDispatcher;
pub use engine::{RunOutcome, WorkflowEngine};
pub use escalation::{DeferredEscalation, EscalationHandler, ScriptedEscalation};
pub use fan_out::{fan_out, reduce, reduce_checks, BranchOutcome, BranchResult, CheckResult};
pub use isolation::{
    changed_lines, ArtifactStore, ConflictReport, DirectoryArtifactStore, FileChange, FileConflict,
    IntegrationResult, IsolatedContext, IsolationLayer, LineRange, MemoryArtifactStore,
};
pub use recovery::{RecoveryAction, RecoveryManager};
pub use report::{render_status, write_status};
pub use review::{ReviewCoordinator, ReviewOutcome, ReviewRequest};
pub use scheduler::{compute_available, detect_cycles, ContainsId, Signal, Stall, TaskScheduler};
pub use state_machine::{route, Transition};
