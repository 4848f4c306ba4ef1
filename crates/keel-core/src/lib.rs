//! # keel-core
//!
//! Core types for the Keel workflow orchestration engine.
//!
//! Keel drives non-deterministic agents through a fixed phase pipeline
//! (prerequisites, planning, validation, implementation, verification,
//! completion) and keeps the run deterministic and resumable by routing every
//! state change through a single checkpointed [`WorkflowState`].
//!
//! ## Ownership
//!
//! - The engine is the only writer of `WorkflowState`
//! - Schedulers and reviewers read snapshots and return a [`StateDelta`]
//! - Retry budgets live in the state, so they survive restarts

mod error;
mod escalation;
mod review;
mod state;
mod types;

pub mod config;
pub mod fail_open;

pub use config::KeelConfig;
pub use error::{ErrorContext, ErrorKind, KeelError, Result};
pub use escalation::{EscalationRequest, HumanDecision};
pub use review::*;
pub use state::*;
pub use types::*;
