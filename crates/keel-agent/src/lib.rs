//! # keel-agent
//!
//! The boundary between the engine and the external agents it drives.
//!
//! - [`Agent`] is the single interface the engine and reviewers depend on;
//!   Claude, Codex and Gemini CLIs each get a small adapter
//! - [`AgentRegistry`] is built per run and owns the fallback map
//! - [`AdmissionController`] enforces per-agent sliding-window budgets
//! - [`CircuitBreaker`] stops calling an agent that keeps failing
//! - [`MockAgent`] replays scripted outcomes for tests

mod admission;
mod agent;
mod circuit_breaker;
mod mock;
mod registry;
mod types;

pub use admission::{AdmissionController, AdmissionStats, Permit};
pub use agent::{
    build_agent, parse_output, Agent, ClaudeAgent, CodexAgent, GeminiAgent, ProcessOutput,
    ProcessRunner,
};
pub use circuit_breaker::{BreakerRegistry, CircuitBreaker, CircuitState};
pub use mock::{MockAgent, MockOutcome};
pub use registry::AgentRegistry;
pub use types::*;
