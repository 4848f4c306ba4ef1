//! Checkpoint persistence for Keel
//!
//! A checkpoint is an immutable, sequenced snapshot of [`WorkflowState`].
//! The store is the only source of truth for a run; anything human-facing is
//! rendered from the latest checkpoint on read.
//!
//! [`WorkflowState`]: keel_core::WorkflowState

mod checkpoint;
mod file;
mod memory;

pub use checkpoint::{content_hash, Checkpoint, CheckpointStore, CheckpointSummary};
pub use file::FileCheckpointStore;
pub use memory::MemoryCheckpointStore;
