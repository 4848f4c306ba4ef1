//! Checkpoint record and store interface

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::{KeelError, Phase, Result, WorkflowState};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One durable snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub sequence: u64,
    /// SHA-256 of the serialized state, hex encoded
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub state: WorkflowState,
}

impl Checkpoint {
    /// Seal a state into a checkpoint record
    pub fn seal(state: &WorkflowState) -> Result<Self> {
        Ok(Self {
            sequence: state.sequence,
            content_hash: content_hash(state)?,
            created_at: Utc::now(),
            state: state.clone(),
        })
    }

    /// Recompute the hash and compare it with the stored one
    pub fn verify(&self) -> Result<()> {
        let actual = content_hash(&self.state)?;
        if actual != self.content_hash {
            return Err(KeelError::CheckpointIntegrity {
                sequence: self.sequence,
                expected: self.content_hash.clone(),
                actual,
            });
        }
        if self.state.sequence != self.sequence {
            return Err(KeelError::Checkpoint(format!(
                "record {} holds state with sequence {}",
                self.sequence, self.state.sequence
            )));
        }
        Ok(())
    }

    pub fn summary(&self) -> CheckpointSummary {
        CheckpointSummary {
            sequence: self.sequence,
            phase: self.state.phase,
            content_hash: self.content_hash.clone(),
            created_at: self.created_at,
        }
    }
}

/// Listing entry, cheap to print
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub sequence: u64,
    pub phase: Phase,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Hash of the canonical serialized form of a state
pub fn content_hash(state: &WorkflowState) -> Result<String> {
    let bytes = serde_json::to_vec(state)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Durable, append-only checkpoint storage
///
/// `save` persists the state under `state.sequence`, which must be greater
/// than every sequence already stored. A record is either fully written or
/// absent; readers never see a partial one.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a state, returning the sequence it was stored under
    async fn save(&self, state: &WorkflowState) -> Result<u64>;

    /// The most recent state, if any checkpoint exists
    async fn load_latest(&self) -> Result<Option<WorkflowState>>;

    /// A specific checkpoint (point-in-time resume)
    async fn load(&self, sequence: u64) -> Result<Checkpoint>;

    /// All checkpoints, oldest first
    async fn list(&self) -> Result<Vec<CheckpointSummary>>;

    /// Highest stored sequence; a new run continues numbering after it
    async fn latest_sequence(&self) -> Result<Option<u64>> {
        Ok(self.list().await?.last().map(|c| c.sequence))
    }
}

pub(crate) fn check_monotonic(latest: Option<u64>, sequence: u64) -> Result<()> {
    match latest {
        Some(latest) if sequence <= latest => Err(KeelError::Checkpoint(format!(
            "sequence {} is not after latest checkpoint {}",
            sequence, latest
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_and_verify() {
        let mut state = WorkflowState::new("search");
        state.sequence = 4;
        let checkpoint = Checkpoint::seal(&state).unwrap();
        assert_eq!(checkpoint.sequence, 4);
        assert_eq!(checkpoint.content_hash.len(), 64);
        checkpoint.verify().unwrap();
    }

    #[test]
    fn test_verify_detects_tampering() {
        let mut state = WorkflowState::new("search");
        state.sequence = 1;
        let mut checkpoint = Checkpoint::seal(&state).unwrap();
        checkpoint.state.feature = "something else".to_string();

        let err = checkpoint.verify().unwrap_err();
        assert!(matches!(
            err,
            KeelError::CheckpointIntegrity { sequence: 1, .. }
        ));
    }

    #[test]
    fn test_monotonic_check() {
        assert!(check_monotonic(None, 0).is_ok());
        assert!(check_monotonic(Some(3), 4).is_ok());
        assert!(check_monotonic(Some(3), 3).is_err());
        assert!(check_monotonic(Some(3), 1).is_err());
    }
}
