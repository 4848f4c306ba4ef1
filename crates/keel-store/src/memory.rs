//! In-memory checkpoint store for tests and dry runs

use async_trait::async_trait;
use keel_core::{KeelError, Result, WorkflowState};
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use crate::checkpoint::{check_monotonic, Checkpoint, CheckpointStore, CheckpointSummary};

/// Keeps serialized records so a load goes through the same decode path as disk
#[derive(Default)]
pub struct MemoryCheckpointStore {
    records: Mutex<BTreeMap<u64, Vec<u8>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    fn decode(bytes: &[u8]) -> Result<Checkpoint> {
        let checkpoint: Checkpoint = serde_json::from_slice(bytes)?;
        checkpoint.verify()?;
        Ok(checkpoint)
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, state: &WorkflowState) -> Result<u64> {
        let mut records = self.records.lock().await;
        let latest = records.keys().next_back().copied();
        check_monotonic(latest, state.sequence)?;

        let checkpoint = Checkpoint::seal(state)?;
        records.insert(checkpoint.sequence, serde_json::to_vec(&checkpoint)?);
        Ok(checkpoint.sequence)
    }

    async fn load_latest(&self) -> Result<Option<WorkflowState>> {
        let records = self.records.lock().await;
        match records.values().next_back() {
            Some(bytes) => Ok(Some(Self::decode(bytes)?.state)),
            None => Ok(None),
        }
    }

    async fn load(&self, sequence: u64) -> Result<Checkpoint> {
        let records = self.records.lock().await;
        let bytes = records.get(&sequence).ok_or_else(|| {
            KeelError::Checkpoint(format!("no checkpoint with sequence {}", sequence))
        })?;
        Self::decode(bytes)
    }

    async fn list(&self) -> Result<Vec<CheckpointSummary>> {
        let records = self.records.lock().await;
        records
            .values()
            .map(|bytes| Self::decode(bytes).map(|c| c.summary()))
            .collect()
    }

    async fn latest_sequence(&self) -> Result<Option<u64>> {
        Ok(self.records.lock().await.keys().next_back().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_roundtrip() {
        let store = MemoryCheckpointStore::new();
        assert!(store.load_latest().await.unwrap().is_none());

        let mut state = WorkflowState::new("export");
        state.sequence = 1;
        store.save(&state).await.unwrap();
        state.sequence = 2;
        state.plan_artifact = Some("plan v2".to_string());
        store.save(&state).await.unwrap();

        assert_eq!(store.load_latest().await.unwrap().unwrap(), state);
        assert_eq!(store.len().await, 2);
        assert!(store.load(1).await.unwrap().state.plan_artifact.is_none());
    }

    #[tokio::test]
    async fn test_memory_rejects_stale_sequence() {
        let store = MemoryCheckpointStore::new();
        let mut state = WorkflowState::new("export");
        state.sequence = 5;
        store.save(&state).await.unwrap();
        state.sequence = 5;
        assert!(store.save(&state).await.is_err());
        assert_eq!(store.latest_sequence().await.unwrap(), Some(5));
    }
}
