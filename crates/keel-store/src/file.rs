//! File-backed checkpoint store
//!
//! Layout: one JSON record per checkpoint, `checkpoint-<sequence>.json`, with
//! the sequence zero-padded so lexical order is numeric order. Records are
//! written to a hidden temporary file, fsynced, then renamed into place.

use async_trait::async_trait;
use keel_core::{KeelError, Result, WorkflowState};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::checkpoint::{check_monotonic, Checkpoint, CheckpointStore, CheckpointSummary};

const PREFIX: &str = "checkpoint-";
const SUFFIX: &str = ".json";
const TMP_SUFFIX: &str = ".tmp";

pub struct FileCheckpointStore {
    dir: PathBuf,
    /// Latest persisted sequence; the lock also serializes writers
    latest: Mutex<Option<u64>>,
}

impl FileCheckpointStore {
    /// Open (creating if needed) a store rooted at `dir`
    ///
    /// Leftover temporary files from an interrupted write are removed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;

        let mut latest = None;
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(TMP_SUFFIX) {
                warn!(file = %name, "removing partial checkpoint");
                fs::remove_file(entry.path()).await?;
                continue;
            }
            if let Some(seq) = parse_sequence(&name) {
                latest = latest.max(Some(seq));
            }
        }

        debug!(dir = %dir.display(), latest = ?latest, "opened checkpoint store");
        Ok(Self {
            dir,
            latest: Mutex::new(latest),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, sequence: u64) -> PathBuf {
        self.dir.join(file_name(sequence))
    }

    async fn read_record(&self, sequence: u64) -> Result<Checkpoint> {
        let path = self.record_path(sequence);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(KeelError::Checkpoint(format!(
                    "no checkpoint with sequence {}",
                    sequence
                )))
            }
            Err(e) => return Err(e.into()),
        };
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes).map_err(|e| {
            KeelError::Checkpoint(format!("checkpoint {} is unreadable: {}", sequence, e))
        })?;
        checkpoint.verify()?;
        Ok(checkpoint)
    }

    async fn sequences(&self) -> Result<Vec<u64>> {
        let mut sequences = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(seq) = parse_sequence(&entry.file_name().to_string_lossy()) {
                sequences.push(seq);
            }
        }
        sequences.sort_unstable();
        Ok(sequences)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, state: &WorkflowState) -> Result<u64> {
        let mut latest = self.latest.lock().await;
        check_monotonic(*latest, state.sequence)?;

        let checkpoint = Checkpoint::seal(state)?;
        let bytes = serde_json::to_vec_pretty(&checkpoint)?;

        let final_path = self.record_path(checkpoint.sequence);
        let tmp_path = self
            .dir
            .join(format!(".{}{}", file_name(checkpoint.sequence), TMP_SUFFIX));

        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp_path, &final_path).await?;
        sync_dir(&self.dir).await;

        *latest = Some(checkpoint.sequence);
        let short_hash = checkpoint.content_hash.get(..12).unwrap_or_default();
        info!(
            sequence = checkpoint.sequence,
            phase = %state.phase,
            hash = short_hash,
            "checkpoint saved"
        );
        Ok(checkpoint.sequence)
    }

    async fn load_latest(&self) -> Result<Option<WorkflowState>> {
        let latest = *self.latest.lock().await;
        match latest {
            Some(seq) => Ok(Some(self.read_record(seq).await?.state)),
            None => Ok(None),
        }
    }

    async fn load(&self, sequence: u64) -> Result<Checkpoint> {
        self.read_record(sequence).await
    }

    async fn list(&self) -> Result<Vec<CheckpointSummary>> {
        let mut summaries = Vec::new();
        for seq in self.sequences().await? {
            summaries.push(self.read_record(seq).await?.summary());
        }
        Ok(summaries)
    }

    async fn latest_sequence(&self) -> Result<Option<u64>> {
        Ok(*self.latest.lock().await)
    }
}

fn file_name(sequence: u64) -> String {
    format!("{}{:012}{}", PREFIX, sequence, SUFFIX)
}

fn parse_sequence(name: &str) -> Option<u64> {
    name.strip_prefix(PREFIX)?
        .strip_suffix(SUFFIX)?
        .parse()
        .ok()
}

/// Persist the rename itself; not every platform lets a directory be fsynced
async fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Ok(handle) = fs::File::open(dir).await {
            if let Err(e) = handle.sync_all().await {
                debug!(error = %e, "directory fsync failed");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{Phase, Task};
    use tempfile::TempDir;

    fn state(seq: u64) -> WorkflowState {
        let mut state = WorkflowState::new("payments")
            .with_tasks(vec![Task::new("A", "ledger"), Task::new("B", "api")]);
        state.sequence = seq;
        state
    }

    #[test]
    fn test_file_names_sort_numerically() {
        assert_eq!(file_name(7), "checkpoint-000000000007.json");
        assert_eq!(parse_sequence(&file_name(42)), Some(42));
        assert_eq!(parse_sequence(".checkpoint-000000000001.json.tmp"), None);
        assert_eq!(parse_sequence("notes.md"), None);
    }

    #[tokio::test]
    async fn test_save_then_load_latest_is_identical() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::open(dir.path()).await.unwrap();

        let mut s = state(1);
        s.phase = Phase::Validation;
        assert_eq!(store.save(&s).await.unwrap(), 1);

        let loaded = store.load_latest().await.unwrap().unwrap();
        assert_eq!(loaded, s);
        assert_eq!(
            serde_json::to_vec(&loaded).unwrap(),
            serde_json::to_vec(&s).unwrap()
        );
    }

    #[tokio::test]
    async fn test_rejects_non_monotonic_sequence() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::open(dir.path()).await.unwrap();
        store.save(&state(2)).await.unwrap();

        assert!(store.save(&state(2)).await.is_err());
        assert!(store.save(&state(1)).await.is_err());
        assert_eq!(store.save(&state(3)).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_reopen_finds_latest_and_clears_partials() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileCheckpointStore::open(dir.path()).await.unwrap();
            store.save(&state(1)).await.unwrap();
            store.save(&state(2)).await.unwrap();
        }
        let partial = dir.path().join(".checkpoint-000000000003.json.tmp");
        std::fs::write(&partial, b"{\"sequence\": 3").unwrap();

        let store = FileCheckpointStore::open(dir.path()).await.unwrap();
        assert!(!partial.exists());
        let latest = store.load_latest().await.unwrap().unwrap();
        assert_eq!(latest.sequence, 2);
        assert_eq!(store.latest_sequence().await.unwrap(), Some(2));

        let listed: Vec<u64> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.sequence)
            .collect();
        assert_eq!(listed, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_load_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::open(dir.path()).await.unwrap();
        store.save(&state(1)).await.unwrap();

        let path = dir.path().join(file_name(1));
        let tampered = std::fs::read_to_string(&path)
            .unwrap()
            .replace("payments", "refunds");
        std::fs::write(&path, tampered).unwrap();

        let err = store.load(1).await.unwrap_err();
        assert!(matches!(err, KeelError::CheckpointIntegrity { .. }));
    }

    #[tokio::test]
    async fn test_point_in_time_load() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::open(dir.path()).await.unwrap();

        let first = state(1);
        let mut second = state(2);
        second.phase = Phase::Planning;
        store.save(&first).await.unwrap();
        store.save(&second).await.unwrap();

        assert_eq!(store.load(1).await.unwrap().state, first);
        assert!(store.load(9).await.is_err());
    }
}
