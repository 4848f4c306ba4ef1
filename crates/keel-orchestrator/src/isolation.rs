//! Isolated execution contexts and sequential integration
//!
//! Each task in a parallel batch gets a private copy of the shared files in
//! its scope. Workers only ever touch their own context. Integration runs
//! one context at a time under the writer lock, and a file that changed in
//! the shared set since the context was created halts integration with a
//! conflict report; nothing is merged automatically.

use async_trait::async_trait;
use glob::Pattern;
use keel_core::{KeelError, Result, Task, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// The shared artifact set
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn read(&self, path: &str) -> Result<Option<String>>;

    async fn write(&self, path: &str, content: &str) -> Result<()>;

    async fn delete(&self, path: &str) -> Result<()>;

    /// Files matching any of `patterns`; no patterns lists everything
    async fn list(&self, patterns: &[String]) -> Result<Vec<String>>;

    /// Fails when the store cannot be reached
    async fn check(&self) -> Result<()>;
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p)
                .map_err(|e| KeelError::Isolation(format!("invalid scope pattern {}: {}", p, e)))
        })
        .collect()
}

fn matches_any(patterns: &[Pattern], path: &str) -> bool {
    patterns.is_empty() || patterns.iter().any(|p| p.matches(path))
}

/// Reject absolute paths and `..` so nothing escapes the artifact root
fn check_relative(path: &str) -> Result<()> {
    let escapes = Path::new(path)
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if path.is_empty() || escapes {
        return Err(KeelError::Isolation(format!("path {} is not relative", path)));
    }
    Ok(())
}

/// In-memory artifact set for tests and dry runs
#[derive(Default)]
pub struct MemoryArtifactStore {
    files: Mutex<BTreeMap<String, String>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.get_mut().insert(path.into(), content.into());
        self
    }

    pub async fn snapshot(&self) -> BTreeMap<String, String> {
        self.files.lock().await.clone()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn read(&self, path: &str) -> Result<Option<String>> {
        Ok(self.files.lock().await.get(path).cloned())
    }

    async fn write(&self, path: &str, content: &str) -> Result<()> {
        check_relative(path)?;
        self.files
            .lock()
            .await
            .insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.files.lock().await.remove(path);
        Ok(())
    }

    async fn list(&self, patterns: &[String]) -> Result<Vec<String>> {
        let patterns = compile_patterns(patterns)?;
        Ok(self
            .files
            .lock()
            .await
            .keys()
            .filter(|path| matches_any(&patterns, path))
            .cloned()
            .collect())
    }

    async fn check(&self) -> Result<()> {
        Ok(())
    }
}

/// Artifact set rooted at a directory on disk
///
/// Hidden files and directories (`.git`, `.keel`) are never listed.
pub struct DirectoryArtifactStore {
    root: PathBuf,
}

impl DirectoryArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Relative paths of every visible file under `root`, sorted
fn walk_files(root: &Path) -> Result<Vec<String>> {
    let pattern = format!("{}/**/*", Pattern::escape(&root.to_string_lossy()));
    let entries =
        glob::glob(&pattern).map_err(|e| KeelError::Isolation(format!("bad walk pattern: {}", e)))?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| KeelError::Isolation(e.to_string()))?;
        if !path.is_file() {
            continue;
        }
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let hidden = relative
            .components()
            .any(|c| c.as_os_str().to_string_lossy().starts_with('.'));
        if !hidden {
            files.push(relative.to_string_lossy().replace('\\', "/"));
        }
    }
    files.sort();
    Ok(files)
}

#[async_trait]
impl ArtifactStore for DirectoryArtifactStore {
    async fn read(&self, path: &str) -> Result<Option<String>> {
        check_relative(path)?;
        match tokio::fs::read_to_string(self.root.join(path)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, path: &str, content: &str) -> Result<()> {
        check_relative(path)?;
        let full = self.root.join(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(full, content).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        check_relative(path)?;
        match tokio::fs::remove_file(self.root.join(path)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn list(&self, patterns: &[String]) -> Result<Vec<String>> {
        let patterns = compile_patterns(patterns)?;
        Ok(walk_files(&self.root)?
            .into_iter()
            .filter(|path| matches_any(&patterns, path))
            .collect())
    }

    async fn check(&self) -> Result<()> {
        let metadata = tokio::fs::metadata(&self.root).await?;
        if !metadata.is_dir() {
            return Err(KeelError::Isolation(format!(
                "artifact root {} is not a directory",
                self.root.display()
            )));
        }
        Ok(())
    }
}

/// A change a context made relative to its base snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: String,
    pub base: Option<String>,
    /// `None` deletes the file
    pub content: Option<String>,
}

/// A private working copy for one task
#[derive(Debug)]
pub struct IsolatedContext {
    pub id: String,
    pub task_id: TaskId,
    scope: Vec<Pattern>,
    base: BTreeMap<String, String>,
    files: BTreeMap<String, String>,
    dir: Option<PathBuf>,
}

impl IsolatedContext {
    /// Directory the context is materialized in, if any
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn in_scope(&self, path: &str) -> bool {
        matches_any(&self.scope, path)
    }

    pub fn read(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    /// Whether this context may write or delete `path`
    pub fn admits(&self, path: &str) -> Result<()> {
        check_relative(path)?;
        if !self.in_scope(path) {
            return Err(KeelError::Isolation(format!(
                "{} is outside the scope of task {}",
                path, self.task_id
            )));
        }
        Ok(())
    }

    pub fn write(&mut self, path: &str, content: impl Into<String>) -> Result<()> {
        self.admits(path)?;
        self.files.insert(path.to_string(), content.into());
        Ok(())
    }

    pub fn delete(&mut self, path: &str) -> Result<()> {
        self.admits(path)?;
        self.files.remove(path);
        Ok(())
    }

    pub fn changes(&self) -> Vec<FileChange> {
        let paths: std::collections::BTreeSet<&String> =
            self.base.keys().chain(self.files.keys()).collect();
        paths
            .into_iter()
            .filter(|path| self.base.get(*path) != self.files.get(*path))
            .map(|path| FileChange {
                path: path.clone(),
                base: self.base.get(path).cloned(),
                content: self.files.get(path).cloned(),
            })
            .collect()
    }

    pub fn changed_files(&self) -> Vec<String> {
        self.changes().into_iter().map(|c| c.path).collect()
    }

    /// Pick up what a CLI worker wrote into the materialized directory
    ///
    /// Out-of-scope files are ignored; they never reach the shared set.
    pub async fn sync_from_dir(&mut self) -> Result<()> {
        let Some(dir) = self.dir.clone() else {
            return Ok(());
        };
        let on_disk = walk_files(&dir)?;
        let present: HashSet<&String> = on_disk.iter().collect();

        for path in &on_disk {
            if !self.in_scope(path) {
                warn!(context = %self.id, path = %path, "ignoring write outside task scope");
                continue;
            }
            let content = tokio::fs::read_to_string(dir.join(path)).await?;
            self.files.insert(path.clone(), content);
        }
        self.files.retain(|path, _| present.contains(path));
        Ok(())
    }
}

/// Inclusive 1-based line span; `count == 0` marks an insertion point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    pub start: usize,
    pub count: usize,
}

impl std::fmt::Display for LineRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{}", self.start, self.count)
    }
}

/// Lines of `new` that differ from `old`, by common prefix and suffix
pub fn changed_lines(old: &str, new: &str) -> LineRange {
    let old: Vec<&str> = old.lines().collect();
    let new: Vec<&str> = new.lines().collect();
    let prefix = old.iter().zip(&new).take_while(|(a, b)| a == b).count();
    let max_suffix = old.len().min(new.len()) - prefix;
    let suffix = old
        .iter()
        .rev()
        .zip(new.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();
    LineRange {
        start: prefix + 1,
        count: new.len() - prefix - suffix,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileConflict {
    pub path: String,
    /// What changed in the shared set since the context was created
    pub shared: Option<LineRange>,
    /// What the context changed
    pub context: Option<LineRange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub task_id: TaskId,
    pub context_id: String,
    pub files: Vec<FileConflict>,
}

impl std::fmt::Display for ConflictReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task {} conflicts on", self.task_id)?;
        for file in &self.files {
            write!(f, " {}", file.path)?;
            if let (Some(shared), Some(ours)) = (file.shared, file.context) {
                write!(f, " (shared @{} vs context @{})", shared, ours)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrationResult {
    Integrated { files: Vec<String> },
    Conflict(ConflictReport),
}

/// Creates, integrates and removes isolated contexts
pub struct IsolationLayer {
    store: Arc<dyn ArtifactStore>,
    contexts_dir: Option<PathBuf>,
    /// Held for every snapshot and every integration
    writer: Mutex<()>,
}

impl IsolationLayer {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            store,
            contexts_dir: None,
            writer: Mutex::new(()),
        }
    }

    /// Materialize contexts as directories under `dir`
    pub fn with_contexts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.contexts_dir = Some(dir.into());
        self
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// One context per task; tasks in a batch must not depend on each other
    pub async fn create_batch(&self, tasks: &[Task]) -> Result<Vec<IsolatedContext>> {
        let ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        for task in tasks {
            if let Some(dep) = task.dependencies.iter().find(|d| ids.contains(d.as_str())) {
                return Err(KeelError::Isolation(format!(
                    "task {} depends on {} in the same batch",
                    task.id, dep
                )));
            }
        }

        let _guard = self.writer.lock().await;
        let mut contexts = Vec::with_capacity(tasks.len());
        for task in tasks {
            match self.create(task).await {
                Ok(context) => contexts.push(context),
                Err(e) => {
                    for context in contexts {
                        self.remove_dir(&context).await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(contexts)
    }

    async fn create(&self, task: &Task) -> Result<IsolatedContext> {
        let scope = compile_patterns(&task.file_scope)?;
        let mut base = BTreeMap::new();
        for path in self.store.list(&task.file_scope).await? {
            if let Some(content) = self.store.read(&path).await? {
                base.insert(path, content);
            }
        }

        let slug: String = task
            .id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        let id = format!("{}-{}", slug, &uuid::Uuid::new_v4().simple().to_string()[..8]);

        let dir = match &self.contexts_dir {
            Some(root) => {
                let dir = root.join(&id);
                tokio::fs::create_dir_all(&dir).await?;
                for (path, content) in &base {
                    let full = dir.join(path);
                    if let Some(parent) = full.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    tokio::fs::write(full, content).await?;
                }
                Some(dir)
            }
            None => None,
        };

        debug!(context = %id, task_id = %task.id, files = base.len(), "created context");
        Ok(IsolatedContext {
            id,
            task_id: task.id.clone(),
            scope,
            files: base.clone(),
            base,
            dir,
        })
    }

    /// Merge one context into the shared set, or report why not
    ///
    /// Either every change is written or none is.
    pub async fn integrate(&self, context: &IsolatedContext) -> Result<IntegrationResult> {
        let _guard = self.writer.lock().await;
        let changes = context.changes();

        let mut conflicts = Vec::new();
        for change in &changes {
            let current = self.store.read(&change.path).await?;
            // Unchanged since the snapshot, or already holding this exact content
            if current == change.base || current == change.content {
                continue;
            }
            let range = |from: &Option<String>, to: &Option<String>| {
                Some(changed_lines(
                    from.as_deref().unwrap_or_default(),
                    to.as_deref().unwrap_or_default(),
                ))
            };
            conflicts.push(FileConflict {
                path: change.path.clone(),
                shared: range(&change.base, &current),
                context: range(&change.base, &change.content),
            });
        }

        if !conflicts.is_empty() {
            let report = ConflictReport {
                task_id: context.task_id.clone(),
                context_id: context.id.clone(),
                files: conflicts,
            };
            warn!(context = %context.id, task_id = %context.task_id, %report, "integration conflict");
            return Ok(IntegrationResult::Conflict(report));
        }

        for change in &changes {
            match &change.content {
                Some(content) => self.store.write(&change.path, content).await?,
                None => self.store.delete(&change.path).await?,
            }
        }
        let files: Vec<String> = changes.into_iter().map(|c| c.path).collect();
        info!(context = %context.id, task_id = %context.task_id, files = files.len(), "integrated context");
        Ok(IntegrationResult::Integrated { files })
    }

    async fn remove_dir(&self, context: &IsolatedContext) {
        if let Some(dir) = &context.dir {
            if let Err(e) = tokio::fs::remove_dir_all(dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(context = %context.id, error = %e, "failed to remove context directory");
                }
            }
        }
    }

    /// Drop a context on any path, success or failure
    pub async fn cleanup(&self, context: IsolatedContext) {
        self.remove_dir(&context).await;
        debug!(context = %context.id, "context cleaned up");
    }

    /// Remove context directories left behind by a crashed run
    pub async fn cleanup_orphans(&self) -> Result<usize> {
        let Some(root) = &self.contexts_dir else {
            return Ok(0);
        };
        let mut entries = match tokio::fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(entry.path()).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "removed orphaned contexts");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn shared() -> Arc<MemoryArtifactStore> {
        Arc::new(
            MemoryArtifactStore::new()
                .with_file("src/auth.rs", "fn login() {}\n")
                .with_file("src/db.rs", "fn connect() {}\n")
                .with_file("README.md", "# demo\n"),
        )
    }

    #[tokio::test]
    async fn test_contexts_are_isolated_until_integration() {
        let store = shared();
        let layer = IsolationLayer::new(store.clone());
        let tasks = vec![
            Task::new("A", "auth").with_file_scope(["src/auth.rs"]),
            Task::new("B", "db").with_file_scope(["src/db.rs"]),
        ];
        let mut contexts = layer.create_batch(&tasks).await.unwrap();
        assert_eq!(contexts.len(), 2);

        contexts[0].write("src/auth.rs", "fn login() { check() }\n").unwrap();
        assert_eq!(contexts[1].read("src/auth.rs"), None);
        assert_eq!(
            store.read("src/auth.rs").await.unwrap().as_deref(),
            Some("fn login() {}\n")
        );

        let result = layer.integrate(&contexts[0]).await.unwrap();
        assert_eq!(
            result,
            IntegrationResult::Integrated {
                files: vec!["src/auth.rs".to_string()]
            }
        );
        assert_eq!(
            store.read("src/auth.rs").await.unwrap().as_deref(),
            Some("fn login() { check() }\n")
        );
    }

    #[tokio::test]
    async fn test_scope_is_enforced() {
        let layer = IsolationLayer::new(shared());
        let mut contexts = layer
            .create_batch(&[Task::new("A", "auth").with_file_scope(["src/auth*"])])
            .await
            .unwrap();
        assert!(contexts[0].write("src/db.rs", "oops").is_err());
        assert!(contexts[0].write("../escape.rs", "oops").is_err());
        assert!(contexts[0].write("src/auth_test.rs", "ok").is_ok());
    }

    #[tokio::test]
    async fn test_overlapping_change_reports_conflict() {
        let store = shared();
        let layer = IsolationLayer::new(store.clone());
        let tasks = vec![
            Task::new("A", "one").with_file_scope(["src/*.rs"]),
            Task::new("B", "two").with_file_scope(["src/*.rs"]),
        ];
        let mut contexts = layer.create_batch(&tasks).await.unwrap();
        contexts[0]
            .write("src/db.rs", "fn connect() {}\nfn pool() {}\n")
            .unwrap();
        contexts[1]
            .write("src/db.rs", "fn connect(url: &str) {}\n")
            .unwrap();
        contexts[1].write("src/auth.rs", "fn login2() {}\n").unwrap();

        assert!(matches!(
            layer.integrate(&contexts[0]).await.unwrap(),
            IntegrationResult::Integrated { .. }
        ));
        match layer.integrate(&contexts[1]).await.unwrap() {
            IntegrationResult::Conflict(report) => {
                assert_eq!(report.task_id, "B");
                assert_eq!(report.files.len(), 1);
                assert_eq!(report.files[0].path, "src/db.rs");
                assert_eq!(report.files[0].shared, Some(LineRange { start: 2, count: 1 }));
                assert_eq!(report.files[0].context, Some(LineRange { start: 1, count: 1 }));
            }
            other => panic!("expected conflict, got {:?}", other),
        }
        // Nothing from the conflicting context was written
        assert_eq!(
            store.read("src/auth.rs").await.unwrap().as_deref(),
            Some("fn login() {}\n")
        );
    }

    #[tokio::test]
    async fn test_dependent_tasks_cannot_share_a_batch() {
        let layer = IsolationLayer::new(shared());
        let tasks = vec![Task::new("A", "a"), Task::new("B", "b").with_dependencies(["A"])];
        assert!(matches!(
            layer.create_batch(&tasks).await,
            Err(KeelError::Isolation(_))
        ));
    }

    #[tokio::test]
    async fn test_deletion_and_creation() {
        let store = shared();
        let layer = IsolationLayer::new(store.clone());
        let mut contexts = layer
            .create_batch(&[Task::new("A", "docs").with_file_scope(["*.md", "docs/**"])])
            .await
            .unwrap();
        contexts[0].delete("README.md").unwrap();
        contexts[0].write("docs/guide.md", "# guide\n").unwrap();
        assert_eq!(contexts[0].changed_files(), vec!["README.md", "docs/guide.md"]);

        layer.integrate(&contexts[0]).await.unwrap();
        let files = store.snapshot().await;
        assert!(!files.contains_key("README.md"));
        assert_eq!(files["docs/guide.md"], "# guide\n");
    }

    #[tokio::test]
    async fn test_materialized_context_roundtrip_and_cleanup() {
        let repo = TempDir::new().unwrap();
        std::fs::create_dir_all(repo.path().join("src")).unwrap();
        std::fs::write(repo.path().join("src/lib.rs"), "pub fn a() {}\n").unwrap();
        std::fs::create_dir_all(repo.path().join(".git")).unwrap();
        std::fs::write(repo.path().join(".git/HEAD"), "ref").unwrap();

        let store = Arc::new(DirectoryArtifactStore::new(repo.path()));
        assert_eq!(store.list(&[]).await.unwrap(), vec!["src/lib.rs"]);

        let contexts_dir = repo.path().join(".keel/contexts");
        let layer = IsolationLayer::new(store.clone()).with_contexts_dir(&contexts_dir);
        let mut contexts = layer
            .create_batch(&[Task::new("T-1", "lib").with_file_scope(["src/**"])])
            .await
            .unwrap();
        let dir = contexts[0].dir().unwrap().to_path_buf();
        assert!(dir.join("src/lib.rs").exists());

        // A CLI worker edits files in place
        std::fs::write(dir.join("src/lib.rs"), "pub fn a() {}\npub fn b() {}\n").unwrap();
        std::fs::write(dir.join("outside.txt"), "ignored").unwrap();
        contexts[0].sync_from_dir().await.unwrap();
        assert_eq!(contexts[0].changed_files(), vec!["src/lib.rs"]);

        layer.integrate(&contexts[0]).await.unwrap();
        let content = std::fs::read_to_string(repo.path().join("src/lib.rs")).unwrap();
        assert!(content.contains("pub fn b()"));

        let context = contexts.remove(0);
        layer.cleanup(context).await;
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_cleanup_orphans() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("A-1234abcd/src")).unwrap();
        std::fs::create_dir_all(root.path().join("B-5678abcd")).unwrap();

        let layer = IsolationLayer::new(Arc::new(MemoryArtifactStore::new()))
            .with_contexts_dir(root.path());
        assert_eq!(layer.cleanup_orphans().await.unwrap(), 2);
        assert_eq!(layer.cleanup_orphans().await.unwrap(), 0);
    }

    #[test]
    fn test_changed_lines() {
        assert_eq!(
            changed_lines("a\nb\nc\n", "a\nB\nc\n"),
            LineRange { start: 2, count: 1 }
        );
        assert_eq!(
            changed_lines("a\nc\n", "a\nb\nb2\nc\n"),
            LineRange { start: 2, count: 2 }
        );
        assert_eq!(changed_lines("a\nb\n", "a\n"), LineRange { start: 2, count: 0 });
        assert_eq!(changed_lines("", "x\n"), LineRange { start: 1, count: 1 });
    }
}
