//! Crash-resumable persistence for [`ProjectState`].
//!
//! Two backends satisfy the [`Checkpointer`] trait: [`InMemoryCheckpointer`]
//! for tests and ephemeral runs, and [`FileCheckpointer`], which writes a
//! directory layout of `state.json` (last full snapshot), `transitions.log`
//! / `errors.log` (JSON-lines), and a `workspace/` subtree for generated
//! files. The run snapshot format is file-based by design; SQLite is
//! reserved for the cross-session relational metrics store
//! (`crewflow-memory::relational`) instead.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::state::ProjectState;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Pluggable state-persistence backend: writes a snapshot of state after
/// every transition and appends every recorded error.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    async fn save(&self, state: &ProjectState) -> Result<(), PersistenceError>;
    async fn load(&self, project_id: Uuid) -> Result<Option<ProjectState>, PersistenceError>;
}

/// Volatile, in-process persistence — the default for tests and for runs
/// that opt out of durable storage.
#[derive(Default)]
pub struct InMemoryCheckpointer {
    snapshots: Mutex<HashMap<Uuid, ProjectState>>,
}

impl InMemoryCheckpointer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Checkpointer for InMemoryCheckpointer {
    async fn save(&self, state: &ProjectState) -> Result<(), PersistenceError> {
        self.snapshots
            .lock()
            .await
            .insert(state.project_id, state.clone());
        Ok(())
    }

    async fn load(&self, project_id: Uuid) -> Result<Option<ProjectState>, PersistenceError> {
        Ok(self.snapshots.lock().await.get(&project_id).cloned())
    }
}

/// `persist_dir/<project_id>/{state.json, transitions.log, errors.log,
/// workspace/}`.
pub struct FileCheckpointer {
    root: PathBuf,
}

impl FileCheckpointer {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn project_dir(&self, project_id: Uuid) -> PathBuf {
        self.root.join(project_id.to_string())
    }
}

fn io_err(path: &Path, source: std::io::Error) -> PersistenceError {
    PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Each recorded item serializes to its own JSON line. The whole log is
/// rewritten on every save rather than incrementally appended: `ProjectState`
/// already holds the complete ordered history in memory, so a full rewrite
/// keeps the on-disk log always-consistent with the in-memory state it was
/// derived from, at the cost of O(n) IO per save rather than O(1).
async fn write_jsonl<T: Serialize>(path: &Path, items: &[T]) -> Result<(), PersistenceError> {
    let mut buf = String::new();
    for item in items {
        buf.push_str(&serde_json::to_string(item)?);
        buf.push('\n');
    }
    tokio::fs::write(path, buf)
        .await
        .map_err(|source| io_err(path, source))
}

#[async_trait]
impl Checkpointer for FileCheckpointer {
    #[tracing::instrument(skip(self, state), fields(project_id = %state.project_id), err)]
    async fn save(&self, state: &ProjectState) -> Result<(), PersistenceError> {
        let dir = self.project_dir(state.project_id);
        let workspace = dir.join("workspace");
        tokio::fs::create_dir_all(&workspace)
            .await
            .map_err(|source| io_err(&workspace, source))?;

        let snapshot_path = dir.join("state.json");
        let json = serde_json::to_vec_pretty(state)?;
        tokio::fs::write(&snapshot_path, json)
            .await
            .map_err(|source| io_err(&snapshot_path, source))?;

        write_jsonl(&dir.join("transitions.log"), &state.transitions).await?;
        write_jsonl(&dir.join("errors.log"), &state.errors).await?;

        for file in &state.files {
            let path = workspace.join(&file.path);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| io_err(parent, source))?;
            }
            tokio::fs::write(&path, &file.content)
                .await
                .map_err(|source| io_err(&path, source))?;
        }
        Ok(())
    }

    #[tracing::instrument(skip(self), err)]
    async fn load(&self, project_id: Uuid) -> Result<Option<ProjectState>, PersistenceError> {
        let path = self.project_dir(project_id).join("state.json");
        if !tokio::fs::try_exists(&path)
            .await
            .map_err(|source| io_err(&path, source))?
        {
            return Ok(None);
        }
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|source| io_err(&path, source))?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{FileKind, Phase};

    #[tokio::test]
    async fn in_memory_round_trips() {
        let cp = InMemoryCheckpointer::new();
        let mut state = ProjectState::new("build me an api", 3);
        state.transition(Phase::Planning, "validated").unwrap();
        cp.save(&state).await.unwrap();
        let loaded = cp.load(state.project_id).await.unwrap().unwrap();
        assert_eq!(loaded.phase, Phase::Planning);
    }

    #[tokio::test]
    async fn missing_project_loads_none() {
        let cp = InMemoryCheckpointer::new();
        assert!(cp.load(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_checkpointer_round_trips_and_writes_workspace_files() {
        let dir = tempfile::tempdir().unwrap();
        let cp = FileCheckpointer::new(dir.path());
        let mut state = ProjectState::new("build me an api", 3);
        state.transition(Phase::Planning, "validated").unwrap();
        state.transition(Phase::Development, "ok").unwrap();
        state
            .append_file("src/main.rs", "fn main(){}", "rust", FileKind::Source, vec![])
            .unwrap();
        cp.save(&state).await.unwrap();

        let project_dir = dir.path().join(state.project_id.to_string());
        assert!(project_dir.join("state.json").exists());
        assert!(project_dir.join("transitions.log").exists());
        assert!(project_dir.join("errors.log").exists());
        assert!(project_dir.join("workspace/src/main.rs").exists());

        let loaded = cp.load(state.project_id).await.unwrap().unwrap();
        assert_eq!(loaded.phase, Phase::Development);
        assert_eq!(loaded.files.len(), 1);
        assert_eq!(loaded.transitions.len(), state.transitions.len());
    }

    #[tokio::test]
    async fn file_checkpointer_missing_project_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let cp = FileCheckpointer::new(dir.path());
        assert!(cp.load(Uuid::new_v4()).await.unwrap().is_none());
    }
}
