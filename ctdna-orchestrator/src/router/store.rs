//! Durable run state.
//!
//! A run suspended between submission and the engine's completion event
//! must survive restarts, so the router persists every transition. Writes
//! carry the revision the writer loaded; a mismatch is a conflict.

use crate::core::WorkflowRun;
use crate::errors::StoreError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Persistence for workflow runs.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Loads a run.
    async fn get(&self, portal_run_id: &str) -> Result<Option<WorkflowRun>, StoreError>;

    /// Persists a run and returns it with its new revision.
    ///
    /// `expected` is the revision the caller loaded, or `None` for a run
    /// that must not exist yet.
    async fn put(&self, run: WorkflowRun, expected: Option<u64>) -> Result<WorkflowRun, StoreError>;

    /// Lists every stored run.
    async fn list(&self) -> Result<Vec<WorkflowRun>, StoreError>;
}

fn check_revision(portal_run_id: &str, current: Option<u64>, expected: Option<u64>) -> Result<(), StoreError> {
    if current == expected {
        Ok(())
    } else {
        Err(StoreError::Conflict {
            portal_run_id: portal_run_id.to_string(),
            expected,
            found: current,
        })
    }
}

/// In-memory run store.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<String, WorkflowRun>>,
}

impl InMemoryRunStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.read().len()
    }

    /// Returns true if no run is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.read().is_empty()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn get(&self, portal_run_id: &str) -> Result<Option<WorkflowRun>, StoreError> {
        Ok(self.runs.read().get(portal_run_id).cloned())
    }

    async fn put(&self, mut run: WorkflowRun, expected: Option<u64>) -> Result<WorkflowRun, StoreError> {
        let mut runs = self.runs.write();
        let current = runs.get(run.portal_run_id()).map(|r| r.revision);
        check_revision(run.portal_run_id(), current, expected)?;
        run.revision = current.unwrap_or(0) + 1;
        runs.insert(run.portal_run_id().to_string(), run.clone());
        Ok(run)
    }

    async fn list(&self) -> Result<Vec<WorkflowRun>, StoreError> {
        let mut runs: Vec<_> = self.runs.read().values().cloned().collect();
        runs.sort_by(|a, b| a.portal_run_id().cmp(b.portal_run_id()));
        Ok(runs)
    }
}

/// One JSON document per run under a directory.
///
/// Writes go to a temporary file that is renamed over the document, so a
/// crash never leaves a half-written run behind. Single-writer access is
/// provided by the router's per-run locks.
#[derive(Debug, Clone)]
pub struct FileRunStore {
    root: PathBuf,
}

impl FileRunStore {
    /// Opens (and creates if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the directory cannot be created.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Directory holding the documents.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a run's document. Ids are used verbatim, so only
    /// `[A-Za-z0-9_-]` is accepted and distinct runs never share a file.
    fn document_path(&self, portal_run_id: &str) -> Result<PathBuf, StoreError> {
        let valid = !portal_run_id.is_empty()
            && portal_run_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::InvalidRunId {
                portal_run_id: portal_run_id.to_string(),
            });
        }
        Ok(self.root.join(format!("{portal_run_id}.json")))
    }
}

#[async_trait]
impl RunStore for FileRunStore {
    async fn get(&self, portal_run_id: &str) -> Result<Option<WorkflowRun>, StoreError> {
        match tokio::fs::read_to_string(self.document_path(portal_run_id)?).await {
            Ok(raw) => {
                let run: WorkflowRun = serde_json::from_str(&raw)?;
                if run.portal_run_id() != portal_run_id {
                    return Err(StoreError::Mismatch {
                        requested: portal_run_id.to_string(),
                        found: run.portal_run_id().to_string(),
                    });
                }
                Ok(Some(run))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, mut run: WorkflowRun, expected: Option<u64>) -> Result<WorkflowRun, StoreError> {
        let current = self.get(run.portal_run_id()).await?.map(|r| r.revision);
        check_revision(run.portal_run_id(), current, expected)?;
        run.revision = current.unwrap_or(0) + 1;

        let path = self.document_path(run.portal_run_id())?;
        let temp = path.with_extension("json.tmp");
        tokio::fs::write(&temp, serde_json::to_vec_pretty(&run)?).await?;
        tokio::fs::rename(&temp, &path).await?;

        tracing::debug!(
            portal_run_id = %run.portal_run_id(),
            revision = run.revision,
            file = ?path,
            "Run saved"
        );
        Ok(run)
    }

    async fn list(&self) -> Result<Vec<WorkflowRun>, StoreError> {
        let mut runs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                let raw = tokio::fs::read_to_string(&path).await?;
                runs.push(serde_json::from_str::<WorkflowRun>(&raw)?);
            }
        }
        runs.sort_by(|a, b| a.portal_run_id().cmp(b.portal_run_id()));
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Payload, WorkflowRunStatus};
    use serde_json::json;

    fn run(id: &str) -> WorkflowRun {
        WorkflowRun::new(
            id,
            "dragen-tso500-ctdna",
            "2.6.0",
            Payload::with_data("2025.07.29", json!({"tags": {"libraryId": "L2401531"}})),
        )
    }

    async fn exercise(store: &dyn RunStore) {
        assert!(store.get("r1").await.unwrap().is_none());

        let stored = store.put(run("r1"), None).await.unwrap();
        assert_eq!(stored.revision, 1);

        let mut next = stored.clone();
        next.transition(WorkflowRunStatus::Ready);
        let stored = store.put(next, Some(1)).await.unwrap();
        assert_eq!(stored.revision, 2);

        let conflict = store.put(run("r1"), Some(1)).await.unwrap_err();
        assert!(matches!(
            conflict,
            StoreError::Conflict {
                expected: Some(1),
                found: Some(2),
                ..
            }
        ));
        assert!(store.put(run("r1"), None).await.is_err());

        let loaded = store.get("r1").await.unwrap().unwrap();
        assert_eq!(loaded.status, WorkflowRunStatus::Ready);
        assert_eq!(loaded, stored);

        store.put(run("r0"), None).await.unwrap();
        let ids: Vec<_> = store
            .list()
            .await
            .unwrap()
            .iter()
            .map(|r| r.portal_run_id().to_string())
            .collect();
        assert_eq!(ids, vec!["r0", "r1"]);
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryRunStore::new();
        exercise(&store).await;
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRunStore::open(dir.path().join("runs")).await.unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRunStore::open(dir.path()).await.unwrap();
        store.put(run("20250620abcd6789"), None).await.unwrap();

        let reopened = FileRunStore::open(dir.path()).await.unwrap();
        let loaded = reopened.get("20250620abcd6789").await.unwrap().unwrap();
        assert_eq!(loaded.revision, 1);
        assert_eq!(loaded.payload.get_str("tags.libraryId"), Some("L2401531"));
    }

    #[tokio::test]
    async fn test_file_store_rejects_ids_it_cannot_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRunStore::open(dir.path()).await.unwrap();

        let err = store.put(run("run.1"), None).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidRunId { .. }));
        assert!(matches!(store.get("../run_1").await, Err(StoreError::InvalidRunId { .. })));

        store.put(run("run_1"), None).await.unwrap();
        assert!(store.get("run-1").await.unwrap().is_none());
        assert_eq!(store.get("run_1").await.unwrap().unwrap().portal_run_id(), "run_1");
    }

    #[tokio::test]
    async fn test_file_store_detects_misplaced_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRunStore::open(dir.path()).await.unwrap();
        store.put(run("r1"), None).await.unwrap();
        tokio::fs::copy(dir.path().join("r1.json"), dir.path().join("r2.json"))
            .await
            .unwrap();

        let err = store.get("r2").await.unwrap_err();
        assert!(matches!(err, StoreError::Mismatch { ref requested, ref found } if requested == "r2" && found == "r1"));
    }
}
