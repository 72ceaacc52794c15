//! Run Environment Allocation
//!
//! Creates the identity, workspace and first store document of a run:
//!
//! 1. draw a `run_id` and a `task_id`
//! 2. create `<tmp_dir>/<run_id>` and `<permanent_dir>/<run_id>`; if either
//!    already exists, start over
//! 3. resolve workflow and parameter files into the workspace
//! 4. insert the run; on a duplicate key remove the directories and start
//!    over
//!
//! Any other failure removes the directories before it is reported, so no
//! directory outlives a failed allocation.

use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::fs;

use super::ids::{generate_run_id, generate_task_id};
use super::material::{self, Attachment};
use crate::config::ServiceConfig;
use crate::error::{StoreError, WesError};
use crate::run::{Internal, Requester, Run, RunRequest};
use crate::store::{RunKey, RunStore};

/// Allocates run environments.
pub struct RunEnvironmentFactory {
    config: Arc<ServiceConfig>,
    store: Arc<dyn RunStore>,
}

impl RunEnvironmentFactory {
    pub fn new(config: Arc<ServiceConfig>, store: Arc<dyn RunStore>) -> Self {
        Self { config, store }
    }

    /// Creates and persists a new run in state `UNKNOWN`.
    ///
    /// `owner` becomes the run's `user_id`.
    pub async fn create(
        &self,
        request: RunRequest,
        owner: Option<&Requester>,
        attachments: &[Attachment],
    ) -> Result<Run, WesError> {
        let ids = &self.config.controller.runs_id;
        let storage = &self.config.storage;

        for attempt in 1..=ids.max_attempts {
            let run_id = generate_run_id(&ids.charset, ids.length);
            let task_id = generate_task_id();

            let tmp_dir = storage.tmp_dir.join(&run_id);
            let out_dir = storage.permanent_dir.join(&run_id);

            match create_workspace(&tmp_dir, &out_dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    debug!("Workspace for run id '{}' exists, drawing again", run_id);
                    continue;
                }
                Err(e) => return Err(WesError::Workspace(e)),
            }

            let mut request = request.clone();
            let material = match material::resolve(&mut request, &out_dir, attachments).await {
                Ok(material) => material,
                Err(e) => {
                    remove_workspace(&tmp_dir, &out_dir).await;
                    return Err(e);
                }
            };

            let internal = Internal {
                tmp_dir: tmp_dir.clone(),
                out_dir: out_dir.clone(),
                workflow_files: Some(material.workflow_files),
                workflow_path: Some(material.workflow_path),
                param_file_path: Some(material.param_file_path),
                ..Default::default()
            };
            let run = Run::new(
                run_id.as_str(),
                task_id,
                owner.map(|o| o.user_id.clone()),
                request,
                internal,
            );

            match self.store.insert(run.clone()).await {
                Ok(()) => {
                    info!(
                        "Created run '{}' (task id: '{}') after {} attempt(s)",
                        run.run_id, run.task_id, attempt
                    );
                    return Ok(run);
                }
                Err(StoreError::Duplicate { field, value }) => {
                    debug!("Duplicate {} '{}', drawing again", field, value);
                    remove_workspace(&tmp_dir, &out_dir).await;
                }
                Err(e) => {
                    remove_workspace(&tmp_dir, &out_dir).await;
                    return Err(WesError::Storage(e));
                }
            }
        }

        Err(WesError::Storage(StoreError::Backend(format!(
            "no unique run id found after {} attempts",
            ids.max_attempts
        ))))
    }

    /// Undoes [`create`](Self::create): deletes the run document and both
    /// workspace directories.
    pub async fn discard(&self, run: &Run) -> Result<(), WesError> {
        remove_workspace(&run.internal.tmp_dir, &run.internal.out_dir).await;
        if self.store.delete(&RunKey::run_id(&run.run_id)).await? {
            info!("Discarded run '{}'", run.run_id);
        }
        Ok(())
    }
}

/// Creates both run directories. Fails with `AlreadyExists` if either one
/// is taken, leaving nothing behind.
async fn create_workspace(tmp_dir: &Path, out_dir: &Path) -> std::io::Result<()> {
    for dir in [tmp_dir, out_dir] {
        if let Some(parent) = dir.parent() {
            fs::create_dir_all(parent).await?;
        }
    }

    fs::create_dir(tmp_dir).await?;
    if let Err(e) = fs::create_dir(out_dir).await {
        remove_dir(tmp_dir).await;
        return Err(e);
    }
    Ok(())
}

async fn remove_workspace(tmp_dir: &Path, out_dir: &Path) {
    remove_dir(tmp_dir).await;
    remove_dir(out_dir).await;
}

async fn remove_dir(dir: &Path) {
    if let Err(e) = fs::remove_dir_all(dir).await {
        if e.kind() != ErrorKind::NotFound {
            warn!("Could not remove {}: {}", dir.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{tempdir, TempDir};

    use crate::run::{RunListing, Transition};
    use crate::store::{ListQuery, MemoryRunStore, RunUpdate, StateResolver};

    fn config(root: &TempDir, charset: &str, length: usize) -> Arc<ServiceConfig> {
        let mut config = ServiceConfig::default();
        config.storage.tmp_dir = root.path().join("tmp");
        config.storage.permanent_dir = root.path().join("out");
        config.controller.runs_id.charset = charset.to_string();
        config.controller.runs_id.length = length;
        config.controller.runs_id.max_attempts = 100;
        Arc::new(config)
    }

    fn request() -> RunRequest {
        RunRequest::new("file:///wf.cwl", "CWL", "v1.0")
    }

    /// Store that rejects the first `duplicates` inserts, then fails or
    /// accepts.
    struct FlakyStore {
        inner: MemoryRunStore,
        duplicates: AtomicUsize,
        broken: bool,
    }

    #[async_trait]
    impl RunStore for FlakyStore {
        async fn insert(&self, run: Run) -> Result<(), StoreError> {
            if self.duplicates.load(Ordering::SeqCst) > 0 {
                self.duplicates.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Duplicate {
                    field: "run_id",
                    value: run.run_id,
                });
            }
            if self.broken {
                return Err(StoreError::Backend("connection lost".to_string()));
            }
            self.inner.insert(run).await
        }

        async fn find(&self, key: &RunKey) -> Result<Option<Run>, StoreError> {
            self.inner.find(key).await
        }

        async fn update(
            &self,
            key: &RunKey,
            apply: &RunUpdate<'_>,
        ) -> Result<Option<Run>, StoreError> {
            self.inner.update(key, apply).await
        }

        async fn transition(
            &self,
            key: &RunKey,
            resolve: &StateResolver<'_>,
        ) -> Result<Option<Transition>, StoreError> {
            self.inner.transition(key, resolve).await
        }

        async fn sub_task_ids(&self, run_id: &str) -> Result<Vec<String>, StoreError> {
            self.inner.sub_task_ids(run_id).await
        }

        async fn delete(&self, key: &RunKey) -> Result<bool, StoreError> {
            self.inner.delete(key).await
        }

        async fn list(&self, query: &ListQuery) -> Result<RunListing, StoreError> {
            self.inner.list(query).await
        }
    }

    fn count_entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_create_persists_unknown_run() {
        let root = tempdir().unwrap();
        let config = config(&root, "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789", 6);
        let store = Arc::new(MemoryRunStore::new());
        let factory = RunEnvironmentFactory::new(Arc::clone(&config), store.clone());

        let owner = Requester::new("alice");
        let run = factory.create(request(), Some(&owner), &[]).await.unwrap();

        assert_eq!(run.run_id.len(), 6);
        assert_eq!(run.state, crate::run::State::Unknown);
        assert_eq!(run.user_id.as_deref(), Some("alice"));
        assert!(run.internal.tmp_dir.is_dir());
        assert!(run.internal.param_file_path.as_ref().unwrap().is_file());

        let stored = store.find(&RunKey::run_id(&run.run_id)).await.unwrap();
        assert_eq!(stored, Some(run));
    }

    #[tokio::test]
    async fn test_existing_directory_forces_new_id() {
        let root = tempdir().unwrap();
        // Two possible ids: "A" and "B"
        let config = config(&root, "AB", 1);
        std::fs::create_dir_all(config.storage.tmp_dir.join("A")).unwrap();

        let factory = RunEnvironmentFactory::new(Arc::clone(&config), Arc::new(MemoryRunStore::new()));
        let run = factory.create(request(), None, &[]).await.unwrap();
        assert_eq!(run.run_id, "B");
    }

    #[tokio::test]
    async fn test_duplicate_key_rolls_back_and_retries() {
        let root = tempdir().unwrap();
        let config = config(&root, "ABCDEFGHIJKLMNOPQRSTUVWXYZ", 8);
        let store = Arc::new(FlakyStore {
            inner: MemoryRunStore::new(),
            duplicates: AtomicUsize::new(2),
            broken: false,
        });
        let factory = RunEnvironmentFactory::new(Arc::clone(&config), store.clone());

        let run = factory.create(request(), None, &[]).await.unwrap();

        // Only the successful attempt left directories behind
        assert_eq!(count_entries(&config.storage.tmp_dir), 1);
        assert_eq!(count_entries(&config.storage.permanent_dir), 1);
        assert!(config.storage.tmp_dir.join(&run.run_id).is_dir());
        assert!(config.storage.permanent_dir.join(&run.run_id).is_dir());
    }

    #[tokio::test]
    async fn test_storage_failure_leaves_no_directories() {
        let root = tempdir().unwrap();
        let config = config(&root, "ABCDEFGHIJKLMNOPQRSTUVWXYZ", 8);
        let store = Arc::new(FlakyStore {
            inner: MemoryRunStore::new(),
            duplicates: AtomicUsize::new(0),
            broken: true,
        });
        let factory = RunEnvironmentFactory::new(Arc::clone(&config), store);

        let err = factory.create(request(), None, &[]).await.unwrap_err();
        assert!(matches!(err, WesError::Storage(StoreError::Backend(_))));
        assert_eq!(count_entries(&config.storage.tmp_dir), 0);
        assert_eq!(count_entries(&config.storage.permanent_dir), 0);
    }

    #[tokio::test]
    async fn test_exhausted_id_space_is_reported() {
        let root = tempdir().unwrap();
        let config = config(&root, "A", 1);
        let factory = RunEnvironmentFactory::new(Arc::clone(&config), Arc::new(MemoryRunStore::new()));

        factory.create(request(), None, &[]).await.unwrap();
        let err = factory.create(request(), None, &[]).await.unwrap_err();
        assert!(matches!(err, WesError::Storage(_)));
    }

    #[tokio::test]
    async fn test_discard_removes_document_and_directories() {
        let root = tempdir().unwrap();
        let config = config(&root, "ABCDEFGHIJKLMNOPQRSTUVWXYZ", 8);
        let store = Arc::new(MemoryRunStore::new());
        let factory = RunEnvironmentFactory::new(Arc::clone(&config), store.clone());

        let run = factory.create(request(), None, &[]).await.unwrap();
        factory.discard(&run).await.unwrap();

        assert!(store.is_empty());
        assert!(!run.internal.tmp_dir.exists());
        assert!(!run.internal.out_dir.exists());
    }

    #[tokio::test]
    async fn test_concurrent_creations_get_distinct_ids() {
        let root = tempdir().unwrap();
        let config = config(&root, "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789", 6);
        let store = Arc::new(MemoryRunStore::new());
        let factory = Arc::new(RunEnvironmentFactory::new(Arc::clone(&config), store));

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let factory = Arc::clone(&factory);
                tokio::spawn(async move { factory.create(request(), None, &[]).await })
            })
            .collect();

        let mut run_ids = HashSet::new();
        let mut task_ids = HashSet::new();
        for handle in handles {
            let run = handle.await.unwrap().unwrap();
            run_ids.insert(run.run_id);
            task_ids.insert(run.task_id);
        }
        assert_eq!(run_ids.len(), 20);
        assert_eq!(task_ids.len(), 20);
    }
}
