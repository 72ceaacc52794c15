//! In-Memory Run Store
//!
//! Keeps run documents in a mutex-guarded map indexed by `run_id` and
//! `task_id`. The lock is held only for the duration of a single document
//! operation, which makes every operation atomic.
//!
//! With [`MemoryRunStore::with_snapshot`] the full collection is rewritten
//! to a JSON file after each mutation and reloaded on startup.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use log::{debug, info, warn};

use super::{ListQuery, RunKey, RunStore, RunUpdate, StateResolver};
use crate::error::StoreError;
use crate::run::{Run, RunListing, Transition};

#[derive(Default)]
struct Inner {
    /// run_id -> (insertion sequence, document)
    runs: HashMap<String, (u64, Run)>,
    /// task_id -> run_id
    task_index: HashMap<String, String>,
    next_seq: u64,
}

impl Inner {
    fn resolve_run_id<'a>(&'a self, key: &'a RunKey) -> Option<&'a str> {
        match key {
            RunKey::RunId(id) => self.runs.contains_key(id).then_some(id.as_str()),
            RunKey::TaskId(id) => self.task_index.get(id).map(String::as_str),
        }
    }

    fn get_mut(&mut self, key: &RunKey) -> Option<&mut Run> {
        let run_id = self.resolve_run_id(key)?.to_string();
        self.runs.get_mut(&run_id).map(|(_, run)| run)
    }

    fn insert(&mut self, run: Run) -> Result<(), StoreError> {
        if self.runs.contains_key(&run.run_id) {
            return Err(StoreError::Duplicate {
                field: "run_id",
                value: run.run_id,
            });
        }
        if self.task_index.contains_key(&run.task_id) {
            return Err(StoreError::Duplicate {
                field: "task_id",
                value: run.task_id,
            });
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.task_index.insert(run.task_id.clone(), run.run_id.clone());
        self.runs.insert(run.run_id.clone(), (seq, run));
        Ok(())
    }

    /// Documents in insertion order.
    fn ordered(&self) -> Vec<&(u64, Run)> {
        let mut entries: Vec<_> = self.runs.values().collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries
    }
}

/// Run store kept in process memory.
///
/// # Example
///
/// ```rust
/// use wesrunner::store::{MemoryRunStore, RunKey, RunStore};
///
/// # async fn demo() -> Result<(), wesrunner::error::StoreError> {
/// let store = MemoryRunStore::new();
/// assert!(store.find(&RunKey::run_id("missing")).await?.is_none());
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct MemoryRunStore {
    inner: Mutex<Inner>,
    snapshot: Option<PathBuf>,
}

impl MemoryRunStore {
    /// Creates an empty, purely in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store backed by a JSON snapshot file.
    ///
    /// Existing documents are loaded if the file exists.
    pub fn with_snapshot(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let mut inner = Inner::default();

        if path.exists() {
            let content = fs::read_to_string(&path)?;
            let runs: Vec<Run> = serde_json::from_str(&content)?;
            info!("Loaded {} runs from snapshot {}", runs.len(), path.display());
            for run in runs {
                inner.insert(run)?;
            }
        }

        Ok(Self {
            inner: Mutex::new(inner),
            snapshot: Some(path),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("run store lock poisoned".to_string()))
    }

    /// Rewrites the snapshot file, if one is configured.
    fn persist(&self, inner: &Inner) -> Result<(), StoreError> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };

        let runs: Vec<&Run> = inner.ordered().into_iter().map(|(_, run)| run).collect();
        write_snapshot(path, &serde_json::to_vec_pretty(&runs)?)?;
        debug!("Saved {} runs to {}", runs.len(), path.display());
        Ok(())
    }

    /// Number of stored runs.
    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.runs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Writes via a temporary file so a crash never leaves a truncated snapshot.
fn write_snapshot(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn insert(&self, run: Run) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let (run_id, task_id) = (run.run_id.clone(), run.task_id.clone());
        inner.insert(run)?;

        if let Err(e) = self.persist(&inner) {
            inner.runs.remove(&run_id);
            inner.task_index.remove(&task_id);
            return Err(e);
        }
        Ok(())
    }

    async fn find(&self, key: &RunKey) -> Result<Option<Run>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .resolve_run_id(key)
            .and_then(|run_id| inner.runs.get(run_id))
            .map(|(_, run)| run.clone()))
    }

    async fn update(
        &self,
        key: &RunKey,
        apply: &RunUpdate<'_>,
    ) -> Result<Option<Run>, StoreError> {
        let mut inner = self.lock()?;
        let Some(current) = inner.get_mut(key) else {
            return Ok(None);
        };

        let mut updated = current.clone();
        apply(&mut updated);
        if updated.state != current.state
            || updated.run_id != current.run_id
            || updated.task_id != current.task_id
        {
            warn!("Discarding write to protected fields of run '{}'", current.run_id);
            updated.state = current.state;
            updated.run_id = current.run_id.clone();
            updated.task_id = current.task_id.clone();
        }

        let previous = std::mem::replace(current, updated.clone());
        if let Err(e) = self.persist(&inner) {
            if let Some(run) = inner.get_mut(key) {
                *run = previous;
            }
            return Err(e);
        }
        Ok(Some(updated))
    }

    async fn transition(
        &self,
        key: &RunKey,
        resolve: &StateResolver<'_>,
    ) -> Result<Option<Transition>, StoreError> {
        let mut inner = self.lock()?;
        let Some(run) = inner.get_mut(key) else {
            return Ok(None);
        };

        let transition = Transition::resolve(run.state, resolve(run.state));
        if let Transition::Applied { from, to } = transition {
            run.state = to;
            if let Err(e) = self.persist(&inner) {
                if let Some(run) = inner.get_mut(key) {
                    run.state = from;
                }
                return Err(e);
            }
        }
        Ok(Some(transition))
    }

    async fn sub_task_ids(&self, run_id: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.lock()?;
        let mut ids: Vec<String> = Vec::new();
        if let Some((_, run)) = inner.runs.get(run_id) {
            for id in run.task_log_ids() {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }

    async fn delete(&self, key: &RunKey) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        let Some(run_id) = inner.resolve_run_id(key).map(str::to_string) else {
            return Ok(false);
        };

        let Some((seq, run)) = inner.runs.remove(&run_id) else {
            return Ok(false);
        };
        inner.task_index.remove(&run.task_id);

        if let Err(e) = self.persist(&inner) {
            inner.task_index.insert(run.task_id.clone(), run_id.clone());
            inner.runs.insert(run_id, (seq, run));
            return Err(e);
        }
        Ok(true)
    }

    async fn list(&self, query: &ListQuery) -> Result<RunListing, StoreError> {
        let before = match &query.page_token {
            Some(token) if !token.is_empty() => Some(
                token
                    .parse::<u64>()
                    .map_err(|_| StoreError::Backend(format!("invalid page token '{}'", token)))?,
            ),
            _ => None,
        };

        let inner = self.lock()?;
        let page: Vec<&(u64, Run)> = inner
            .ordered()
            .into_iter()
            .rev()
            .filter(|(seq, _)| before.map_or(true, |b| *seq < b))
            .filter(|(_, run)| match &query.user_id {
                Some(user) => run.user_id.as_deref() == Some(user.as_str()),
                None => true,
            })
            .take(query.page_size)
            .collect();

        let next_page_token = match page.last() {
            Some((seq, _)) if page.len() == query.page_size => seq.to_string(),
            _ => String::new(),
        };

        Ok(RunListing {
            runs: page.iter().map(|(_, run)| run.status()).collect(),
            next_page_token,
        })
    }
}
