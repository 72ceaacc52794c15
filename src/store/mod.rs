//! Run Store
//!
//! Persistence abstraction over run documents. Every mutation is an atomic
//! single-document operation; the store is the only serialization point
//! between concurrent writers of the same run.
//!
//! - [`RunStore`]: the operations the core requires
//! - [`MemoryRunStore`]: in-process implementation with optional JSON
//!   snapshot persistence

pub mod memory;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::run::{Run, RunListing, State, Transition};

pub use memory::MemoryRunStore;

/// Unique key addressing a single run document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RunKey {
    RunId(String),
    TaskId(String),
}

impl RunKey {
    pub fn run_id(id: impl Into<String>) -> Self {
        RunKey::RunId(id.into())
    }

    pub fn task_id(id: impl Into<String>) -> Self {
        RunKey::TaskId(id.into())
    }
}

impl std::fmt::Display for RunKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunKey::RunId(id) => write!(f, "run_id '{}'", id),
            RunKey::TaskId(id) => write!(f, "task_id '{}'", id),
        }
    }
}

/// Field update applied to a run document. Changes to `state`, `run_id`
/// and `task_id` are discarded by the store.
pub type RunUpdate<'a> = dyn Fn(&mut Run) + Send + Sync + 'a;

/// Picks the next state given the current one.
pub type StateResolver<'a> = dyn Fn(State) -> State + Send + Sync + 'a;

/// Filter and paging for [`RunStore::list`].
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    /// Only runs owned by this user.
    pub user_id: Option<String>,
    pub page_size: usize,
    /// Opaque token returned by a previous page.
    pub page_token: Option<String>,
}

/// Persistent store of run documents.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Inserts a new run.
    ///
    /// Fails with [`StoreError::Duplicate`] if `run_id` or `task_id` is
    /// already taken.
    async fn insert(&self, run: Run) -> Result<(), StoreError>;

    /// Looks up a run.
    async fn find(&self, key: &RunKey) -> Result<Option<Run>, StoreError>;

    /// Atomically applies `apply` to the run and returns the updated
    /// document, or `None` if no run matches.
    async fn update(&self, key: &RunKey, apply: &RunUpdate<'_>)
        -> Result<Option<Run>, StoreError>;

    /// Atomically reads the current state, asks `resolve` for the next one
    /// and writes it if the state machine allows the change.
    ///
    /// Returns `None` if no run matches.
    async fn transition(
        &self,
        key: &RunKey,
        resolve: &StateResolver<'_>,
    ) -> Result<Option<Transition>, StoreError>;

    /// Distinct sub-task ids recorded in the run's task logs.
    async fn sub_task_ids(&self, run_id: &str) -> Result<Vec<String>, StoreError>;

    /// Removes a run. Returns false if nothing matched.
    async fn delete(&self, key: &RunKey) -> Result<bool, StoreError>;

    /// Lists runs newest first.
    async fn list(&self, query: &ListQuery) -> Result<RunListing, StoreError>;

    /// Writes a fixed target state, subject to the state machine.
    async fn set_state(
        &self,
        key: &RunKey,
        target: State,
    ) -> Result<Option<Transition>, StoreError> {
        self.transition(key, &move |_: State| target).await
    }
}
