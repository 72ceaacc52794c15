//! Error Types
//!
//! One error enum per layer: [`StoreError`] for the run store,
//! [`BackendError`] for the TES client, [`JobError`] for queued jobs and
//! [`WesError`] for everything a caller of the service can observe.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by a [`RunStore`](crate::store::RunStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique index (`run_id` or `task_id`) already holds this value.
    #[error("duplicate {field} '{value}'")]
    Duplicate { field: &'static str, value: String },

    /// The store could not complete the operation.
    #[error("store backend failure: {0}")]
    Backend(String),

    /// Reading or writing the snapshot file failed.
    #[error("snapshot I/O failed: {0}")]
    Snapshot(#[from] std::io::Error),

    /// The snapshot file could not be (de)serialized.
    #[error("snapshot encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Errors raised by a [`TesClient`](crate::tes::TesClient).
#[derive(Debug, Error)]
pub enum BackendError {
    /// The sub-task already reached a final state and cannot be canceled.
    #[error("TES task '{0}' already finished")]
    AlreadyFinished(String),

    /// The backend answered with an unexpected HTTP status.
    #[error("TES request for task '{id}' failed with status {status}")]
    Status { id: String, status: u16 },

    /// The request never produced a response.
    #[error("TES request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors raised while a queued job executes. Reported through a `Failed`
/// queue event.
#[derive(Debug, Error)]
pub enum JobError {
    /// The engine wrapper process could not be started.
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Storage(#[from] StoreError),

    /// The job ran past its soft deadline and was stopped.
    #[error("soft time limit ({0:?}) exceeded")]
    SoftTimeLimit(Duration),

    /// The job task panicked or was aborted.
    #[error("job aborted: {0}")]
    Aborted(String),
}

impl JobError {
    /// Short exception name recorded in the run log.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Spawn { .. } => "SpawnError",
            JobError::Io(_) => "IOError",
            JobError::Storage(_) => "StorageError",
            JobError::SoftTimeLimit(_) => "SoftTimeLimitExceeded",
            JobError::Aborted(_) => "WorkerLostError",
        }
    }
}

/// Errors surfaced by the run-orchestration core.
#[derive(Debug, Error)]
pub enum WesError {
    /// Malformed submission (missing or mistyped field).
    #[error("invalid run request: {0}")]
    InvalidRequest(String),

    /// Unknown run identifier.
    #[error("run '{0}' not found")]
    NotFound(String),

    /// Authorization is required but no requester identity was presented.
    #[error("authorization required")]
    Unauthenticated,

    /// Requester does not own the run.
    #[error("user '{user_id}' is not allowed to access run '{run_id}'")]
    Forbidden { user_id: String, run_id: String },

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    /// A dispatched job exceeded its soft deadline.
    #[error("soft time limit ({0:?}) exceeded")]
    SystemTimeout(Duration),

    /// Allocating or populating a run workspace failed.
    #[error("workspace error: {0}")]
    Workspace(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    /// The job queue is no longer accepting work.
    #[error("job queue closed: {0}")]
    QueueClosed(String),
}

pub type Result<T> = std::result::Result<T, WesError>;
