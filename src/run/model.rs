//! Run Data Model
//!
//! The run document persisted for every workflow submission, plus the
//! projections returned to API callers.
//!
//! # Example JSON Document
//!
//! ```json
//! {
//!   "run_id": "X7K2QA",
//!   "task_id": "9f1c5c1e-3c55-4b43-9b54-1f3c0f4f2a11",
//!   "user_id": null,
//!   "state": "RUNNING",
//!   "request": {
//!     "workflow_url": "file:///wf.cwl",
//!     "workflow_type": "CWL",
//!     "workflow_type_version": "v1.0",
//!     "workflow_params": {}
//!   },
//!   "internal": { "tmp_dir": "/data/tmp/X7K2QA", "out_dir": "/data/output/X7K2QA" },
//!   "run_log": { "time_queue": 0.12 },
//!   "task_logs": [],
//!   "outputs": {}
//! }
//! ```

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::state::State;
use crate::error::WesError;

/// JSON object type used for free-form request and output fields.
pub type JsonMap = Map<String, Value>;

/// Identity of an API caller, as established by the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub user_id: String,
    /// Bearer token forwarded to the execution backend.
    pub jwt: Option<String>,
    /// Public key the engine uses to verify `jwt`.
    pub public_key: Option<String>,
}

impl Requester {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            jwt: None,
            public_key: None,
        }
    }

    pub fn with_token(mut self, jwt: impl Into<String>, public_key: impl Into<String>) -> Self {
        self.jwt = Some(jwt.into());
        self.public_key = Some(public_key.into());
        self
    }

    /// Token and public key, if both are known.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.jwt, &self.public_key) {
            (Some(jwt), Some(key)) => Some((jwt.as_str(), key.as_str())),
            _ => None,
        }
    }
}

/// Normalized workflow-run submission.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub workflow_params: JsonMap,
    pub workflow_type: String,
    pub workflow_type_version: String,
    pub workflow_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<JsonMap>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_engine_parameters: Option<JsonMap>,
}

impl RunRequest {
    /// Creates a request with empty parameters.
    ///
    /// ```
    /// use wesrunner::run::RunRequest;
    ///
    /// let request = RunRequest::new("file:///wf.cwl", "CWL", "v1.0");
    /// assert!(request.workflow_params.is_empty());
    /// ```
    pub fn new(
        workflow_url: impl Into<String>,
        workflow_type: impl Into<String>,
        workflow_type_version: impl Into<String>,
    ) -> Self {
        Self {
            workflow_params: JsonMap::new(),
            workflow_type: workflow_type.into(),
            workflow_type_version: workflow_type_version.into(),
            workflow_url: workflow_url.into(),
            tags: None,
            workflow_engine_parameters: None,
        }
    }

    /// Sets the inline workflow parameters.
    pub fn with_params(mut self, params: JsonMap) -> Self {
        self.workflow_params = params;
        self
    }
}

/// Execution workspace and process bookkeeping. Never exposed through the
/// public run log.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Internal {
    pub tmp_dir: PathBuf,
    pub out_dir: PathBuf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_files: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param_file_path: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_received: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_finished: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id_worker: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Traceback of a fatal job failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

/// Accumulating run log. Every field is filled in by a different event.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RunLog {
    /// Command line actually executed (credentials redacted).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_received: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_started: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_finished: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utc_offset: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,

    /// Seconds between enqueue and start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_queue: Option<f64>,
    /// Seconds between start and finish.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_execution: Option<f64>,
    /// Seconds between enqueue and finish.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_total: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
}

/// Log snapshot of one TES sub-task.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TaskLog {
    pub id: String,

    /// Last state seen in the wrapper output or the backend snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    /// Most recent raw task document fetched from TES. Empty if the fetch
    /// failed.
    #[serde(default)]
    pub snapshot: JsonMap,
}

impl TaskLog {
    /// Builds a task log from a raw TES task document.
    pub fn from_snapshot(id: impl Into<String>, snapshot: Value) -> Self {
        let snapshot = match snapshot {
            Value::Object(map) => map,
            _ => JsonMap::new(),
        };
        let state = snapshot
            .get("state")
            .and_then(Value::as_str)
            .map(str::to_string);

        Self {
            id: id.into(),
            state,
            snapshot,
        }
    }

    /// Placeholder entry for a sub-task whose log could not be fetched.
    pub fn empty(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: None,
            snapshot: JsonMap::new(),
        }
    }

    pub fn has_snapshot(&self) -> bool {
        !self.snapshot.is_empty()
    }
}

/// One workflow submission and its tracked lifecycle.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Run {
    pub run_id: String,
    pub task_id: String,
    pub user_id: Option<String>,
    pub state: State,
    pub request: RunRequest,
    pub internal: Internal,
    #[serde(default)]
    pub run_log: RunLog,
    #[serde(default)]
    pub task_logs: Vec<TaskLog>,
    #[serde(default)]
    pub outputs: JsonMap,
}

impl Run {
    /// Creates the initial document for a freshly allocated run.
    pub fn new(
        run_id: impl Into<String>,
        task_id: impl Into<String>,
        user_id: Option<String>,
        request: RunRequest,
        internal: Internal,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            task_id: task_id.into(),
            user_id,
            state: State::Unknown,
            request,
            internal,
            run_log: RunLog::default(),
            task_logs: Vec::new(),
            outputs: JsonMap::new(),
        }
    }

    /// Returns true if `requester` may read or cancel this run.
    ///
    /// Without a requester identity (authorization disabled) every run is
    /// accessible.
    pub fn is_accessible_by(&self, requester: Option<&str>) -> bool {
        match requester {
            None => true,
            Some(user) => self.user_id.as_deref() == Some(user),
        }
    }

    /// Fails with `Forbidden` if `requester` does not own this run.
    pub fn check_access(&self, requester: Option<&Requester>) -> Result<(), WesError> {
        let user = requester.map(|r| r.user_id.as_str());
        if self.is_accessible_by(user) {
            Ok(())
        } else {
            Err(WesError::Forbidden {
                user_id: user.unwrap_or_default().to_string(),
                run_id: self.run_id.clone(),
            })
        }
    }

    /// Appends a sub-task log, or refreshes the entry with the same id.
    ///
    /// Entries are never removed, and an empty snapshot never replaces a
    /// populated one.
    pub fn merge_task_log(&mut self, log: TaskLog) {
        match self.task_logs.iter_mut().find(|existing| existing.id == log.id) {
            Some(existing) => {
                if log.has_snapshot() {
                    *existing = log;
                } else if log.state.is_some() {
                    existing.state = log.state;
                }
            }
            None => self.task_logs.push(log),
        }
    }

    /// Updates the recorded state of a known sub-task.
    ///
    /// Returns false if no sub-task with that id was recorded yet.
    pub fn set_task_state(&mut self, sub_task_id: &str, state: &str) -> bool {
        match self.task_logs.iter_mut().find(|log| log.id == sub_task_id) {
            Some(log) => {
                log.state = Some(state.to_string());
                log.snapshot
                    .insert("state".to_string(), Value::String(state.to_string()));
                true
            }
            None => false,
        }
    }

    /// Merges named outputs into the run. Existing keys are overwritten,
    /// nothing is removed.
    pub fn merge_outputs(&mut self, outputs: JsonMap) {
        self.outputs.extend(outputs);
    }

    /// Sub-task ids in the order they were first recorded.
    pub fn task_log_ids(&self) -> Vec<String> {
        self.task_logs.iter().map(|log| log.id.clone()).collect()
    }

    pub fn status(&self) -> RunStatus {
        RunStatus {
            run_id: self.run_id.clone(),
            state: self.state,
        }
    }

    /// Public view of the run, without the internal section.
    pub fn to_log(&self) -> RunLogView {
        RunLogView {
            run_id: self.run_id.clone(),
            request: self.request.clone(),
            state: self.state,
            run_log: self.run_log.clone(),
            task_logs: self.task_logs.clone(),
            outputs: self.outputs.clone(),
        }
    }
}

/// Response of a status query.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunStatus {
    pub run_id: String,
    pub state: State,
}

/// Full public run record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunLogView {
    pub run_id: String,
    pub request: RunRequest,
    pub state: State,
    pub run_log: RunLog,
    pub task_logs: Vec<TaskLog>,
    pub outputs: JsonMap,
}

/// One page of a run listing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunListing {
    pub runs: Vec<RunStatus>,
    /// Token for the next page; empty when this is the last page.
    pub next_page_token: String,
}
