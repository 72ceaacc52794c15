//! Job Queue Module
//!
//! In-process asynchronous job queue with a worker pool. Jobs are
//! submitted under a `task_id` with an optional soft deadline; the worker
//! reports their lifecycle on an [`EventBus`].
//!
//! # Structure
//!
//! - [`events`]: Lifecycle and sub-task events, fan-out to subscribers
//! - [`worker`]: Queue handle, worker pool, soft deadlines

pub mod events;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use crate::config::ServiceConfig;
use crate::error::JobError;
use crate::execution::{CancelRunJob, RunWorkflowJob};
use crate::store::RunStore;
use crate::tes::TesClient;

pub use events::{EventBus, EventReceiver, QueueEvent};
pub use worker::{JobQueue, JobReceiver, QueuedJob, Worker};

/// Result of a finished workflow job.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    /// Exit code of the engine wrapper; `-1` if it was killed by a signal.
    pub exit_code: i32,
    /// Combined stdout/stderr, line by line.
    pub log: Vec<String>,
    /// Sub-task ids in order of first appearance.
    pub sub_task_ids: Vec<String>,
    pub token: Option<String>,
}

/// Payload of a `Succeeded` event.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutput {
    Run(RunResult),
    Cancel,
}

/// Unit of work accepted by the queue.
#[derive(Debug, Clone)]
pub enum Job {
    RunWorkflow(RunWorkflowJob),
    CancelRun(CancelRunJob),
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::RunWorkflow(_) => "run_workflow",
            Job::CancelRun(_) => "cancel_run",
        }
    }

    /// Redacted command line, reported when the job is received.
    pub fn command(&self) -> Option<String> {
        match self {
            Job::RunWorkflow(job) => Some(job.invocation.display_command()),
            Job::CancelRun(_) => None,
        }
    }

    /// Executes the job body.
    pub async fn run(self, ctx: JobContext) -> Result<JobOutput, JobError> {
        match self {
            Job::RunWorkflow(job) => job.execute(&ctx).await.map(JobOutput::Run),
            Job::CancelRun(job) => job.execute(&ctx).await.map(|_| JobOutput::Cancel),
        }
    }

    /// Runs after the job body was stopped at its soft deadline.
    pub async fn on_soft_deadline(&self, ctx: &JobContext, limit: Duration) {
        match self {
            Job::RunWorkflow(_) => {}
            Job::CancelRun(job) => job.on_soft_deadline(ctx, limit).await,
        }
    }
}

/// Everything a job body may use.
#[derive(Clone)]
pub struct JobContext {
    /// Id under which this job was submitted.
    pub task_id: String,
    pub events: EventBus,
    pub store: Arc<dyn RunStore>,
    pub tes: Arc<dyn TesClient>,
    pub config: Arc<ServiceConfig>,
}
