//! Worker Pool
//!
//! Drains the job queue and executes jobs concurrently:
//! - `Received` is emitted as soon as a job is taken off the queue
//! - a semaphore bounds how many job bodies run at once
//! - each body runs in its own task, so a panic becomes a `Failed` event
//! - a soft deadline aborts the body, runs the job's deadline hook and
//!   reports `Failed` with a `SoftTimeLimitExceeded` traceback

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Utc};
use log::{debug, error, info, warn};
use sysinfo::System;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::{EventBus, Job, JobContext, QueueEvent};
use crate::config::ServiceConfig;
use crate::error::{JobError, WesError};
use crate::store::RunStore;
use crate::tes::TesClient;

/// A job waiting in the queue.
#[derive(Debug)]
pub struct QueuedJob {
    pub task_id: String,
    pub job: Job,
    pub soft_deadline: Option<Duration>,
}

/// Submission handle of the job queue.
#[derive(Debug, Clone)]
pub struct JobQueue {
    sender: mpsc::UnboundedSender<QueuedJob>,
}

/// Consuming end of the job queue, handed to a [`Worker`].
#[derive(Debug)]
pub struct JobReceiver {
    receiver: mpsc::UnboundedReceiver<QueuedJob>,
}

impl JobQueue {
    pub fn new() -> (Self, JobReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, JobReceiver { receiver })
    }

    /// Enqueues a job. Never waits for the job to run.
    pub fn submit(
        &self,
        task_id: impl Into<String>,
        job: Job,
        soft_deadline: Option<Duration>,
    ) -> Result<(), WesError> {
        let task_id = task_id.into();
        debug!("Enqueuing job '{}' ({})", task_id, job.name());

        self.sender
            .send(QueuedJob {
                task_id,
                job,
                soft_deadline,
            })
            .map_err(|e| WesError::QueueClosed(format!("job '{}' not accepted", e.0.task_id)))
    }
}

impl JobReceiver {
    /// Takes the next job, waiting until one is available.
    pub async fn next(&mut self) -> Option<QueuedJob> {
        self.receiver.recv().await
    }
}

/// Executes queued jobs.
pub struct Worker {
    config: Arc<ServiceConfig>,
    store: Arc<dyn RunStore>,
    tes: Arc<dyn TesClient>,
    events: EventBus,
    slots: Arc<Semaphore>,
    host: String,
}

impl Worker {
    pub fn new(
        config: Arc<ServiceConfig>,
        store: Arc<dyn RunStore>,
        tes: Arc<dyn TesClient>,
        events: EventBus,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.worker.concurrency.max(1)));
        let host = System::host_name().unwrap_or_else(|| "localhost".to_string());

        Self {
            config,
            store,
            tes,
            events,
            slots,
            host,
        }
    }

    /// Starts draining `receiver` in the background. The task ends once
    /// every [`JobQueue`] handle is dropped.
    pub fn spawn(self, receiver: JobReceiver) -> JoinHandle<()> {
        tokio::spawn(self.run(receiver))
    }

    async fn run(self, mut receiver: JobReceiver) {
        info!(
            "Worker started on {} (concurrency: {})",
            self.host,
            self.slots.available_permits()
        );

        while let Some(queued) = receiver.next().await {
            self.announce(&queued);

            let ctx = self.context(&queued.task_id);
            let slots = Arc::clone(&self.slots);

            tokio::spawn(async move {
                let Ok(_permit) = slots.acquire_owned().await else {
                    warn!("Worker shut down before job '{}' could run", queued.task_id);
                    return;
                };
                execute(queued, ctx).await;
            });
        }

        info!("Job queue closed, worker stopping");
    }

    fn context(&self, task_id: &str) -> JobContext {
        JobContext {
            task_id: task_id.to_string(),
            events: self.events.clone(),
            store: Arc::clone(&self.store),
            tes: Arc::clone(&self.tes),
            config: Arc::clone(&self.config),
        }
    }

    fn announce(&self, queued: &QueuedJob) {
        let timestamp = Utc::now();
        let expires = queued
            .soft_deadline
            .and_then(|limit| chrono::Duration::from_std(limit).ok())
            .map(|limit| timestamp + limit);

        self.events.publish(QueueEvent::Received {
            task_id: queued.task_id.clone(),
            job_name: queued.job.name(),
            timestamp,
            host: self.host.clone(),
            pid: std::process::id(),
            command: queued.job.command(),
            retries: 0,
            utc_offset: Local::now().offset().local_minus_utc() / 3600,
            expires,
        });
    }
}

/// Runs one job body and reports how it ended.
async fn execute(queued: QueuedJob, ctx: JobContext) {
    let QueuedJob {
        task_id,
        job,
        soft_deadline,
    } = queued;
    let events = ctx.events.clone();

    events.publish(QueueEvent::Started {
        task_id: task_id.clone(),
        timestamp: Utc::now(),
    });
    info!("Job '{}' ({}) started", task_id, job.name());

    let hook = (job.clone(), ctx.clone());
    let mut handle = tokio::spawn(job.run(ctx));

    let joined = match soft_deadline {
        Some(limit) => match timeout(limit, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                handle.abort();
                warn!("Job '{}' exceeded its soft time limit of {:?}", task_id, limit);
                let (job, ctx) = hook;
                job.on_soft_deadline(&ctx, limit).await;
                Ok(Err(JobError::SoftTimeLimit(limit)))
            }
        },
        None => (&mut handle).await,
    };

    let result = joined.unwrap_or_else(|e| Err(JobError::Aborted(e.to_string())));
    let timestamp = Utc::now();

    match result {
        Ok(output) => {
            info!("Job '{}' succeeded", task_id);
            events.publish(QueueEvent::Succeeded {
                task_id,
                timestamp,
                output,
            });
        }
        Err(err) => {
            error!("Job '{}' failed: {}", task_id, err);
            events.publish(QueueEvent::Failed {
                task_id,
                timestamp,
                exception: err.kind().to_string(),
                traceback: format!("{}: {}", err.kind(), err),
            });
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::execution::{Invocation, RunWorkflowJob};
    use crate::queue::{EventReceiver, JobOutput};
    use crate::store::MemoryRunStore;
    use crate::tes::HttpTesClient;

    fn worker(events: &EventBus) -> Worker {
        let config = Arc::new(ServiceConfig::default());
        let tes = HttpTesClient::with_timeout("http://127.0.0.1:9", "FULL", Duration::from_millis(100))
            .unwrap();
        Worker::new(config, Arc::new(MemoryRunStore::new()), Arc::new(tes), events.clone())
    }

    fn shell_job(script: &str) -> Job {
        let argv = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
        Job::RunWorkflow(RunWorkflowJob::new(
            Invocation::new(argv, std::env::temp_dir()),
            None,
        ))
    }

    async fn next_for(rx: &mut EventReceiver, task_id: &str) -> QueueEvent {
        loop {
            let event = rx.recv().await.unwrap();
            if event.task_id() == task_id {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_lifecycle_events_in_order() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let (queue, receiver) = JobQueue::new();
        worker(&events).spawn(receiver);

        queue.submit("job-1", shell_job("echo '{}'"), None).unwrap();

        match next_for(&mut rx, "job-1").await {
            QueueEvent::Received { command, job_name, .. } => {
                assert_eq!(job_name, "run_workflow");
                assert!(command.unwrap().starts_with("sh -c"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(next_for(&mut rx, "job-1").await.kind(), "task-started");
        match next_for(&mut rx, "job-1").await {
            QueueEvent::Succeeded {
                output: JobOutput::Run(result),
                ..
            } => {
                assert_eq!(result.exit_code, 0);
                assert_eq!(result.log, vec!["{}"]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_soft_deadline_reports_failure() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let (queue, receiver) = JobQueue::new();
        worker(&events).spawn(receiver);

        queue
            .submit("job-slow", shell_job("sleep 5"), Some(Duration::from_millis(100)))
            .unwrap();

        let failed = loop {
            let event = next_for(&mut rx, "job-slow").await;
            if let QueueEvent::Failed { .. } = event {
                break event;
            }
        };
        match failed {
            QueueEvent::Failed {
                exception, traceback, ..
            } => {
                assert_eq!(exception, "SoftTimeLimitExceeded");
                assert!(traceback.contains("soft time limit"));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_submit_after_worker_gone_fails() {
        let (queue, receiver) = JobQueue::new();
        drop(receiver);
        let err = queue.submit("job-1", shell_job("true"), None).unwrap_err();
        assert!(matches!(err, WesError::QueueClosed(_)));
    }
}
