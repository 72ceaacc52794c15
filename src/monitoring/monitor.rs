//! Task Monitor
//!
//! Long-lived subscriber to the queue's event stream. It is the only
//! component that moves a run through its execution states:
//!
//! | Event              | Recorded                                   | State                        |
//! |--------------------|--------------------------------------------|------------------------------|
//! | `Received`         | host, pid, command, retries, expiry        | `QUEUED`                     |
//! | `Started`          | start time, `time_queue`                   | `RUNNING`                    |
//! | `SubTaskUpdate`    | sub-task log or sub-task state             |                              |
//! | `Succeeded`        | outputs, task logs, exit code, durations   | `COMPLETE`, `EXECUTOR_ERROR` or `CANCELED` |
//! | `Failed`           | traceback, exception, durations            | `SYSTEM_ERROR`               |
//!
//! Events are handled one at a time in arrival order. A handler that fails
//! or panics is logged and the loop carries on with the next event.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use super::timeline::{format_timestamp, RunTimeline};
use crate::config::ServiceConfig;
use crate::error::StoreError;
use crate::execution::parse_outputs;
use crate::queue::{EventBus, EventReceiver, JobOutput, QueueEvent, RunResult};
use crate::run::{Run, State, TaskLog, Transition};
use crate::store::{RunKey, RunStore};
use crate::tes::TesClient;

/// Applies queue events to run documents.
pub struct TaskMonitor {
    store: Arc<dyn RunStore>,
    tes: Arc<dyn TesClient>,
    fetch_timeout: Duration,
    restart_delay: Duration,
}

impl TaskMonitor {
    pub fn new(
        config: Arc<ServiceConfig>,
        store: Arc<dyn RunStore>,
        tes: Arc<dyn TesClient>,
    ) -> Self {
        Self {
            store,
            tes,
            fetch_timeout: config.controller.tes_server.timeout(),
            restart_delay: config.worker.monitor_restart_delay(),
        }
    }

    /// Subscribes to `events` and handles them in the background. The
    /// subscription exists once this returns, so no later event is missed.
    ///
    /// The task ends when every clone of the bus is dropped.
    pub fn spawn(self, events: &EventBus) -> JoinHandle<()> {
        let receiver = events.subscribe();
        tokio::spawn(Arc::new(self).run(receiver))
    }

    async fn run(self: Arc<Self>, mut receiver: EventReceiver) {
        info!("Task monitor started");

        while let Some(event) = receiver.recv().await {
            let task_id = event.task_id().to_string();
            let kind = event.kind();
            let monitor = Arc::clone(&self);

            // A panicking handler must not take the loop down with it
            if let Err(e) = tokio::spawn(async move { monitor.handle(event).await }).await {
                error!(
                    "Handler for '{}' event of task '{}' crashed: {}",
                    kind, task_id, e
                );
                sleep(self.restart_delay).await;
            }
        }

        info!("Event stream closed, task monitor stopping");
    }

    /// Applies one event. Store failures are logged, never returned.
    pub async fn handle(&self, event: QueueEvent) {
        let task_id = event.task_id().to_string();
        let kind = event.kind();
        debug!("Received '{}' event for task '{}'", kind, task_id);

        let result = match event {
            QueueEvent::Received {
                task_id,
                timestamp,
                host,
                pid,
                command,
                retries,
                utc_offset,
                expires,
                ..
            } => {
                self.on_received(
                    &task_id,
                    Receipt {
                        timestamp,
                        host,
                        pid,
                        command,
                        retries,
                        utc_offset,
                        expires,
                    },
                )
                .await
            }
            QueueEvent::Started { task_id, timestamp } => {
                self.on_started(&task_id, timestamp).await
            }
            QueueEvent::Failed {
                task_id,
                timestamp,
                exception,
                traceback,
            } => self.on_failed(&task_id, timestamp, exception, traceback).await,
            QueueEvent::Succeeded {
                task_id,
                timestamp,
                output,
            } => match output {
                JobOutput::Run(result) => self.on_succeeded(&task_id, timestamp, result).await,
                JobOutput::Cancel => Ok(()),
            },
            QueueEvent::SubTaskUpdate {
                task_id,
                sub_task_id,
                state,
                token,
                ..
            } => {
                self.on_sub_task_update(&task_id, &sub_task_id, state, token)
                    .await
            }
        };

        if let Err(e) = result {
            error!(
                "Could not apply '{}' event of task '{}': {}",
                kind, task_id, e
            );
        }
    }

    async fn on_received(&self, task_id: &str, receipt: Receipt) -> Result<(), StoreError> {
        let key = RunKey::task_id(task_id);
        let updated = self
            .store
            .update(&key, &|run: &mut Run| {
                run.internal.task_received = Some(receipt.timestamp);
                run.internal.process_id_worker = Some(receipt.pid);
                run.internal.host = Some(receipt.host.clone());

                let log = &mut run.run_log;
                log.task_received = Some(format_timestamp(receipt.timestamp));
                log.command = receipt.command.clone();
                log.utc_offset = Some(receipt.utc_offset);
                log.max_retries = Some(receipt.retries);
                log.expires = receipt.expires.map(format_timestamp);
            })
            .await?;

        let Some(run) = updated else {
            debug!("No run for task '{}', ignoring receipt", task_id);
            return Ok(());
        };
        self.set_state(&run.run_id, task_id, State::Queued).await
    }

    async fn on_started(&self, task_id: &str, timestamp: DateTime<Utc>) -> Result<(), StoreError> {
        let key = RunKey::task_id(task_id);
        let updated = self
            .store
            .update(&key, &|run: &mut Run| {
                run.internal.task_started = Some(timestamp);
                run.run_log.task_started = Some(format_timestamp(timestamp));
                RunTimeline::of(&run.internal).apply(&mut run.run_log);
            })
            .await?;

        let Some(run) = updated else {
            debug!("No run for task '{}', ignoring start", task_id);
            return Ok(());
        };
        self.set_state(&run.run_id, task_id, State::Running).await
    }

    async fn on_failed(
        &self,
        task_id: &str,
        timestamp: DateTime<Utc>,
        exception: String,
        traceback: String,
    ) -> Result<(), StoreError> {
        let key = RunKey::task_id(task_id);
        let updated = self
            .store
            .update(&key, &|run: &mut Run| {
                run.internal.task_finished = Some(timestamp);
                run.internal.traceback = Some(traceback.clone());
                run.run_log.task_finished = Some(format_timestamp(timestamp));
                run.run_log.exception = Some(exception.clone());
                RunTimeline::of(&run.internal).apply(&mut run.run_log);
            })
            .await?;

        let Some(run) = updated else {
            debug!("No run for task '{}', ignoring failure", task_id);
            return Ok(());
        };
        warn!("Run '{}' failed: {}", run.run_id, traceback);
        self.set_state(&run.run_id, task_id, State::SystemError).await
    }

    async fn on_succeeded(
        &self,
        task_id: &str,
        timestamp: DateTime<Utc>,
        result: RunResult,
    ) -> Result<(), StoreError> {
        let key = RunKey::task_id(task_id);
        let Some(run) = self.store.find(&key).await? else {
            debug!("No run for task '{}', ignoring result", task_id);
            return Ok(());
        };

        let outputs = parse_outputs(&result.log).unwrap_or_default();

        let mut task_logs = Vec::with_capacity(result.sub_task_ids.len());
        for sub_task_id in &result.sub_task_ids {
            task_logs.push(self.fetch_task_log(sub_task_id, result.token.as_deref()).await);
        }

        let stdout = result.log.join("\n");
        self.store
            .update(&key, &|run: &mut Run| {
                run.internal.task_finished = Some(timestamp);
                run.merge_outputs(outputs.clone());
                for log in &task_logs {
                    run.merge_task_log(log.clone());
                }

                let log = &mut run.run_log;
                log.exit_code = Some(result.exit_code);
                log.stdout = Some(stdout.clone());
                log.stderr = Some(String::new());
                log.task_finished = Some(format_timestamp(timestamp));
                RunTimeline::of(&run.internal).apply(&mut run.run_log);
            })
            .await?;

        let exit_code = result.exit_code;
        let transition = self
            .store
            .transition(&key, &|current: State| {
                if current == State::Canceling {
                    State::Canceled
                } else if exit_code != 0 {
                    State::ExecutorError
                } else {
                    State::Complete
                }
            })
            .await?;

        if let Some(transition) = transition {
            log_transition(&run.run_id, task_id, transition);
        }
        Ok(())
    }

    async fn on_sub_task_update(
        &self,
        task_id: &str,
        sub_task_id: &str,
        state: Option<String>,
        token: Option<String>,
    ) -> Result<(), StoreError> {
        let key = RunKey::task_id(task_id);
        if self.store.find(&key).await?.is_none() {
            debug!(
                "No run for task '{}', ignoring update of sub-task '{}'",
                task_id, sub_task_id
            );
            return Ok(());
        }

        match state {
            None => {
                let log = self.fetch_task_log(sub_task_id, token.as_deref()).await;
                self.store
                    .update(&key, &|run: &mut Run| run.merge_task_log(log.clone()))
                    .await?;
                info!("Recorded sub-task '{}' of task '{}'", sub_task_id, task_id);
            }
            Some(state) => {
                self.store
                    .update(&key, &|run: &mut Run| {
                        if !run.set_task_state(sub_task_id, &state) {
                            debug!("Sub-task '{}' not recorded yet, state dropped", sub_task_id);
                        }
                    })
                    .await?;
                debug!("Sub-task '{}' of task '{}' is {}", sub_task_id, task_id, state);
            }
        }
        Ok(())
    }

    /// Fetches a sub-task log. Failures yield an empty entry.
    async fn fetch_task_log(&self, sub_task_id: &str, token: Option<&str>) -> TaskLog {
        match timeout(self.fetch_timeout, self.tes.get_task(sub_task_id, token)).await {
            Ok(Ok(document)) => TaskLog::from_snapshot(sub_task_id, document),
            Ok(Err(e)) => {
                warn!("Could not fetch log of sub-task '{}': {}", sub_task_id, e);
                TaskLog::empty(sub_task_id)
            }
            Err(_) => {
                warn!(
                    "Fetching log of sub-task '{}' timed out after {:?}",
                    sub_task_id, self.fetch_timeout
                );
                TaskLog::empty(sub_task_id)
            }
        }
    }

    async fn set_state(&self, run_id: &str, task_id: &str, target: State) -> Result<(), StoreError> {
        if let Some(transition) = self.store.set_state(&RunKey::task_id(task_id), target).await? {
            log_transition(run_id, task_id, transition);
        }
        Ok(())
    }
}

/// Worker metadata carried by a `Received` event.
struct Receipt {
    timestamp: DateTime<Utc>,
    host: String,
    pid: u32,
    command: Option<String>,
    retries: u32,
    utc_offset: i32,
    expires: Option<DateTime<Utc>>,
}

fn log_transition(run_id: &str, task_id: &str, transition: Transition) {
    match transition {
        Transition::Applied { to, .. } => info!(
            "State of run '{}' (task id: '{}') changed to '{}'",
            run_id, task_id, to
        ),
        Transition::Unchanged(state) => {
            debug!("Run '{}' already in state '{}'", run_id, state)
        }
        Transition::Rejected { current, requested } => warn!(
            "Rejected state change of run '{}' (task id: '{}') from '{}' to '{}'",
            run_id, task_id, current, requested
        ),
    }
}
