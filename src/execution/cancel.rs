//! Run Cancellation
//!
//! A cancel request moves a cancelable run to `CANCELING` and queues a
//! `cancel_run` job. That job keeps canceling the run's backend sub-tasks
//! until the run reaches a finished state; the workflow job's own
//! completion then settles the run as `CANCELED`.
//!
//! If the cancel job runs past its soft deadline the run is forced to
//! `SYSTEM_ERROR`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use uuid::Uuid;

use crate::config::ServiceConfig;
use crate::error::{BackendError, JobError, WesError};
use crate::queue::{Job, JobContext, JobQueue};
use crate::run::{Requester, Run, State, Transition};
use crate::store::{RunKey, RunStore};

/// Body of the `cancel_run` job.
#[derive(Debug, Clone)]
pub struct CancelRunJob {
    pub run_id: String,
    /// `task_id` of the run's workflow job.
    pub run_task_id: String,
    pub token: Option<String>,
}

impl CancelRunJob {
    /// Cancels sub-tasks until the run is finished.
    pub async fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        let poll_interval = ctx.config.controller.cancel_poll_interval();
        let key = RunKey::run_id(&self.run_id);
        let mut canceled: HashSet<String> = HashSet::new();
        info!(
            "Canceling TES tasks of run '{}' (task id: '{}')",
            self.run_id, self.run_task_id
        );

        loop {
            for sub_task_id in ctx.store.sub_task_ids(&self.run_id).await? {
                if !canceled.insert(sub_task_id.clone()) {
                    continue;
                }

                match ctx.tes.cancel_task(&sub_task_id, self.token.as_deref()).await {
                    Ok(()) => info!(
                        "Requested cancellation of TES task '{}' of run '{}'",
                        sub_task_id, self.run_id
                    ),
                    Err(BackendError::AlreadyFinished(_)) => debug!(
                        "TES task '{}' of run '{}' already finished",
                        sub_task_id, self.run_id
                    ),
                    Err(e) => warn!(
                        "Could not cancel TES task '{}' of run '{}': {}",
                        sub_task_id, self.run_id, e
                    ),
                }
            }

            tokio::time::sleep(poll_interval).await;

            match ctx.store.find(&key).await? {
                Some(run) if run.state.is_finished() => {
                    info!(
                        "Run '{}' reached '{}', cancellation finished",
                        self.run_id, run.state
                    );
                    return Ok(());
                }
                Some(_) => {}
                None => {
                    warn!("Run '{}' vanished while being canceled", self.run_id);
                    return Ok(());
                }
            }
        }
    }

    /// Forces the run to `SYSTEM_ERROR` after the job timed out and records
    /// the timeout on the run.
    pub async fn on_soft_deadline(&self, ctx: &JobContext, limit: Duration) {
        let key = RunKey::run_id(&self.run_id);
        let reason = WesError::SystemTimeout(limit);
        match ctx.store.set_state(&key, State::SystemError).await {
            Ok(Some(Transition::Applied { .. })) => {
                warn!(
                    "Canceling workflow run '{}' timed out. Run state was set to '{}'",
                    self.run_id,
                    State::SystemError
                );
                let record = |run: &mut Run| {
                    run.run_log.exception = Some("SystemTimeout".to_string());
                    run.internal.traceback = Some(format!("SystemTimeout: {}", reason));
                };
                if let Err(e) = ctx.store.update(&key, &record).await {
                    warn!("Could not record cancel timeout of run '{}': {}", self.run_id, e);
                }
            }
            Ok(Some(transition)) => debug!(
                "Cancel timeout of run '{}' left state '{}'",
                self.run_id,
                transition.state()
            ),
            Ok(None) => warn!("Run '{}' not found after cancel timeout", self.run_id),
            Err(e) => warn!(
                "Could not mark run '{}' as '{}': {}",
                self.run_id,
                State::SystemError,
                e
            ),
        }
    }
}

/// Entry point of cancel requests.
pub struct CancellationCoordinator {
    config: Arc<ServiceConfig>,
    store: Arc<dyn RunStore>,
    queue: JobQueue,
}

impl CancellationCoordinator {
    pub fn new(config: Arc<ServiceConfig>, store: Arc<dyn RunStore>, queue: JobQueue) -> Self {
        Self {
            config,
            store,
            queue,
        }
    }

    /// Requests cancellation of a run and returns its `run_id`.
    ///
    /// Runs that are not cancelable (finished, or already canceling) are
    /// left untouched. Never waits for the cancellation to complete.
    pub async fn cancel(
        &self,
        run_id: &str,
        requester: Option<&Requester>,
    ) -> Result<String, WesError> {
        let key = RunKey::run_id(run_id);
        let run = self
            .store
            .find(&key)
            .await?
            .ok_or_else(|| WesError::NotFound(run_id.to_string()))?;
        run.check_access(requester)?;

        let transition = self
            .store
            .transition(&key, &|current: State| {
                if current.is_cancelable() {
                    State::Canceling
                } else {
                    current
                }
            })
            .await?
            .ok_or_else(|| WesError::NotFound(run_id.to_string()))?;

        let Transition::Applied { .. } = transition else {
            info!(
                "Run '{}' is in state '{}', nothing to cancel",
                run_id,
                transition.state()
            );
            return Ok(run_id.to_string());
        };

        info!(
            "State of run '{}' (task id: '{}') changed to '{}'",
            run_id,
            run.task_id,
            State::Canceling
        );

        let cancel_task_id = Uuid::new_v4().to_string();
        info!(
            "Canceling run '{}' as background task '{}'",
            run_id, cancel_task_id
        );
        self.queue.submit(
            cancel_task_id,
            Job::CancelRun(CancelRunJob {
                run_id: run.run_id.clone(),
                run_task_id: run.task_id.clone(),
                token: requester.and_then(|r| r.jwt.clone()),
            }),
            Some(self.config.controller.cancel_run_deadline()),
        )?;

        Ok(run_id.to_string())
    }
}
