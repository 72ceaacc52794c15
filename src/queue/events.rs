//! Queue Events
//!
//! Lifecycle events emitted by the worker pool for every job, plus the
//! custom sub-task events emitted by a running workflow job. Every
//! subscriber owns an unbounded channel: events are never dropped for a
//! slow subscriber, and each one sees them in send order.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use log::debug;
use tokio::sync::mpsc;

use super::JobOutput;

/// One event on the queue's event stream.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// A worker accepted the job.
    Received {
        task_id: String,
        job_name: &'static str,
        timestamp: DateTime<Utc>,
        host: String,
        pid: u32,
        /// Redacted command line, for jobs that run one.
        command: Option<String>,
        retries: u32,
        /// Hours east of UTC on the worker.
        utc_offset: i32,
        /// When the soft deadline elapses, measured from receipt.
        expires: Option<DateTime<Utc>>,
    },

    /// The job body began executing.
    Started {
        task_id: String,
        timestamp: DateTime<Utc>,
    },

    /// The job body returned normally.
    Succeeded {
        task_id: String,
        timestamp: DateTime<Utc>,
        output: JobOutput,
    },

    /// The job body raised, panicked or ran past its soft deadline.
    Failed {
        task_id: String,
        timestamp: DateTime<Utc>,
        exception: String,
        traceback: String,
    },

    /// A sub-task was seen for the first time (`state` is `None`) or changed
    /// state.
    SubTaskUpdate {
        task_id: String,
        timestamp: DateTime<Utc>,
        sub_task_id: String,
        state: Option<String>,
        token: Option<String>,
    },
}

impl QueueEvent {
    /// Id of the job the event belongs to.
    pub fn task_id(&self) -> &str {
        match self {
            QueueEvent::Received { task_id, .. }
            | QueueEvent::Started { task_id, .. }
            | QueueEvent::Succeeded { task_id, .. }
            | QueueEvent::Failed { task_id, .. }
            | QueueEvent::SubTaskUpdate { task_id, .. } => task_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            QueueEvent::Received { .. } => "task-received",
            QueueEvent::Started { .. } => "task-started",
            QueueEvent::Succeeded { .. } => "task-succeeded",
            QueueEvent::Failed { .. } => "task-failed",
            QueueEvent::SubTaskUpdate { .. } => "task-tes-task-update",
        }
    }
}

/// Receiving end of an [`EventBus`] subscription.
pub type EventReceiver = mpsc::UnboundedReceiver<QueueEvent>;

/// Fan-out of [`QueueEvent`]s to every subscriber.
///
/// Subscriptions end once every clone of the bus is dropped.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<QueueEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> EventReceiver {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sender);
        receiver
    }

    /// Sends an event to every current subscriber.
    ///
    /// Events sent while nobody listens are dropped.
    pub fn publish(&self, event: QueueEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|sender| !sender.is_closed());

        match subscribers.split_last() {
            Some((last, rest)) => {
                for sender in rest {
                    let _ = sender.send(event.clone());
                }
                let _ = last.send(event);
            }
            None => debug!(
                "No subscriber for '{}' event of task '{}'",
                event.kind(),
                event.task_id()
            ),
        }
    }

    /// Emits a sub-task update for `task_id`.
    pub fn sub_task_update(
        &self,
        task_id: &str,
        sub_task_id: &str,
        state: Option<&str>,
        token: Option<&str>,
    ) {
        self.publish(QueueEvent::SubTaskUpdate {
            task_id: task_id.to_string(),
            timestamp: Utc::now(),
            sub_task_id: sub_task_id.to_string(),
            state: state.map(str::to_string),
            token: token.map(str::to_string),
        });
    }
}
