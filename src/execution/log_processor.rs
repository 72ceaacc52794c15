//! Engine Log Stream Processing
//!
//! Reads the engine wrapper's combined output as it is produced and turns
//! the lines that mention backend sub-tasks into sub-task events.
//!
//! # Recognized Lines
//!
//! ```text
//! [job main] task id: task-7f3a                       new sub-task
//! [job main] POLLING "task-7f3a", result: RUNNING     sub-task state
//! ```
//!
//! The first sighting of a sub-task emits an update without state (the
//! monitor fetches the full task log). Later state changes emit an update
//! carrying the new state. Repeats of the current state emit nothing.

use std::collections::HashMap;

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::queue::EventBus;

static NEW_SUB_TASK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[job [\w\-]*\] task id: (\S*)$").expect("valid regex"));

static SUB_TASK_POLL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\[job [\w\-]*\] POLLING ["'](\S*?)["'], result: (\w*)"#).expect("valid regex")
});

/// An FTP upload command and a step output header printed on one line.
static MERGED_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\*cmd\* .*)(\[step \w*\] produced output \{)$").expect("valid regex")
});

/// A sub-task mention extracted from one line.
#[derive(Debug, Clone, PartialEq)]
pub enum SubTaskLine {
    Announced(String),
    Polled { id: String, state: String },
}

/// Splits lines where two independent log fragments were printed together.
pub fn split_merged(line: &str) -> Vec<String> {
    match MERGED_LINE.captures(line) {
        Some(caps) => vec![caps[1].to_string(), caps[2].to_string()],
        None => vec![line.to_string()],
    }
}

/// Recognizes a sub-task announcement or poll result.
pub fn parse_sub_task_line(line: &str) -> Option<SubTaskLine> {
    if let Some(caps) = SUB_TASK_POLL.captures(line) {
        return Some(SubTaskLine::Polled {
            id: caps[1].to_string(),
            state: caps[2].to_string(),
        });
    }
    NEW_SUB_TASK
        .captures(line)
        .map(|caps| SubTaskLine::Announced(caps[1].to_string()))
}

/// Per-stream sub-task tracker of one workflow job.
pub struct LogStreamProcessor {
    task_id: String,
    token: Option<String>,
    events: EventBus,
    lines: Vec<String>,
    /// Last state seen per sub-task; `None` until a poll result arrives.
    states: HashMap<String, Option<String>>,
    order: Vec<String>,
}

impl LogStreamProcessor {
    pub fn new(task_id: impl Into<String>, token: Option<String>, events: EventBus) -> Self {
        Self {
            task_id: task_id.into(),
            token,
            events,
            lines: Vec::new(),
            states: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Consumes `reader` line by line until it is exhausted and returns the
    /// full log and the sub-task ids in order of first appearance.
    pub async fn process<R>(mut self, reader: R) -> std::io::Result<(Vec<String>, Vec<String>)>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            self.feed(&line);
        }
        Ok(self.finish())
    }

    /// Handles one raw output line.
    pub fn feed(&mut self, raw: &str) {
        for line in split_merged(raw.trim_end()) {
            debug!("[{}] {}", self.task_id, line);

            match parse_sub_task_line(&line) {
                Some(SubTaskLine::Announced(id)) => self.observe(id, None),
                Some(SubTaskLine::Polled { id, state }) => self.observe(id, Some(state)),
                None => {}
            }
            self.lines.push(line);
        }
    }

    fn observe(&mut self, id: String, state: Option<String>) {
        match self.states.get_mut(&id) {
            None => {
                self.events
                    .sub_task_update(&self.task_id, &id, None, self.token.as_deref());
                self.order.push(id.clone());
                self.states.insert(id, state);
            }
            Some(current) => {
                if state.is_some() && *current != state {
                    self.events.sub_task_update(
                        &self.task_id,
                        &id,
                        state.as_deref(),
                        self.token.as_deref(),
                    );
                    *current = state;
                }
            }
        }
    }

    pub fn finish(self) -> (Vec<String>, Vec<String>) {
        (self.lines, self.order)
    }
}
