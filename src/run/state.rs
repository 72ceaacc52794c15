//! Run State Machine
//!
//! Defines the WES run states and the only transitions the core is allowed
//! to perform:
//!
//! ```text
//! UNKNOWN -> QUEUED -> RUNNING -> COMPLETE | EXECUTOR_ERROR | SYSTEM_ERROR
//! QUEUED | INITIALIZING | PAUSED | RUNNING -> CANCELING -> CANCELED
//! CANCELING -> SYSTEM_ERROR
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// State of a workflow run.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Unknown,
    Queued,
    Initializing,
    Running,
    Paused,
    Complete,
    ExecutorError,
    SystemError,
    Canceled,
    Canceling,
}

impl State {
    /// All states, in declaration order.
    pub const ALL: [State; 10] = [
        State::Unknown,
        State::Queued,
        State::Initializing,
        State::Running,
        State::Paused,
        State::Complete,
        State::ExecutorError,
        State::SystemError,
        State::Canceled,
        State::Canceling,
    ];

    /// States from which a cancel request starts cancellation.
    pub fn is_cancelable(self) -> bool {
        matches!(
            self,
            State::Initializing | State::Paused | State::Queued | State::Running
        )
    }

    /// Terminal states. No transition leaves them.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            State::Complete | State::Canceled | State::ExecutorError | State::SystemError
        )
    }

    /// Returns true if the state machine allows `self -> next`.
    pub fn can_transition_to(self, next: State) -> bool {
        use State::*;

        match (self, next) {
            (Unknown, Queued) => true,
            (Queued, Running) => true,
            (Running, Complete | ExecutorError | SystemError) => true,
            (from, Canceling) => from.is_cancelable(),
            (Canceling, Canceled | SystemError) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Unknown => "UNKNOWN",
            State::Queued => "QUEUED",
            State::Initializing => "INITIALIZING",
            State::Running => "RUNNING",
            State::Paused => "PAUSED",
            State::Complete => "COMPLETE",
            State::ExecutorError => "EXECUTOR_ERROR",
            State::SystemError => "SYSTEM_ERROR",
            State::Canceled => "CANCELED",
            State::Canceling => "CANCELING",
        }
    }
}

impl Default for State {
    fn default() -> Self {
        State::Unknown
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        State::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown run state '{}'", s))
    }
}

/// Outcome of an attempted state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The state changed.
    Applied { from: State, to: State },
    /// The resolver asked for the current state again; nothing was written.
    Unchanged(State),
    /// The requested change is not an edge of the state machine.
    Rejected { current: State, requested: State },
}

impl Transition {
    /// Resolves a requested state against the current one.
    pub fn resolve(current: State, requested: State) -> Self {
        if current == requested {
            Transition::Unchanged(current)
        } else if current.can_transition_to(requested) {
            Transition::Applied {
                from: current,
                to: requested,
            }
        } else {
            Transition::Rejected { current, requested }
        }
    }

    /// State the run holds after this transition.
    pub fn state(&self) -> State {
        match *self {
            Transition::Applied { to, .. } => to,
            Transition::Unchanged(state) => state,
            Transition::Rejected { current, .. } => current,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied { .. })
    }
}
