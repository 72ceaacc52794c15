//! Run Monitoring Module
//!
//! Turns the queue's event stream into run state, timing and log updates.
//!
//! # Components
//!
//! - [`TaskMonitor`]: The event loop driving the run state machine
//! - [`RunTimeline`]: Queue, execution and total durations of a run

pub mod monitor;
pub mod timeline;

pub use monitor::TaskMonitor;
pub use timeline::{format_timestamp, RunTimeline};
