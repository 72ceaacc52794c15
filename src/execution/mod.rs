//! Execution Module
//!
//! Everything that happens between "run persisted" and "engine exited":
//!
//! - [`dispatcher`]: Builds the engine command line and queues the job
//! - [`job`]: The workflow job body, running the engine process
//! - [`log_processor`]: Sub-task detection in the engine's output
//! - [`outputs`]: Extraction of the workflow outputs object
//! - [`cancel`]: Cancel requests and the cancel job body

pub mod cancel;
pub mod dispatcher;
pub mod job;
pub mod log_processor;
pub mod outputs;

pub use cancel::{CancelRunJob, CancellationCoordinator};
pub use dispatcher::{ExecutionDispatcher, Invocation};
pub use job::RunWorkflowJob;
pub use log_processor::LogStreamProcessor;
pub use outputs::parse_outputs;
