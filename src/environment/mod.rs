//! Run Environment Module
//!
//! Allocation of a run's identity and filesystem workspace.
//!
//! # Structure
//!
//! - [`ids`]: Run id and task id generation
//! - [`material`]: Workflow and parameter file resolution
//! - [`workspace`]: The allocation loop with rollback

pub mod ids;
pub mod material;
pub mod workspace;

pub use material::{Attachment, GitSource, WORKFLOW_FILES_DIR};
pub use workspace::RunEnvironmentFactory;
