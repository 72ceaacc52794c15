//! Run Model Module
//!
//! Data structures describing a workflow run and the rules governing it.
//!
//! # Structure
//!
//! - [`model`]: The run document and its API projections
//! - [`state`]: Run states and the transition graph
//! - [`validator`]: Submission validation

pub mod model;
pub mod state;
pub mod validator;

pub use model::{
    Internal, JsonMap, Requester, Run, RunListing, RunLog, RunLogView, RunRequest, RunStatus,
    TaskLog,
};
pub use state::{State, Transition};
pub use validator::validate_request;
