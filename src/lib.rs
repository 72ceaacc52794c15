//! WesRunner - Workflow Execution Service Core
//!
//! Accepts workflow run submissions, executes them through an external
//! workflow engine wrapper that farms sub-tasks out to a GA4GH TES backend,
//! and tracks every run through its lifecycle.
//!
//! # Architecture
//!
//! - [`run`]: The run document, its state machine and request validation
//! - [`store`]: Persistence of run documents
//! - [`environment`]: Run ids, workspaces and workflow material
//! - [`execution`]: Command construction, the job bodies and log parsing
//! - [`queue`]: Job queue, worker pool and event stream
//! - [`monitoring`]: The task monitor driving run state from queue events
//! - [`tes`]: Execution backend client
//! - [`service`]: The submit / cancel / status / log operations
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use wesrunner::config::ServiceConfig;
//! use wesrunner::store::MemoryRunStore;
//! use wesrunner::tes::HttpTesClient;
//! use wesrunner::WesService;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Arc::new(ServiceConfig::load("wes.yaml")?);
//!     let tes = HttpTesClient::new(&config.controller.tes_server)?;
//!     let service = WesService::start(config, Arc::new(MemoryRunStore::new()), Arc::new(tes));
//!
//!     let body = serde_json::from_str(&std::fs::read_to_string("request.json")?)?;
//!     let run_id = service.submit(body, None, &[]).await?;
//!     println!("Submitted run {}", run_id);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod environment;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod queue;
pub mod run;
pub mod service;
pub mod store;
pub mod tes;

// Re-export commonly used types
pub use config::ServiceConfig;
pub use error::{Result, WesError};
pub use run::{Run, RunRequest, State};
pub use service::WesService;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "wesrunner";
