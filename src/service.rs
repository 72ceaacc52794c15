//! WES Service
//!
//! The operations the API layer calls. Wires the run environment factory,
//! the execution dispatcher and the cancellation coordinator to one store,
//! one job queue and one event bus.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use serde_json::json;
//! use wesrunner::config::ServiceConfig;
//! use wesrunner::service::WesService;
//! use wesrunner::store::MemoryRunStore;
//! use wesrunner::tes::HttpTesClient;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Arc::new(ServiceConfig::default());
//! let tes = HttpTesClient::new(&config.controller.tes_server)?;
//! let service = WesService::start(config, Arc::new(MemoryRunStore::new()), Arc::new(tes));
//!
//! let body = json!({
//!     "workflow_url": "file:///workflows/hello.cwl",
//!     "workflow_type": "CWL",
//!     "workflow_type_version": "v1.0",
//!     "workflow_params": {"message": "hello"}
//! });
//! let run_id = service.submit(body, None, &[]).await?;
//! println!("{}", service.get_status(&run_id, None).await?.state);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use log::{error, info};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::config::ServiceConfig;
use crate::environment::{Attachment, RunEnvironmentFactory};
use crate::error::WesError;
use crate::execution::{CancellationCoordinator, ExecutionDispatcher};
use crate::monitoring::TaskMonitor;
use crate::queue::{EventBus, JobQueue, JobReceiver, Worker};
use crate::run::{validate_request, Requester, Run, RunListing, RunLogView, RunStatus};
use crate::store::{ListQuery, RunKey, RunStore};
use crate::tes::TesClient;

/// Workflow Execution Service core.
pub struct WesService {
    config: Arc<ServiceConfig>,
    store: Arc<dyn RunStore>,
    tes: Arc<dyn TesClient>,
    events: EventBus,
    factory: RunEnvironmentFactory,
    dispatcher: ExecutionDispatcher,
    coordinator: CancellationCoordinator,
    tasks: Vec<JoinHandle<()>>,
}

impl WesService {
    /// Builds the service without starting any background task. Jobs pile
    /// up in the returned receiver until a [`Worker`] drains it.
    pub fn new(
        config: Arc<ServiceConfig>,
        store: Arc<dyn RunStore>,
        tes: Arc<dyn TesClient>,
    ) -> (Self, JobReceiver) {
        let (queue, receiver) = JobQueue::new();
        let events = EventBus::new();

        let service = Self {
            factory: RunEnvironmentFactory::new(Arc::clone(&config), Arc::clone(&store)),
            dispatcher: ExecutionDispatcher::new(Arc::clone(&config), queue.clone()),
            coordinator: CancellationCoordinator::new(Arc::clone(&config), Arc::clone(&store), queue),
            config,
            store,
            tes,
            events,
            tasks: Vec::new(),
        };
        (service, receiver)
    }

    /// Builds the service and starts its task monitor and worker pool.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        config: Arc<ServiceConfig>,
        store: Arc<dyn RunStore>,
        tes: Arc<dyn TesClient>,
    ) -> Self {
        let (mut service, receiver) = Self::new(config, store, tes);

        // The monitor subscribes before the worker can emit anything
        let monitor = TaskMonitor::new(
            Arc::clone(&service.config),
            Arc::clone(&service.store),
            Arc::clone(&service.tes),
        );
        service.tasks.push(monitor.spawn(&service.events));

        let worker = Worker::new(
            Arc::clone(&service.config),
            Arc::clone(&service.store),
            Arc::clone(&service.tes),
            service.events.clone(),
        );
        service.tasks.push(worker.spawn(receiver));

        info!("WES service started");
        service
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Event bus shared with the worker pool and the monitor.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Validates a submission, allocates its run and queues its execution.
    ///
    /// If the job cannot be queued the run is discarded again.
    pub async fn submit(
        &self,
        body: Value,
        owner: Option<&Requester>,
        attachments: &[Attachment],
    ) -> Result<String, WesError> {
        let owner = self.identify(owner)?;
        let request = validate_request(body)?;
        let run = self.factory.create(request, owner, attachments).await?;

        if let Err(e) = self.dispatcher.dispatch(&run, owner) {
            error!("Could not queue run '{}': {}", run.run_id, e);
            if let Err(cleanup) = self.factory.discard(&run).await {
                error!("Could not discard run '{}': {}", run.run_id, cleanup);
            }
            return Err(e);
        }

        Ok(run.run_id)
    }

    /// Starts cancellation of a run. See [`CancellationCoordinator::cancel`].
    pub async fn cancel(
        &self,
        run_id: &str,
        requester: Option<&Requester>,
    ) -> Result<String, WesError> {
        let requester = self.identify(requester)?;
        self.coordinator.cancel(run_id, requester).await
    }

    pub async fn get_status(
        &self,
        run_id: &str,
        requester: Option<&Requester>,
    ) -> Result<RunStatus, WesError> {
        Ok(self.accessible_run(run_id, requester).await?.status())
    }

    /// Full public record of a run.
    pub async fn get_log(
        &self,
        run_id: &str,
        requester: Option<&Requester>,
    ) -> Result<RunLogView, WesError> {
        Ok(self.accessible_run(run_id, requester).await?.to_log())
    }

    /// Lists runs newest first, restricted to the requester's own runs.
    ///
    /// `page_size` falls back to the configured default.
    pub async fn list_runs(
        &self,
        requester: Option<&Requester>,
        page_size: Option<usize>,
        page_token: Option<&str>,
    ) -> Result<RunListing, WesError> {
        let requester = self.identify(requester)?;
        let query = ListQuery {
            user_id: requester.map(|r| r.user_id.clone()),
            page_size: page_size.unwrap_or(self.config.controller.default_page_size),
            page_token: page_token.map(str::to_string),
        };
        Ok(self.store.list(&query).await?)
    }

    async fn accessible_run(
        &self,
        run_id: &str,
        requester: Option<&Requester>,
    ) -> Result<Run, WesError> {
        let requester = self.identify(requester)?;
        let run = self
            .store
            .find(&RunKey::run_id(run_id))
            .await?
            .ok_or_else(|| WesError::NotFound(run_id.to_string()))?;
        run.check_access(requester)?;
        Ok(run)
    }

    /// Requester identity to act under. Identities are ignored unless
    /// authorization is required, in which case one must be present.
    fn identify<'a>(
        &self,
        requester: Option<&'a Requester>,
    ) -> Result<Option<&'a Requester>, WesError> {
        if !self.config.security.authorization_required {
            return Ok(None);
        }
        requester.map(Some).ok_or(WesError::Unauthenticated)
    }
}

impl Drop for WesService {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
