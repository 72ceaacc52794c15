//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use wesrunner::config::ServiceConfig;
use wesrunner::error::BackendError;
use wesrunner::run::Run;
use wesrunner::store::{RunKey, RunStore};
use wesrunner::tes::TesClient;
use wesrunner::{State, WesService};

/// Backend double that records every call.
#[derive(Default)]
pub struct FakeTes {
    pub fetched: Mutex<Vec<String>>,
    pub canceled: Mutex<Vec<String>>,
}

#[async_trait]
impl TesClient for FakeTes {
    async fn get_task(&self, id: &str, _token: Option<&str>) -> Result<Value, BackendError> {
        self.fetched.lock().unwrap().push(id.to_string());
        Ok(json!({"id": id, "state": "COMPLETE", "logs": [{"exit_code": 0}]}))
    }

    async fn cancel_task(&self, id: &str, _token: Option<&str>) -> Result<(), BackendError> {
        self.canceled.lock().unwrap().push(id.to_string());
        Ok(())
    }
}

/// Configuration rooted in `root` that runs `script` with `sh -c` as the
/// engine wrapper.
pub fn shell_config(root: &Path, script: &str) -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.storage.tmp_dir = root.join("tmp");
    config.storage.permanent_dir = root.join("out");
    config.engine.program = "sh".to_string();
    config.engine.args = vec!["-c".to_string(), script.to_string(), "engine".to_string()];
    config.controller.cancel_poll_interval = 0.05;
    config.worker.concurrency = 2;
    config.worker.monitor_restart_delay = 0.01;
    config
}

pub fn request_body() -> Value {
    json!({
        "workflow_url": "file:///workflows/hello.cwl",
        "workflow_type": "CWL",
        "workflow_type_version": "v1.0",
        "workflow_params": {"message": "hello"}
    })
}

pub async fn find_run(service: &WesService, run_id: &str) -> Run {
    service
        .store()
        .find(&RunKey::run_id(run_id))
        .await
        .unwrap()
        .expect("run exists")
}

/// Polls until the run satisfies `done`, panicking after `limit`.
pub async fn wait_until<F>(service: &WesService, run_id: &str, limit: Duration, done: F) -> Run
where
    F: Fn(&Run) -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let run = find_run(service, run_id).await;
        if done(&run) {
            return run;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("run '{}' stuck in state {}", run_id, run.state);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub async fn wait_for_state(service: &WesService, run_id: &str, state: State) -> Run {
    wait_until(service, run_id, Duration::from_secs(10), |run| run.state == state).await
}

pub async fn wait_until_finished(service: &WesService, run_id: &str) -> Run {
    wait_until(service, run_id, Duration::from_secs(10), |run| {
        run.state.is_finished()
    })
    .await
}

pub fn start(config: ServiceConfig, tes: Arc<FakeTes>) -> WesService {
    WesService::start(
        Arc::new(config),
        Arc::new(wesrunner::store::MemoryRunStore::new()),
        tes,
    )
}
