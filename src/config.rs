//! Service Configuration
//!
//! All tunables of the service, loaded once at startup from a YAML file and
//! handed to every component behind an `Arc`.
//!
//! # Example YAML
//!
//! ```yaml
//! storage:
//!   tmp_dir: /data/tmp
//!   permanent_dir: /data/output
//! controller:
//!   runs_id:
//!     length: 6
//!     charset: ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789
//!   timeout_cancel_run: 60
//!   tes_server:
//!     url: https://tes.tsi.ebi.ac.uk/
//! worker:
//!   concurrency: 4
//! ```
//!
//! Missing sections and fields fall back to their defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::WesError;

/// Alphabet used for run identifiers unless configured otherwise.
pub const DEFAULT_RUN_ID_CHARSET: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Top-level configuration.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    pub storage: StorageConfig,
    pub controller: ControllerConfig,
    pub engine: EngineConfig,
    pub worker: WorkerConfig,
    pub security: SecurityConfig,
}

/// Workspace locations and the remote storage endpoint handed to the engine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub tmp_dir: PathBuf,
    pub permanent_dir: PathBuf,
    pub remote_storage_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            tmp_dir: PathBuf::from("/data/tmp"),
            permanent_dir: PathBuf::from("/data/output"),
            remote_storage_url: "ftp://ftp.private/upload".to_string(),
        }
    }
}

/// Run identifier generation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RunIdConfig {
    pub charset: String,
    pub length: usize,
    /// Upper bound on allocation retries before giving up.
    pub max_attempts: usize,
}

impl Default for RunIdConfig {
    fn default() -> Self {
        Self {
            charset: DEFAULT_RUN_ID_CHARSET.to_string(),
            length: 6,
            max_attempts: 100,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TesServerConfig {
    pub url: String,
    /// Per-request timeout in seconds.
    pub timeout: f64,
    /// `view` query parameter used when fetching task logs.
    pub status_query_params: String,
}

impl Default for TesServerConfig {
    fn default() -> Self {
        Self {
            url: "https://tes.tsi.ebi.ac.uk/".to_string(),
            timeout: 5.0,
            status_query_params: "FULL".to_string(),
        }
    }
}

impl TesServerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout)
    }
}

/// Controller settings. Timeouts are in seconds.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    pub runs_id: RunIdConfig,
    /// Soft deadline of a workflow run; none means unbounded.
    pub timeout_run_workflow: Option<f64>,
    /// Soft deadline of a cancellation job.
    pub timeout_cancel_run: f64,
    pub cancel_poll_interval: f64,
    pub default_page_size: usize,
    pub tes_server: TesServerConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            runs_id: RunIdConfig::default(),
            timeout_run_workflow: None,
            timeout_cancel_run: 60.0,
            cancel_poll_interval: 5.0,
            default_page_size: 5,
            tes_server: TesServerConfig::default(),
        }
    }
}

impl ControllerConfig {
    pub fn run_workflow_deadline(&self) -> Option<Duration> {
        self.timeout_run_workflow.map(Duration::from_secs_f64)
    }

    pub fn cancel_run_deadline(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_cancel_run)
    }

    pub fn cancel_poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.cancel_poll_interval)
    }
}

/// The external workflow engine wrapper.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub program: String,
    /// Flags placed right after the program name.
    pub args: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: "cwl-tes".to_string(),
            args: vec!["--debug".to_string(), "--leave-outputs".to_string()],
        }
    }
}

/// Worker pool settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Maximum number of jobs executing at once.
    pub concurrency: usize,
    /// Seconds before the monitor loop resumes after an unexpected error.
    pub monitor_restart_delay: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get(),
            monitor_restart_delay: 1.0,
        }
    }
}

impl WorkerConfig {
    pub fn monitor_restart_delay(&self) -> Duration {
        Duration::from_secs_f64(self.monitor_restart_delay)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct SecurityConfig {
    /// When set, every run is bound to the submitting user.
    pub authorization_required: bool,
}

impl ServiceConfig {
    /// Loads and validates a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, WesError> {
        let path = path.as_ref();
        debug!("Reading configuration from {}", path.display());

        let content = fs::read_to_string(path).map_err(|e| {
            WesError::Config(format!("cannot read '{}': {}", path.display(), e))
        })?;
        let config = Self::from_yaml(&content)?;

        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Parses and validates a YAML document.
    pub fn from_yaml(content: &str) -> Result<Self, WesError> {
        let config: Self =
            serde_yaml::from_str(content).map_err(|e| WesError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings no component can work with.
    pub fn validate(&self) -> Result<(), WesError> {
        let ids = &self.controller.runs_id;
        if ids.charset.is_empty() {
            return Err(WesError::Config("runs_id.charset is empty".to_string()));
        }
        if ids.length == 0 {
            return Err(WesError::Config("runs_id.length must be positive".to_string()));
        }
        if ids.max_attempts == 0 {
            return Err(WesError::Config(
                "runs_id.max_attempts must be positive".to_string(),
            ));
        }
        if self.worker.concurrency == 0 {
            return Err(WesError::Config(
                "worker.concurrency must be positive".to_string(),
            ));
        }

        let timeouts = [
            ("timeout_cancel_run", Some(self.controller.timeout_cancel_run)),
            ("timeout_run_workflow", self.controller.timeout_run_workflow),
            ("cancel_poll_interval", Some(self.controller.cancel_poll_interval)),
            ("tes_server.timeout", Some(self.controller.tes_server.timeout)),
            ("monitor_restart_delay", Some(self.worker.monitor_restart_delay)),
        ];
        for (name, value) in timeouts {
            if let Some(secs) = value {
                if !secs.is_finite() || secs < 0.0 {
                    return Err(WesError::Config(format!(
                        "{} must be a non-negative number of seconds",
                        name
                    )));
                }
            }
        }

        if self.engine.program.trim().is_empty() {
            return Err(WesError::Config("engine.program is empty".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.controller.runs_id.length, 6);
        assert_eq!(config.controller.runs_id.charset, DEFAULT_RUN_ID_CHARSET);
        assert_eq!(config.controller.default_page_size, 5);
        assert_eq!(config.controller.cancel_run_deadline(), Duration::from_secs(60));
        assert!(config.controller.run_workflow_deadline().is_none());
        assert_eq!(config.engine.program, "cwl-tes");
        assert!(config.worker.concurrency >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = ServiceConfig::from_yaml(
            r#"
controller:
  timeout_run_workflow: 1.5
  runs_id:
    length: 10
worker:
  concurrency: 2
"#,
        )
        .unwrap();

        assert_eq!(config.controller.runs_id.length, 10);
        assert_eq!(config.controller.runs_id.max_attempts, 100);
        assert_eq!(
            config.controller.run_workflow_deadline(),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(config.worker.concurrency, 2);
        assert_eq!(config.storage.tmp_dir, PathBuf::from("/data/tmp"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(ServiceConfig::from_yaml("controller:\n  runs_id:\n    charset: ''\n").is_err());
        assert!(ServiceConfig::from_yaml("controller:\n  runs_id:\n    length: 0\n").is_err());
        assert!(ServiceConfig::from_yaml("controller:\n  timeout_cancel_run: -1\n").is_err());
        assert!(ServiceConfig::from_yaml("worker:\n  concurrency: 0\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "security:\n  authorization_required: true").unwrap();

        let config = ServiceConfig::load(file.path()).unwrap();
        assert!(config.security.authorization_required);
    }

    #[test]
    fn test_load_missing_file() {
        let err = ServiceConfig::load("/nonexistent/wes.yaml").unwrap_err();
        assert!(matches!(err, WesError::Config(_)));
    }
}
