//! Execution Dispatch
//!
//! Builds the engine wrapper's command line for a run and hands it to the
//! job queue. Credentials on the command line are redacted in everything
//! that gets logged or stored.
//!
//! # Command Layout
//!
//! ```text
//! cwl-tes --debug --leave-outputs [--token-public-key KEY --token JWT]
//!         --remote-storage-url URL --tes TES_URL WORKFLOW PARAMS
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;

use crate::config::ServiceConfig;
use crate::error::WesError;
use crate::queue::{Job, JobQueue};
use crate::run::{Requester, Run};

use super::job::RunWorkflowJob;

/// Placeholder for redacted arguments.
pub const REDACTED: &str = "<REDACTED>";

/// Argument vector and working directory of an external process.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub argv: Vec<String>,
    pub workdir: PathBuf,
    /// Positions in `argv` holding secrets.
    redact: Vec<usize>,
}

impl Invocation {
    pub fn new(argv: Vec<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            argv,
            workdir: workdir.into(),
            redact: Vec::new(),
        }
    }

    /// Marks argument positions that must never be shown.
    pub fn with_redacted(mut self, positions: impl IntoIterator<Item = usize>) -> Self {
        self.redact.extend(positions);
        self
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }

    pub fn args(&self) -> &[String] {
        self.argv.get(1..).unwrap_or_default()
    }

    /// Argument vector with secrets replaced by [`REDACTED`].
    pub fn redacted_argv(&self) -> Vec<String> {
        self.argv
            .iter()
            .enumerate()
            .map(|(i, arg)| {
                if self.redact.contains(&i) {
                    REDACTED.to_string()
                } else {
                    arg.clone()
                }
            })
            .collect()
    }

    /// Shell-quoted, redacted command line.
    pub fn display_command(&self) -> String {
        self.redacted_argv()
            .iter()
            .map(|arg| shell_quote(arg))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Quotes `arg` for a POSIX shell unless it is made of safe characters only.
pub fn shell_quote(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }

    let safe = arg
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\"'\"'"))
    }
}

/// Turns persisted runs into queued workflow jobs.
pub struct ExecutionDispatcher {
    config: Arc<ServiceConfig>,
    queue: JobQueue,
}

impl ExecutionDispatcher {
    pub fn new(config: Arc<ServiceConfig>, queue: JobQueue) -> Self {
        Self { config, queue }
    }

    /// Builds the engine invocation for `run`.
    ///
    /// Fails if the run's workflow or parameter file was never resolved.
    pub fn build_invocation(
        &self,
        run: &Run,
        requester: Option<&Requester>,
    ) -> Result<Invocation, WesError> {
        let workflow = resolved_path(run.internal.workflow_path.as_deref(), "workflow", run)?;
        let params = resolved_path(run.internal.param_file_path.as_deref(), "parameter", run)?;

        let engine = &self.config.engine;
        let mut argv = vec![engine.program.clone()];
        argv.extend(engine.args.iter().cloned());

        let mut redact = Vec::new();
        if let Some((jwt, public_key)) = requester.and_then(Requester::credentials) {
            argv.push("--token-public-key".to_string());
            argv.push(public_key.to_string());
            redact.push(argv.len() - 1);
            argv.push("--token".to_string());
            argv.push(jwt.to_string());
            redact.push(argv.len() - 1);
        }

        argv.extend([
            "--remote-storage-url".to_string(),
            self.config.storage.remote_storage_url.clone(),
            "--tes".to_string(),
            self.config.controller.tes_server.url.clone(),
            workflow,
            params,
        ]);

        Ok(Invocation::new(argv, &run.internal.tmp_dir).with_redacted(redact))
    }

    /// Enqueues the workflow job of `run` under its `task_id`. Returns as
    /// soon as the job is queued.
    pub fn dispatch(&self, run: &Run, requester: Option<&Requester>) -> Result<(), WesError> {
        let invocation = self.build_invocation(run, requester)?;
        let token = requester.and_then(|r| r.jwt.clone());

        info!(
            "Starting execution of run '{}' as task '{}' in: {}",
            run.run_id,
            run.task_id,
            invocation.workdir.display()
        );

        self.queue.submit(
            run.task_id.clone(),
            Job::RunWorkflow(RunWorkflowJob::new(invocation, token)),
            self.config.controller.run_workflow_deadline(),
        )
    }
}

fn resolved_path(path: Option<&Path>, what: &str, run: &Run) -> Result<String, WesError> {
    path.map(|p| p.to_string_lossy().into_owned()).ok_or_else(|| {
        WesError::InvalidRequest(format!(
            "no {} file resolved for run '{}'",
            what, run.run_id
        ))
    })
}
