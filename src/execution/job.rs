//! Workflow Job
//!
//! Body of the `run_workflow` job: starts the engine wrapper in the run's
//! working directory, feeds its combined stdout/stderr through a
//! [`LogStreamProcessor`] while it runs, and returns exit code, log and
//! sub-task ids once the process exits.
//!
//! Both output streams of the engine share one pipe, so the log keeps the
//! order in which the process wrote its lines.

use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::process::Stdio;
use std::thread;

use log::{debug, info, warn};
use tokio::process::Command;
use tokio::sync::mpsc;

use super::dispatcher::Invocation;
use super::log_processor::LogStreamProcessor;
use crate::error::JobError;
use crate::queue::{JobContext, RunResult};

/// Exit code reported when the process was terminated by a signal.
const SIGNALED_EXIT_CODE: i32 = -1;

/// Runs one workflow through the engine wrapper.
#[derive(Debug, Clone)]
pub struct RunWorkflowJob {
    pub invocation: Invocation,
    /// Forwarded to sub-task events so the monitor can query the backend.
    pub token: Option<String>,
}

impl RunWorkflowJob {
    pub fn new(invocation: Invocation, token: Option<String>) -> Self {
        Self { invocation, token }
    }

    pub async fn execute(&self, ctx: &JobContext) -> Result<RunResult, JobError> {
        let program = self.invocation.program().to_string();
        debug!(
            "Task '{}' spawning: {}",
            ctx.task_id,
            self.invocation.display_command()
        );

        let (reader, writer) = os_pipe::pipe()?;
        let error_writer = writer.try_clone()?;

        let mut command = Command::new(&program);
        command
            .args(self.invocation.args())
            .current_dir(&self.invocation.workdir)
            .stdin(Stdio::null())
            .stdout(writer)
            .stderr(error_writer)
            .kill_on_drop(true);
        let spawned = command.spawn();
        // The reader sees EOF only once every write end is closed
        drop(command);

        let mut child = spawned.map_err(|source| JobError::Spawn {
            program: program.clone(),
            source,
        })?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        thread::Builder::new()
            .name(format!("output-{}", ctx.task_id))
            .spawn(move || forward_lines(reader, tx))?;

        let mut processor =
            LogStreamProcessor::new(&ctx.task_id, self.token.clone(), ctx.events.clone());
        while let Some(line) = rx.recv().await {
            processor.feed(&line);
        }
        let (log, sub_task_ids) = processor.finish();

        let status = child.wait().await?;
        let exit_code = status.code().unwrap_or(SIGNALED_EXIT_CODE);
        if exit_code == 0 {
            info!("Task '{}' engine exited successfully", ctx.task_id);
        } else {
            warn!("Task '{}' engine exited with code {}", ctx.task_id, exit_code);
        }

        Ok(RunResult {
            exit_code,
            log,
            sub_task_ids,
            token: self.token.clone(),
        })
    }
}

/// Sends every line of `reader` to `tx` until EOF or until nobody listens.
///
/// Bytes that are not valid UTF-8 are replaced, never fatal.
fn forward_lines<R: Read>(reader: R, tx: mpsc::UnboundedSender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                if tx.send(decode_line(&buf)).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Stopped reading engine output: {}", e);
                break;
            }
        }
    }
}

fn decode_line(raw: &[u8]) -> String {
    let line = raw.strip_suffix(b"\n").unwrap_or(raw);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::ServiceConfig;
    use crate::queue::{EventBus, QueueEvent};
    use crate::store::MemoryRunStore;
    use crate::tes::HttpTesClient;

    fn context(events: &EventBus) -> JobContext {
        let tes = HttpTesClient::with_timeout("http://127.0.0.1:9", "FULL", Duration::from_millis(100))
            .unwrap();
        JobContext {
            task_id: "job-1".to_string(),
            events: events.clone(),
            store: Arc::new(MemoryRunStore::new()),
            tes: Arc::new(tes),
            config: Arc::new(ServiceConfig::default()),
        }
    }

    fn shell(script: &str) -> RunWorkflowJob {
        let argv = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
        RunWorkflowJob::new(Invocation::new(argv, std::env::temp_dir()), Some("jwt".to_string()))
    }

    #[tokio::test]
    async fn test_collects_exit_code_and_sub_tasks() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let job = shell("echo '[job main] task id: tes-1'; echo oops >&2; exit 3");

        let result = job.execute(&context(&events)).await.unwrap();

        assert_eq!(result.exit_code, 3);
        assert_eq!(result.sub_task_ids, vec!["tes-1"]);
        assert_eq!(result.token.as_deref(), Some("jwt"));
        assert!(result.log.contains(&"oops".to_string()));

        match rx.recv().await.unwrap() {
            QueueEvent::SubTaskUpdate {
                task_id,
                sub_task_id,
                state,
                token,
                ..
            } => {
                assert_eq!(task_id, "job-1");
                assert_eq!(sub_task_id, "tes-1");
                assert!(state.is_none());
                assert_eq!(token.as_deref(), Some("jwt"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let events = EventBus::new();
        let job = RunWorkflowJob::new(
            Invocation::new(vec!["/nonexistent/engine".to_string()], std::env::temp_dir()),
            None,
        );
        let err = job.execute(&context(&events)).await.unwrap_err();
        assert!(matches!(err, JobError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_output_keeps_write_order_across_streams() {
        let events = EventBus::new();
        let job = shell(
            "echo 'INFO start' >&2; echo '{'; echo '    \"a\": 1'; echo '}'; \
             echo 'INFO done' >&2; echo tail",
        );

        let result = job.execute(&context(&events)).await.unwrap();

        assert_eq!(
            result.log,
            vec!["INFO start", "{", "    \"a\": 1", "}", "INFO done", "tail"]
        );
    }

    #[tokio::test]
    async fn test_invalid_utf8_does_not_stop_reading() {
        let events = EventBus::new();
        let job = shell(
            "printf 'INFO \\377\\376 binary\\n'; echo '[job a] task id: tes-1'; \
             i=0; while [ $i -lt 2000 ]; do echo \"filler line $i with some padding text\"; i=$((i+1)); done; \
             echo '{}'",
        );

        let result = job.execute(&context(&events)).await.unwrap();

        assert_eq!(result.exit_code, 0);
        assert_eq!(result.sub_task_ids, vec!["tes-1"]);
        assert_eq!(result.log.len(), 2003);
        assert!(result.log[0].starts_with("INFO "));
        assert!(result.log[0].contains('\u{FFFD}'));
        assert_eq!(result.log.last().map(String::as_str), Some("{}"));
    }

    #[test]
    fn test_forward_lines_replaces_bad_bytes() {
        let input: &[u8] = b"ok\r\nbad \xff byte\nlast without newline";
        let (tx, mut rx) = mpsc::unbounded_channel();

        forward_lines(input, tx);

        assert_eq!(rx.try_recv().unwrap(), "ok");
        assert_eq!(rx.try_recv().unwrap(), "bad \u{FFFD} byte");
        assert_eq!(rx.try_recv().unwrap(), "last without newline");
        assert!(rx.try_recv().is_err());
    }
}
