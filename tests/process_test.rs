//! End-to-end runs with a real engine wrapper process.
//!
//! The wrapper is `sh -c <script>`, which prints the same kind of output
//! the real engine does.

#![cfg(unix)]

mod common;

use std::sync::Arc;

use serde_json::json;
use tempfile::tempdir;

use common::{
    find_run, request_body, shell_config, start, wait_for_state, wait_until,
    wait_until_finished, FakeTes,
};
use wesrunner::State;

const SUCCESSFUL_ENGINE: &str = r#"
echo "[job main] task id: tes-1"
echo "[job main] POLLING \"tes-1\", result: RUNNING"
echo "[job main] POLLING \"tes-1\", result: RUNNING"
echo "[job main] POLLING \"tes-1\", result: COMPLETE"
echo "{"
echo "    \"answer\": 42"
echo "}"
"#;

#[tokio::test]
async fn test_successful_run_completes() {
    let root = tempdir().unwrap();
    let tes = Arc::new(FakeTes::default());
    let service = start(shell_config(root.path(), SUCCESSFUL_ENGINE), tes.clone());

    let run_id = service.submit(request_body(), None, &[]).await.unwrap();
    let run = wait_for_state(&service, &run_id, State::Complete).await;

    assert_eq!(run.outputs["answer"], json!(42));
    assert_eq!(run.run_log.exit_code, Some(0));
    assert!(run.run_log.stdout.as_ref().unwrap().contains("task id: tes-1"));
    assert!(run.run_log.command.as_ref().unwrap().starts_with("sh -c"));
    assert!(run.run_log.time_queue.is_some());
    assert!(run.run_log.time_execution.is_some());
    assert!(run.run_log.time_total.is_some());
    assert!(run.internal.host.is_some());

    assert_eq!(run.task_log_ids(), vec!["tes-1"]);
    assert_eq!(run.task_logs[0].state.as_deref(), Some("COMPLETE"));

    // Once on first sighting, once at completion
    assert_eq!(tes.fetched.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_binary_noise_in_engine_output_is_tolerated() {
    let root = tempdir().unwrap();
    let script = r#"
printf 'INFO \377 progress\n' >&2
echo "[job main] task id: tes-1"
printf '{\n    "answer": 7\n}\n'
"#;
    let tes = Arc::new(FakeTes::default());
    let service = start(shell_config(root.path(), script), tes.clone());

    let run_id = service.submit(request_body(), None, &[]).await.unwrap();
    let run = wait_for_state(&service, &run_id, State::Complete).await;

    assert_eq!(run.outputs["answer"], json!(7));
    assert_eq!(run.task_log_ids(), vec!["tes-1"]);
    let stdout = run.run_log.stdout.unwrap();
    assert!(stdout.starts_with("INFO \u{FFFD} progress\n[job main] task id: tes-1"));
}

#[tokio::test]
async fn test_failing_engine_is_executor_error() {
    let root = tempdir().unwrap();
    let service = start(
        shell_config(root.path(), "echo 'engine failed' >&2; exit 3"),
        Arc::new(FakeTes::default()),
    );

    let run_id = service.submit(request_body(), None, &[]).await.unwrap();
    let run = wait_for_state(&service, &run_id, State::ExecutorError).await;

    assert_eq!(run.run_log.exit_code, Some(3));
    assert!(run.outputs.is_empty());
    assert!(run.run_log.stdout.unwrap().contains("engine failed"));
}

#[tokio::test]
async fn test_missing_engine_is_system_error() {
    let root = tempdir().unwrap();
    let mut config = shell_config(root.path(), "true");
    config.engine.program = "/nonexistent/engine-wrapper".to_string();
    let service = start(config, Arc::new(FakeTes::default()));

    let run_id = service.submit(request_body(), None, &[]).await.unwrap();
    let run = wait_for_state(&service, &run_id, State::SystemError).await;

    assert_eq!(run.run_log.exception.as_deref(), Some("SpawnError"));
    assert!(run.internal.traceback.unwrap().contains("engine-wrapper"));
}

#[tokio::test]
async fn test_soft_deadline_is_system_error() {
    let root = tempdir().unwrap();
    let mut config = shell_config(root.path(), "sleep 5");
    config.controller.timeout_run_workflow = Some(0.2);
    let service = start(config, Arc::new(FakeTes::default()));

    let run_id = service.submit(request_body(), None, &[]).await.unwrap();
    let run = wait_for_state(&service, &run_id, State::SystemError).await;

    assert_eq!(run.run_log.exception.as_deref(), Some("SoftTimeLimitExceeded"));
    assert!(run
        .internal
        .traceback
        .unwrap()
        .starts_with("SoftTimeLimitExceeded"));
}

#[tokio::test]
async fn test_cancel_running_run() {
    let root = tempdir().unwrap();
    let script = r#"
echo "[job main] task id: tes-9"
sleep 1
echo "{}"
"#;
    let tes = Arc::new(FakeTes::default());
    let service = start(shell_config(root.path(), script), tes.clone());

    let run_id = service.submit(request_body(), None, &[]).await.unwrap();
    wait_until(&service, &run_id, std::time::Duration::from_secs(10), |run| {
        run.state == State::Running && !run.task_logs.is_empty()
    })
    .await;

    assert_eq!(service.cancel(&run_id, None).await.unwrap(), run_id);
    assert_eq!(
        service.get_status(&run_id, None).await.unwrap().state,
        State::Canceling
    );

    let run = wait_until_finished(&service, &run_id).await;
    assert_eq!(run.state, State::Canceled);
    assert_eq!(*tes.canceled.lock().unwrap(), vec!["tes-9".to_string()]);
}

#[tokio::test]
async fn test_cancel_timeout_is_system_error() {
    let root = tempdir().unwrap();
    let mut config = shell_config(root.path(), "sleep 2; echo '{}'");
    config.controller.timeout_cancel_run = 0.2;
    let service = start(config, Arc::new(FakeTes::default()));

    let run_id = service.submit(request_body(), None, &[]).await.unwrap();
    wait_for_state(&service, &run_id, State::Running).await;
    service.cancel(&run_id, None).await.unwrap();

    wait_for_state(&service, &run_id, State::SystemError).await;

    // The workflow's late completion does not revive the run
    let run = wait_until(&service, &run_id, std::time::Duration::from_secs(10), |run| {
        run.run_log.exit_code.is_some()
    })
    .await;
    assert_eq!(run.state, State::SystemError);
    assert_eq!(run.run_log.exception.as_deref(), Some("SystemTimeout"));
}

#[tokio::test]
async fn test_cancel_finished_run_changes_nothing() {
    let root = tempdir().unwrap();
    let service = start(
        shell_config(root.path(), "echo '{}'"),
        Arc::new(FakeTes::default()),
    );

    let run_id = service.submit(request_body(), None, &[]).await.unwrap();
    let before = wait_until_finished(&service, &run_id).await;
    assert_eq!(before.state, State::Complete);

    for _ in 0..3 {
        assert_eq!(service.cancel(&run_id, None).await.unwrap(), run_id);
    }
    assert_eq!(find_run(&service, &run_id).await, before);
}

#[tokio::test]
async fn test_parallel_submissions_are_independent() {
    let root = tempdir().unwrap();
    let service = Arc::new(start(
        shell_config(root.path(), r#"printf '{\n  "ok": true\n}\n'"#),
        Arc::new(FakeTes::default()),
    ));

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.submit(request_body(), None, &[]).await })
        })
        .collect();

    let mut run_ids = Vec::new();
    for handle in handles {
        run_ids.push(handle.await.unwrap().unwrap());
    }

    for run_id in &run_ids {
        let run = wait_for_state(&service, run_id, State::Complete).await;
        assert_eq!(run.outputs["ok"], json!(true));
    }
    run_ids.sort();
    run_ids.dedup();
    assert_eq!(run_ids.len(), 6);
}
