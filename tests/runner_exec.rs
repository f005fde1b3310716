//! Worker runner integration: real child processes driven end to end.
#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use common::{test_runner, wait_for, write_worker_script};
use shepherd_mcp::persistence::writer::PersistenceWriter;
use shepherd_mcp::persistence::TaskStore;
use shepherd_mcp::task::TaskStatus;
use shepherd_mcp::worker::parse_line;

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_worker_completion_and_event_persistence() {
    let dir = TempDir::new().unwrap();
    let script = write_worker_script(
        dir.path(),
        r#"echo '{"type":"step_start","timestamp":1,"sessionID":"ses_ok","part":{"id":"p","snapshot":""}}'
echo '{"type":"text","timestamp":2,"sessionID":"ses_ok","part":{"id":"p","text":"Done."}}'
echo '{"type":"step_finish","timestamp":3,"sessionID":"ses_ok","part":{"id":"p","reason":"stop","tokens":{"input":1,"output":1,"reasoning":0},"cost":0.0}}'"#,
    );

    let store = Arc::new(TaskStore::new(dir.path().join("data")));
    store.init().unwrap();
    let (writer, _writer_handle) = PersistenceWriter::spawn(Some(Arc::clone(&store)));
    let (manager, runner, _pool) = test_runner(script.to_str().unwrap(), writer);

    let task_id = manager.create_task("ok".into(), "x/y".into(), None);
    runner.start(&task_id, "do it", "x/y", None, None).unwrap();

    assert!(
        wait_for(
            || manager.get_task_status(&task_id) == Some(TaskStatus::Completed),
            WAIT
        )
        .await
    );

    let task = manager.get_task_state(&task_id).unwrap();
    assert_eq!(task.session_id, "ses_ok");
    assert_eq!(task.accumulated_text, "Done.");

    // The event log and the session index catch up shortly after.
    let store_for_events = Arc::clone(&store);
    let id_for_events = task_id.clone();
    assert!(
        wait_for(
            move || store_for_events.load_events(&id_for_events).unwrap().len() == 3,
            WAIT
        )
        .await
    );
    assert_eq!(
        store.get_task_id_by_session("ses_ok").await,
        Some(task_id.clone())
    );
    let meta = store.load_task_metadata(&task_id).unwrap().unwrap();
    assert_eq!(meta.session_id, "ses_ok");

    assert!(wait_for(|| runner.active_count() == 0, WAIT).await);
}

#[tokio::test]
async fn test_worker_nonzero_exit_fails_task() {
    let dir = TempDir::new().unwrap();
    let script = write_worker_script(
        dir.path(),
        r#"echo '{"type":"step_start","timestamp":1,"sessionID":"ses_s5","part":{"id":"p","snapshot":""}}'
exit 1"#,
    );

    let (manager, runner, _pool) =
        test_runner(script.to_str().unwrap(), PersistenceWriter::disabled());
    let task_id = manager.create_task("fails".into(), "x/y".into(), None);
    runner.start(&task_id, "do it", "x/y", None, None).unwrap();

    assert!(
        wait_for(
            || manager.get_task_status(&task_id) == Some(TaskStatus::Failed),
            WAIT
        )
        .await
    );
    let task = manager.get_task_state(&task_id).unwrap();
    assert_eq!(
        task.status_message.as_deref(),
        Some("Process exited with code 1")
    );
    assert!(wait_for(|| runner.active_count() == 0, WAIT).await);
}

#[tokio::test]
async fn test_cancel_kills_child_and_later_events_are_dropped() {
    let dir = TempDir::new().unwrap();
    let script = write_worker_script(dir.path(), "sleep 30");

    let (manager, runner, _pool) =
        test_runner(script.to_str().unwrap(), PersistenceWriter::disabled());
    let task_id = manager.create_task("cancel me".into(), "x/y".into(), None);
    runner.start(&task_id, "do it", "x/y", None, None).unwrap();

    assert!(wait_for(|| runner.active_count() == 1, WAIT).await);

    assert!(runner.stop(&task_id));
    manager.cancel_task(&task_id).unwrap();
    assert_eq!(manager.get_task_status(&task_id), Some(TaskStatus::Cancelled));

    // A straggling completion event must not resurrect the task.
    let finish = parse_line(
        r#"{"type":"step_finish","timestamp":9,"sessionID":"s","part":{"id":"p","reason":"stop","tokens":{"input":0,"output":0,"reasoning":0},"cost":0.0}}"#,
    )
    .unwrap();
    manager.handle_event(&task_id, &finish).unwrap();
    assert_eq!(manager.get_task_status(&task_id), Some(TaskStatus::Cancelled));

    assert!(wait_for(|| runner.active_count() == 0, WAIT).await);
    assert!(!runner.stop(&task_id));
}

#[tokio::test]
async fn test_spawn_error_fails_task() {
    let (manager, runner, _pool) = test_runner(
        "/nonexistent/worker-binary",
        PersistenceWriter::disabled(),
    );
    let task_id = manager.create_task("no binary".into(), "x/y".into(), None);
    runner.start(&task_id, "do it", "x/y", None, None).unwrap();

    assert!(
        wait_for(
            || manager.get_task_status(&task_id) == Some(TaskStatus::Failed),
            WAIT
        )
        .await
    );
    let task = manager.get_task_state(&task_id).unwrap();
    assert!(task
        .status_message
        .as_deref()
        .unwrap()
        .starts_with("Process error: "));
}

#[tokio::test]
async fn test_clean_exit_without_completion_leaves_working() {
    let dir = TempDir::new().unwrap();
    let script = write_worker_script(
        dir.path(),
        r#"echo '{"type":"step_start","timestamp":1,"sessionID":"ses_quiet","part":{"id":"p","snapshot":""}}'"#,
    );

    let (manager, runner, _pool) =
        test_runner(script.to_str().unwrap(), PersistenceWriter::disabled());
    let task_id = manager.create_task("quiet".into(), "x/y".into(), None);
    runner.start(&task_id, "do it", "x/y", None, None).unwrap();

    assert!(wait_for(|| runner.active_count() == 0, WAIT).await);
    // Tolerant of non-compliant workers: no completion event, no failure.
    assert_eq!(manager.get_task_status(&task_id), Some(TaskStatus::Working));
}

#[tokio::test]
async fn test_respond_continuation_reuses_task_pipeline() {
    let dir = TempDir::new().unwrap();
    // The continuation form starts with the run subcommand.
    let script = write_worker_script(
        dir.path(),
        r#"if [ "$1" = "run" ]; then
  echo '{"type":"text","timestamp":5,"sessionID":"ses_r","part":{"id":"p","text":"resumed"}}'
  echo '{"type":"step_finish","timestamp":6,"sessionID":"ses_r","part":{"id":"p","reason":"stop","tokens":{"input":0,"output":0,"reasoning":0},"cost":0.0}}'
fi"#,
    );

    let (manager, runner, _pool) =
        test_runner(script.to_str().unwrap(), PersistenceWriter::disabled());
    let task_id = manager.create_task("respond".into(), "x/y".into(), None);
    runner.respond(&task_id, "ses_r", "yes, go ahead");

    assert!(
        wait_for(
            || manager.get_task_status(&task_id) == Some(TaskStatus::Completed),
            WAIT
        )
        .await
    );
    let task = manager.get_task_state(&task_id).unwrap();
    assert_eq!(task.accumulated_text, "resumed");
    assert!(wait_for(|| runner.active_respond_count() == 0, WAIT).await);
}

#[tokio::test]
async fn test_malformed_lines_do_not_abort_stream() {
    let dir = TempDir::new().unwrap();
    let script = write_worker_script(
        dir.path(),
        r#"echo 'this is not json'
echo '{"type":"mystery","timestamp":1,"sessionID":"s","part":{}}'
echo '{"type":"step_finish","timestamp":2,"sessionID":"ses_m","part":{"id":"p","reason":"stop","tokens":{"input":0,"output":0,"reasoning":0},"cost":0.0}}'"#,
    );

    let (manager, runner, _pool) =
        test_runner(script.to_str().unwrap(), PersistenceWriter::disabled());
    let task_id = manager.create_task("messy".into(), "x/y".into(), None);
    runner.start(&task_id, "do it", "x/y", None, None).unwrap();

    assert!(
        wait_for(
            || manager.get_task_status(&task_id) == Some(TaskStatus::Completed),
            WAIT
        )
        .await
    );
}
