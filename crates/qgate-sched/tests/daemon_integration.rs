//! End-to-end daemon cycles with scripted scheduler commands.

mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use common::{MockSink, MockSource, file_names, one_running_job};
use qgate_sched::cache::files::set_mtime;
use qgate_sched::{ConfigWatcher, CycleOutcome, Daemon, StopReason};
use tokio::sync::watch;

fn config_yaml(root: &Path, run_limit: usize, queue_limit: usize, shutdown: bool) -> String {
    format!(
        "user: alice
users: [alice, bob]
directories:
  base_dir: {root}/{{user}}/qgate
  dir_mode: 448
queue:
  run_limit: {run_limit}
  queue_limit: {queue_limit}
  sleep_secs: 1
cache:
  dir: {root}/cache
  parse_attempts: 2
  parse_backoff_secs: 0
control:
  shutdown: {shutdown}
",
        root = root.display()
    )
}

fn write_config(root: &Path, yaml: &str) -> PathBuf {
    let path = root.join("qgate.yaml");
    std::fs::write(&path, yaml).unwrap();
    path
}

async fn daemon(root: &Path, source: &Arc<MockSource>, sink: &Arc<MockSink>, yaml: &str) -> Daemon {
    let path = write_config(root, yaml);
    Daemon::new(ConfigWatcher::new(path), source.clone(), sink.clone(), "alice")
        .await
        .unwrap()
}

fn inbox(root: &Path, user: &str) -> PathBuf {
    root.join(user).join("qgate").join("inbox")
}

#[tokio::test]
async fn test_new_creates_operating_user_dirs() {
    let root = tempfile::tempdir().unwrap();
    let source = Arc::new(MockSource::fixed(one_running_job("alice")));
    let sink = Arc::new(MockSink::new());
    daemon(root.path(), &source, &sink, &config_yaml(root.path(), 1, 1, false)).await;

    let base = root.path().join("alice").join("qgate");
    assert_eq!(file_names(&base), vec!["inbox", "info", "staging", "submitted"]);
    // Other users manage their own directories.
    assert!(!root.path().join("bob").exists());
}

#[tokio::test]
async fn test_full_queue_submits_nothing() {
    let root = tempfile::tempdir().unwrap();
    let source = Arc::new(MockSource::fixed(one_running_job("alice")));
    let sink = Arc::new(MockSink::new());
    let mut daemon = daemon(root.path(), &source, &sink, &config_yaml(root.path(), 1, 10, false)).await;
    std::fs::write(inbox(root.path(), "alice").join("job.pbs"), "x\n").unwrap();

    match daemon.run_cycle().await.unwrap() {
        CycleOutcome::Full(Some(status)) => assert_eq!(status.running, 1),
        other => panic!("expected full queue, got {other:?}"),
    }
    assert_eq!(sink.calls(), 0);
    assert_eq!(file_names(&inbox(root.path(), "alice")), vec!["job.pbs"]);
}

#[tokio::test]
async fn test_queued_limit_reached_counts_as_full() {
    let root = tempfile::tempdir().unwrap();
    let queued = one_running_job("alice").replace("<job_state>R</job_state>", "<job_state>Q</job_state>");
    let source = Arc::new(MockSource::fixed(queued));
    let sink = Arc::new(MockSink::new());
    let mut daemon = daemon(root.path(), &source, &sink, &config_yaml(root.path(), 10, 1, false)).await;
    std::fs::write(inbox(root.path(), "alice").join("job.pbs"), "x\n").unwrap();

    assert!(matches!(daemon.run_cycle().await.unwrap(), CycleOutcome::Full(_)));
    assert_eq!(sink.calls(), 0);
}

#[tokio::test]
async fn test_room_below_limit_is_filled() {
    let root = tempfile::tempdir().unwrap();
    let source = Arc::new(MockSource::fixed(one_running_job("alice")));
    let sink = Arc::new(MockSink::new());
    let mut daemon = daemon(root.path(), &source, &sink, &config_yaml(root.path(), 2, 10, false)).await;
    for name in ["a.pbs", "b.pbs", "c.pbs"] {
        std::fs::write(inbox(root.path(), "alice").join(name), "x\n").unwrap();
    }

    match daemon.run_cycle().await.unwrap() {
        CycleOutcome::Worked(report) => assert_eq!(report.submitted, 1),
        other => panic!("expected work, got {other:?}"),
    }
    assert_eq!(source.calls(), 1);
    assert_eq!(file_names(&inbox(root.path(), "alice")).len(), 2);

    // Submitting invalidated the snapshot.
    daemon.run_cycle().await.unwrap();
    assert_eq!(source.calls(), 2);
    assert_eq!(sink.calls(), 2);
}

#[tokio::test]
async fn test_unavailable_cluster_state_counts_as_full() {
    let root = tempfile::tempdir().unwrap();
    let source = Arc::new(MockSource::fixed(""));
    let sink = Arc::new(MockSink::new());
    let mut daemon = daemon(root.path(), &source, &sink, &config_yaml(root.path(), 5, 5, false)).await;
    std::fs::write(inbox(root.path(), "alice").join("job.pbs"), "x\n").unwrap();

    assert_eq!(daemon.run_cycle().await.unwrap(), CycleOutcome::Full(None));
    assert_eq!(sink.calls(), 0);
}

#[tokio::test]
async fn test_unavailable_state_drops_earlier_counts() {
    let root = tempfile::tempdir().unwrap();
    let source = Arc::new(MockSource::new([one_running_job("alice"), String::new()]));
    let sink = Arc::new(MockSink::new());
    let mut daemon = daemon(root.path(), &source, &sink, &config_yaml(root.path(), 1, 10, false)).await;

    assert!(matches!(daemon.run_cycle().await.unwrap(), CycleOutcome::Full(Some(_))));
    daemon.cache_mut().invalidate();
    assert_eq!(daemon.run_cycle().await.unwrap(), CycleOutcome::Full(None));
    assert_eq!(source.calls(), 2);
}

#[tokio::test]
async fn test_filesystem_failure_ends_cycle_not_daemon() {
    let root = tempfile::tempdir().unwrap();
    let source = Arc::new(MockSource::fixed(one_running_job("alice")));
    let sink = Arc::new(MockSink::new());
    let mut daemon = daemon(root.path(), &source, &sink, &config_yaml(root.path(), 5, 10, false)).await;
    for name in ["a.pbs", "b.pbs"] {
        std::fs::write(inbox(root.path(), "alice").join(name), "x\n").unwrap();
    }
    let submitted = root.path().join("alice").join("qgate").join("submitted");
    std::fs::remove_dir(&submitted).unwrap();
    std::fs::write(&submitted, "").unwrap();

    match daemon.run_cycle().await.unwrap() {
        CycleOutcome::Worked(report) => assert!(report.fatal.is_some()),
        other => panic!("expected a cut-short cycle, got {other:?}"),
    }
    assert_eq!(sink.calls(), 1);

    // Next cycle runs normally and re-reads the cluster state.
    assert!(matches!(daemon.run_cycle().await.unwrap(), CycleOutcome::Worked(_)));
    assert_eq!(source.calls(), 2);
    assert_eq!(sink.calls(), 2);
}

#[tokio::test]
async fn test_serve_stops_on_signal() {
    let root = tempfile::tempdir().unwrap();
    let source = Arc::new(MockSource::fixed(one_running_job("alice")));
    let sink = Arc::new(MockSink::new());
    let mut daemon = daemon(root.path(), &source, &sink, &config_yaml(root.path(), 1, 1, false)).await;

    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();
    assert_eq!(daemon.serve(rx).await.unwrap(), StopReason::Signal);
}

#[tokio::test]
async fn test_serve_stops_when_config_requests_shutdown() {
    let root = tempfile::tempdir().unwrap();
    let source = Arc::new(MockSource::fixed(one_running_job("alice")));
    let sink = Arc::new(MockSink::new());
    let mut daemon = daemon(root.path(), &source, &sink, &config_yaml(root.path(), 1, 1, false)).await;

    let path = write_config(root.path(), &config_yaml(root.path(), 1, 1, true));
    set_mtime(&path, SystemTime::now() + Duration::from_secs(5)).await.unwrap();

    let (_tx, rx) = watch::channel(false);
    assert_eq!(daemon.serve(rx).await.unwrap(), StopReason::ConfigShutdown);
    assert!(daemon.config().control.shutdown);
    assert_eq!(source.calls(), 0);
}

#[tokio::test]
async fn test_reload_applies_new_limits() {
    let root = tempfile::tempdir().unwrap();
    let source = Arc::new(MockSource::fixed(one_running_job("alice")));
    let sink = Arc::new(MockSink::new());
    let mut daemon = daemon(root.path(), &source, &sink, &config_yaml(root.path(), 1, 10, false)).await;
    std::fs::write(inbox(root.path(), "alice").join("job.pbs"), "x\n").unwrap();
    assert!(matches!(daemon.run_cycle().await.unwrap(), CycleOutcome::Full(_)));

    let path = write_config(root.path(), &config_yaml(root.path(), 3, 10, true));
    set_mtime(&path, SystemTime::now() + Duration::from_secs(5)).await.unwrap();
    let (_tx, rx) = watch::channel(false);
    daemon.serve(rx).await.unwrap();
    assert_eq!(daemon.config().queue.run_limit, 3);

    match daemon.run_cycle().await.unwrap() {
        CycleOutcome::Worked(report) => assert_eq!(report.submitted, 1),
        other => panic!("expected work, got {other:?}"),
    }
}
