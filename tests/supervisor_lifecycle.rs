use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use onair::supervisor::{StartStatus, StreamSupervisor, StreamTarget, SupervisorConfig};

fn supervisor(dir: &Path, script: &str, heartbeat_timeout: Duration) -> Arc<StreamSupervisor> {
    StreamSupervisor::new(SupervisorConfig {
        program: "sh".into(),
        args: vec!["-c".into(), script.into()],
        log_file: dir.join("stream_log.txt"),
        monitor_interval: Duration::from_millis(100),
        heartbeat_timeout,
        stop_grace: Duration::from_millis(500),
        overlay_url: None,
        tail_lines: 64,
    })
}

fn target(stream_key: Option<&str>) -> StreamTarget {
    target_at("rtmp://localhost/live", stream_key)
}

fn target_at(primary: &str, stream_key: Option<&str>) -> StreamTarget {
    StreamTarget {
        primary: primary.into(),
        backup: None,
        stream_key: stream_key.map(String::from),
    }
}

/// Polls `check` until it holds or `limit` passes.
async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

#[tokio::test]
async fn silent_child_is_killed_and_relaunched() {
    let dir = tempfile::tempdir().unwrap();
    let sup = supervisor(dir.path(), "echo hi; exec sleep 30", Duration::from_millis(300));

    assert_eq!(sup.start(target(None)).await.unwrap(), StartStatus::Started);
    let relaunched = eventually(Duration::from_secs(5), || sup.launches() >= 2).await;
    sup.shutdown().await;

    assert!(relaunched, "launches: {}", sup.launches());
}

#[tokio::test]
async fn chatty_child_is_left_alone() {
    let dir = tempfile::tempdir().unwrap();
    let sup = supervisor(
        dir.path(),
        "while true; do echo beat; sleep 0.1; done",
        Duration::from_secs(1),
    );

    sup.start(target(None)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(sup.launches(), 1);
    assert!(sup.status().await);
    assert!(sup.recent_logs().iter().all(|l| l == "beat"));
    sup.shutdown().await;
}

#[tokio::test]
async fn exited_child_is_restarted() {
    let dir = tempfile::tempdir().unwrap();
    let sup = supervisor(dir.path(), "echo once; exit 1", Duration::from_secs(30));

    sup.start(target(None)).await.unwrap();
    let restarted = eventually(Duration::from_secs(5), || sup.launches() >= 3).await;
    sup.shutdown().await;

    assert!(restarted, "launches: {}", sup.launches());
}

#[tokio::test]
async fn stop_kills_a_child_that_ignores_sigterm() {
    let dir = tempfile::tempdir().unwrap();
    let sup = supervisor(
        dir.path(),
        "trap '' TERM; echo ready; while true; do sleep 0.1; done",
        Duration::from_secs(30),
    );

    sup.start(target(None)).await.unwrap();
    assert!(
        eventually(Duration::from_secs(5), || sup.recent_logs().iter().any(|l| l == "ready")).await
    );

    let started = Instant::now();
    sup.stop().await;

    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(!sup.status().await);
    assert_eq!(sup.pid().await, None);

    // Stopped means stopped: the watchdog must not bring it back.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(sup.launches(), 1);
    sup.shutdown().await;
}

#[tokio::test]
async fn child_gets_the_target_and_the_key_stays_out_of_the_logs() {
    let dir = tempfile::tempdir().unwrap();
    let sup = supervisor(
        dir.path(),
        r#"echo "target $RTMP_URL/$STREAM_KEY"; exec sleep 30"#,
        Duration::from_secs(30),
    );
    let mut feed = sup.subscribe();

    sup.start(target(Some("abc123"))).await.unwrap();
    let line = tokio::time::timeout(Duration::from_secs(5), feed.recv())
        .await
        .unwrap()
        .unwrap();
    sup.shutdown().await;

    assert_eq!(line, "target rtmp://localhost/live/****");
    let written = std::fs::read_to_string(dir.path().join("stream_log.txt")).unwrap();
    assert!(written.contains("rtmp://localhost/live/****"));
    assert!(!written.contains("abc123"));
}

#[tokio::test]
async fn second_start_reports_already_running() {
    let dir = tempfile::tempdir().unwrap();
    let sup = supervisor(dir.path(), "echo up; exec sleep 30", Duration::from_secs(30));

    assert_eq!(sup.start(target(None)).await.unwrap(), StartStatus::Started);
    assert_eq!(sup.start(target(None)).await.unwrap(), StartStatus::AlreadyRunning);
    assert!(sup.pid().await.is_some());
    assert_eq!(sup.launches(), 1);

    sup.shutdown().await;
    assert!(!sup.status().await);
}

#[tokio::test]
async fn undecodable_output_keeps_the_child_alive() {
    let dir = tempfile::tempdir().unwrap();
    let sup = supervisor(
        dir.path(),
        r"printf 'bad \377 byte\n'; while true; do echo beat; sleep 0.1; done",
        Duration::from_secs(1),
    );

    sup.start(target(None)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let logs = sup.recent_logs();
    sup.shutdown().await;

    assert_eq!(sup.launches(), 1);
    assert_eq!(logs.first().map(String::as_str), Some("bad \u{FFFD} byte"));
    assert!(logs.iter().filter(|l| *l == "beat").count() >= 10);
}

#[tokio::test]
async fn start_while_running_retargets_the_next_launch() {
    let dir = tempfile::tempdir().unwrap();
    let sup = supervisor(
        dir.path(),
        r#"echo "target $RTMP_URL"; sleep 0.5"#,
        Duration::from_secs(30),
    );

    let first = sup.start(target_at("rtmp://old/live", None)).await.unwrap();
    assert_eq!(first, StartStatus::Started);
    let second = sup.start(target_at("rtmp://new/live", None)).await.unwrap();
    assert_eq!(second, StartStatus::AlreadyRunning);

    let retargeted = eventually(Duration::from_secs(5), || {
        sup.recent_logs().iter().any(|l| l == "target rtmp://new/live")
    })
    .await;
    sup.shutdown().await;

    assert!(retargeted, "logs: {:?}", sup.recent_logs());
    assert_eq!(sup.recent_logs()[0], "target rtmp://old/live");
}
