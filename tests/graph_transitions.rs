mod common;

use std::path::{Path, PathBuf};
use std::time::Duration;

use common::RecordingBackend;
use onair::engine::{Engine, EngineTimers, Flow};
use onair::events::{BusEvent, ErrorPolicy, Origin};
use onair::graph::topology::{AUDIO_MIXER, AUDIO_SELECTOR, VIDEO_SELECTOR};
use onair::graph::{BackendEvent, BranchKey, BranchRole, MediaKind, MediaSource, SelectorId};
use onair::schedule::{PollOutcome, ProgramId, ScheduledProgram};
use onair::announce::MusicVolumeState;
use onair::Config;

fn engine(config: &Config) -> Engine<RecordingBackend> {
    Engine::new(common::controller(config), config, 0.0)
}

fn program(id: i64, video_path: &str) -> ScheduledProgram {
    ScheduledProgram {
        id: ProgramId(id),
        title: format!("program {id}"),
        video_path: video_path.into(),
    }
}

fn resolve(engine: &mut Engine<RecordingBackend>, key: BranchKey, media: &[MediaKind]) {
    for media in media {
        let flow = engine.handle_backend_event(BackendEvent::PadResolved {
            branch: key,
            media: *media,
        });
        assert_eq!(flow, Flow::Continue);
    }
}

fn flow(engine: &mut Engine<RecordingBackend>, key: BranchKey, media: &[MediaKind]) {
    for media in media {
        engine.handle_backend_event(BackendEvent::FirstSample {
            branch: key,
            media: *media,
        });
    }
}

fn drain(engine: &mut Engine<RecordingBackend>, key: BranchKey, media: &[MediaKind]) {
    for media in media {
        engine.handle_backend_event(BackendEvent::Drained {
            branch: key,
            media: *media,
        });
    }
}

fn node_names(engine: &Engine<RecordingBackend>) -> Vec<String> {
    engine
        .controller()
        .topology()
        .nodes()
        .map(|n| n.name.clone())
        .collect()
}

fn write_trigger(path: &Path, timestamp: f64, file: &Path) {
    let body = serde_json::json!({
        "timestamp": timestamp,
        "file": file,
        "action": "play",
    });
    std::fs::write(path, body.to_string()).unwrap();
}

fn announcement_file(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"RIFF").unwrap();
    path
}

const AV: [MediaKind; 2] = [MediaKind::Video, MediaKind::Audio];

#[test]
fn program_airs_then_returns_to_default() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(dir.path());
    let mut engine = engine(&config);
    let links_before = engine.controller().topology().links().to_vec();
    let nodes_before = node_names(&engine);

    engine.handle_poll(PollOutcome::Due(program(7, "ads/promo.mp4")));
    let key = engine.controller().current_key(BranchRole::Program).unwrap();
    assert_eq!(
        engine.controller().backend().attaches(),
        [(key, MediaSource::File(PathBuf::from("/srv/media/ads/promo.mp4")))]
    );

    resolve(&mut engine, key, &AV);
    // Linked but not flowing yet: still on the default composite.
    assert_eq!(engine.controller().active_input(SelectorId::Video), 0);
    assert_eq!(engine.controller().active_input(SelectorId::Audio), 0);

    flow(&mut engine, key, &AV);
    assert_eq!(engine.controller().active_input(SelectorId::Video), 1);
    assert_eq!(engine.controller().active_input(SelectorId::Audio), 1);
    assert_eq!(engine.scheduler().program_on_air(), Some(ProgramId(7)));

    engine.handle_poll(PollOutcome::NothingDue);

    let ctrl = engine.controller();
    assert_eq!(ctrl.active_input(SelectorId::Video), 0);
    assert_eq!(ctrl.active_input(SelectorId::Audio), 0);
    assert!(ctrl.branch(BranchRole::Program).is_none());
    assert_eq!(ctrl.backend().teardowns(), [key]);
    assert!(ctrl.backend().live.is_empty());
    assert_eq!(ctrl.topology().links(), links_before.as_slice());
    assert_eq!(node_names(&engine), nodes_before);
    assert_eq!(
        engine.controller().backend().selects(),
        [
            (VIDEO_SELECTOR.to_string(), "sink_1".to_string()),
            (AUDIO_SELECTOR.to_string(), "sink_1".to_string()),
            (VIDEO_SELECTOR.to_string(), "sink_0".to_string()),
            (AUDIO_SELECTOR.to_string(), "sink_0".to_string()),
        ]
    );
}

#[test]
fn video_only_program_keeps_the_music() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = engine(&common::config(dir.path()));

    engine.handle_poll(PollOutcome::Due(program(3, "/abs/show.mkv")));
    let key = engine.controller().current_key(BranchRole::Program).unwrap();
    resolve(&mut engine, key, &[MediaKind::Video]);
    flow(&mut engine, key, &[MediaKind::Video]);

    assert_eq!(engine.controller().active_input(SelectorId::Video), 1);
    // No audio in the file: music stays on air.
    assert_eq!(engine.controller().active_input(SelectorId::Audio), 0);
}

#[test]
fn flapping_schedule_leaves_no_program_behind() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = engine(&common::config(dir.path()));
    let links_before = engine.controller().topology().links().to_vec();
    let mut stale = Vec::new();

    for id in 1..=12 {
        engine.handle_poll(PollOutcome::Due(program(id, "loop.mp4")));
        let key = engine.controller().current_key(BranchRole::Program).unwrap();
        stale.push(key);
        match id % 3 {
            0 => {}
            1 => resolve(&mut engine, key, &AV),
            _ => {
                resolve(&mut engine, key, &AV);
                flow(&mut engine, key, &AV);
            }
        }
        // Every other round the next program replaces this one directly.
        if id % 2 == 0 {
            engine.handle_poll(PollOutcome::NothingDue);
        }
    }
    engine.handle_poll(PollOutcome::NothingDue);

    let ctrl = engine.controller();
    assert!(ctrl.branch(BranchRole::Program).is_none());
    assert!(ctrl.backend().live.is_empty());
    assert_eq!(ctrl.topology().links(), links_before.as_slice());
    assert!(!node_names(&engine).iter().any(|n| n.starts_with("program")));
    assert!(!engine.scheduler().is_airing());

    // Late notifications from torn-down branches change nothing.
    let calls = engine.controller().backend().calls.len();
    for key in stale {
        resolve(&mut engine, key, &AV);
        flow(&mut engine, key, &AV);
        drain(&mut engine, key, &AV);
    }
    assert_eq!(engine.controller().backend().calls.len(), calls);
    assert_eq!(engine.controller().active_input(SelectorId::Video), 0);
}

#[test]
fn finished_program_stays_off_until_the_schedule_changes() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = engine(&common::config(dir.path()));

    engine.handle_poll(PollOutcome::Due(program(9, "clip.mp4")));
    let key = engine.controller().current_key(BranchRole::Program).unwrap();
    resolve(&mut engine, key, &AV);
    flow(&mut engine, key, &AV);

    drain(&mut engine, key, &[MediaKind::Video]);
    assert_eq!(engine.controller().active_input(SelectorId::Video), 1);
    drain(&mut engine, key, &[MediaKind::Audio]);

    assert_eq!(engine.controller().active_input(SelectorId::Video), 0);
    assert_eq!(engine.controller().active_input(SelectorId::Audio), 0);
    assert!(engine.controller().branch(BranchRole::Program).is_none());
    assert!(engine.scheduler().state().finished);

    engine.handle_poll(PollOutcome::Due(program(9, "clip.mp4")));
    assert_eq!(engine.controller().backend().attaches().len(), 1);

    engine.handle_poll(PollOutcome::NothingDue);
    engine.handle_poll(PollOutcome::Due(program(9, "clip.mp4")));
    assert_eq!(engine.controller().backend().attaches().len(), 2);
}

#[test]
fn branch_error_ends_the_program() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = engine(&common::config(dir.path()));

    engine.handle_poll(PollOutcome::Due(program(4, "broken.mp4")));
    let key = engine.controller().current_key(BranchRole::Program).unwrap();
    resolve(&mut engine, key, &AV);
    flow(&mut engine, key, &AV);

    let flow = engine.handle_backend_event(BackendEvent::Bus(BusEvent::Error {
        origin: Origin::Branch(key),
        source: "program-decode".into(),
        detail: "Internal data stream error".into(),
    }));

    assert_eq!(flow, Flow::Continue);
    assert!(engine.controller().branch(BranchRole::Program).is_none());
    assert_eq!(engine.controller().active_input(SelectorId::Video), 0);
    assert_eq!(engine.scheduler().program_on_air(), Some(ProgramId(4)));
}

#[test]
fn failed_attach_is_retried_on_next_poll() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = engine(&common::config(dir.path()));

    engine.controller_mut().backend_mut().fail_attach = true;
    engine.handle_poll(PollOutcome::Due(program(5, "promo.mp4")));
    assert!(!engine.scheduler().is_airing());
    assert!(engine.controller().branch(BranchRole::Program).is_none());
    assert!(!node_names(&engine).iter().any(|n| n.starts_with("program")));

    engine.controller_mut().backend_mut().fail_attach = false;
    engine.handle_poll(PollOutcome::Due(program(5, "promo.mp4")));
    assert!(engine.scheduler().is_airing());
    assert_eq!(engine.controller().backend().attaches().len(), 1);
}

#[test]
fn poll_failure_keeps_the_program_on_air() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = engine(&common::config(dir.path()));

    engine.handle_poll(PollOutcome::Due(program(6, "promo.mp4")));
    let key = engine.controller().current_key(BranchRole::Program).unwrap();
    engine.handle_poll(PollOutcome::Failed("connection refused".into()));

    assert_eq!(engine.controller().current_key(BranchRole::Program), Some(key));
    assert!(engine.controller().backend().teardowns().is_empty());
}

#[test]
fn newer_announcement_replaces_the_current_one() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(dir.path());
    let trigger = config.announcer.trigger_file.clone();
    let first = announcement_file(dir.path(), "first.wav");
    let second = announcement_file(dir.path(), "second.wav");
    let mut engine = engine(&config);

    write_trigger(&trigger, 100.0, &first);
    engine.check_trigger();
    let k1 = engine.controller().current_key(BranchRole::Announcement).unwrap();
    assert_eq!(engine.ducker().volume(), MusicVolumeState::Ducked);

    write_trigger(&trigger, 101.0, &second);
    engine.check_trigger();
    let k2 = engine.controller().current_key(BranchRole::Announcement).unwrap();
    assert_ne!(k1, k2);
    assert_eq!(engine.controller().backend().live.len(), 1);
    assert_eq!(engine.controller().backend().teardowns(), [k1]);

    resolve(&mut engine, k2, &[MediaKind::Audio]);
    assert_eq!(
        engine.controller().backend().gains(AUDIO_MIXER, "sink_1"),
        [config.audio.announcement_gain]
    );

    // The replaced branch's end must not bring the music back.
    drain(&mut engine, k1, &[MediaKind::Audio]);
    engine.handle_backend_event(BackendEvent::Bus(BusEvent::EndOfStream {
        origin: Origin::Branch(k1),
    }));
    assert_eq!(engine.ducker().volume(), MusicVolumeState::Ducked);

    drain(&mut engine, k2, &[MediaKind::Audio]);
    assert_eq!(engine.ducker().volume(), MusicVolumeState::Normal);
    assert_eq!(engine.ducker().active(), None);

    let ctrl = engine.controller();
    assert_eq!(
        ctrl.backend().gains(AUDIO_MIXER, "sink_0"),
        [config.audio.ducked_gain, config.audio.music_gain]
    );
    assert!(ctrl.branch(BranchRole::Announcement).is_none());
    assert!(ctrl.backend().live.is_empty());
    assert!(!node_names(&engine).iter().any(|n| n.starts_with("announcement")));
}

#[test]
fn older_trigger_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(dir.path());
    let trigger = config.announcer.trigger_file.clone();
    let first = announcement_file(dir.path(), "first.wav");
    let second = announcement_file(dir.path(), "second.wav");
    let mut engine = engine(&config);

    write_trigger(&trigger, 100.0, &first);
    engine.check_trigger();
    write_trigger(&trigger, 50.0, &second);
    engine.check_trigger();
    engine.check_trigger();

    let attaches = engine.controller().backend().attaches();
    assert_eq!(attaches.len(), 1);
    assert_eq!(attaches[0].1, MediaSource::File(first));
}

#[test]
fn announcement_waits_out_program_audio() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(dir.path());
    let file = announcement_file(dir.path(), "news.wav");
    let mut engine = engine(&config);

    engine.handle_poll(PollOutcome::Due(program(8, "promo.mp4")));
    let key = engine.controller().current_key(BranchRole::Program).unwrap();
    resolve(&mut engine, key, &AV);
    flow(&mut engine, key, &AV);

    write_trigger(&config.announcer.trigger_file, 200.0, &file);
    engine.check_trigger();

    assert!(engine.controller().branch(BranchRole::Announcement).is_none());
    assert_eq!(engine.ducker().volume(), MusicVolumeState::Normal);
    assert!(engine.controller().backend().gains(AUDIO_MIXER, "sink_0").is_empty());
}

#[test]
fn announcement_plays_over_a_silent_program() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(dir.path());
    let file = announcement_file(dir.path(), "news.wav");
    let mut engine = engine(&config);

    engine.handle_poll(PollOutcome::Due(program(9, "/abs/slides.mkv")));
    let key = engine.controller().current_key(BranchRole::Program).unwrap();
    resolve(&mut engine, key, &[MediaKind::Video]);
    flow(&mut engine, key, &[MediaKind::Video]);
    assert!(engine.scheduler().is_airing());

    write_trigger(&config.announcer.trigger_file, 200.0, &file);
    engine.check_trigger();

    assert!(engine.controller().branch(BranchRole::Announcement).is_some());
    assert_eq!(engine.ducker().volume(), MusicVolumeState::Ducked);
}

#[test]
fn missing_announcement_file_leaves_music_alone() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(dir.path());
    let mut engine = engine(&config);

    write_trigger(&config.announcer.trigger_file, 100.0, &dir.path().join("gone.wav"));
    engine.check_trigger();

    assert!(engine.controller().branch(BranchRole::Announcement).is_none());
    assert_eq!(engine.ducker().volume(), MusicVolumeState::Normal);
}

#[test]
fn heartbeat_reports_only_progress() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = engine(&common::config(dir.path()));

    assert!(!engine.heartbeat());
    engine.controller_mut().backend_mut().frames = 250;
    assert!(engine.heartbeat());
    assert!(!engine.heartbeat());
    engine.controller_mut().backend_mut().frames = 500;
    assert!(engine.heartbeat());
}

#[test]
fn graph_error_follows_the_policy() {
    let dir = tempfile::tempdir().unwrap();
    let error = || {
        BackendEvent::Bus(BusEvent::Error {
            origin: Origin::Graph,
            source: "primary-sink".into(),
            detail: "Could not connect".into(),
        })
    };

    let mut config = common::config(dir.path());
    let mut keep_running = engine(&config);
    assert_eq!(keep_running.handle_backend_event(error()), Flow::Continue);

    config.events.error_policy = ErrorPolicy::Exit;
    let mut exiting = engine(&config);
    assert!(matches!(exiting.handle_backend_event(error()), Flow::Exit(_)));
}

#[tokio::test]
async fn loop_exits_on_fatal_graph_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::config(dir.path());
    config.events.error_policy = ErrorPolicy::Exit;
    let mut engine = engine(&config);

    let (tx, rx) = flume::unbounded();
    tx.send(BackendEvent::Bus(BusEvent::Error {
        origin: Origin::Graph,
        source: "mux".into(),
        detail: "not negotiated".into(),
    }))
    .unwrap();

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        engine.run(rx, None, EngineTimers::from_config(&config), std::future::pending::<()>()),
    )
    .await
    .unwrap();
    assert!(result.is_err());
}

#[tokio::test]
async fn loop_stops_on_shutdown_and_drains() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(dir.path());
    let mut engine = engine(&config);
    let (_tx, rx) = flume::unbounded();

    let shutdown = tokio::time::sleep(Duration::from_millis(50));
    engine
        .run(rx, None, EngineTimers::from_config(&config), shutdown)
        .await
        .unwrap();
    engine.shutdown(Duration::from_secs(1)).unwrap();

    assert_eq!(
        engine.controller().backend().calls.last(),
        Some(&common::Call::Shutdown)
    );
}
