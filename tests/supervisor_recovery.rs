use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use vigil::ingest::{SourceConfig, SourceKind};
use vigil::pipeline::{InferenceMode, InferenceSettings, PipelineSettings};
use vigil::recorder::RecorderConfig;
use vigil::supervisor::{InferenceSupervisor, SupervisorConfig, WorkerState};
use vigil::transport::CollectingNotifier;
use vigil::{Frame, InMemoryEventStore, SourcePipeline};

fn worker_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_vigil_infer_worker"))
}

fn supervisor(extra: &[&str], liveness: Duration) -> InferenceSupervisor {
    let mut worker_args = vec!["--backend".to_string(), "stub".to_string()];
    worker_args.extend(extra.iter().map(|s| s.to_string()));
    InferenceSupervisor::new(SupervisorConfig {
        worker_path: worker_path(),
        worker_args,
        source_id: "cam".to_string(),
        liveness_timeout: liveness,
        startup_timeout: Duration::from_secs(10),
        max_restart_backoff: Duration::from_secs(1),
    })
}

fn frames(range: std::ops::Range<u64>) -> Vec<Frame> {
    range
        .map(|seq| Frame::new(Arc::from("cam"), seq, seq * 100, 4, 2, vec![0; 24]))
        .collect()
}

#[test]
fn healthy_worker_answers_every_frame() {
    let mut sup = supervisor(&[], Duration::from_secs(5));
    sup.start().expect("start");
    let outcome = sup.run_batch(&frames(0..4));
    assert_eq!(outcome.frames.len(), 4);
    assert_eq!(outcome.gap_count(), 0);
    assert_eq!(sup.state(), WorkerState::Ready);

    let first = sup.submit(&frames(4..6)).expect("submit");
    let first_id = first.batch_id();
    assert_eq!(first.len(), 2);
    assert_eq!(sup.collect(first).gap_count(), 0);
    let second = sup.submit(&frames(6..7)).expect("submit");
    assert!(second.batch_id() > first_id);
    assert_eq!(sup.collect(second).frames.len(), 1);
    sup.shutdown();
}

#[test]
fn crash_turns_unanswered_frames_into_gaps_and_restarts() {
    let mut sup = supervisor(&["--crash-on-sequence", "2"], Duration::from_secs(5));
    sup.start().expect("start");
    let first_pid = sup.worker_pid();

    let outcome = sup.run_batch(&frames(0..4));
    let gaps: Vec<u64> = outcome
        .frames
        .iter()
        .filter(|f| f.gap)
        .map(|f| f.sequence)
        .collect();
    assert_eq!(gaps, vec![2, 3]);
    assert!(outcome.error.is_some());
    assert_eq!(sup.state(), WorkerState::Crashed);
    assert!(sup.last_failure_ms().is_some());

    let outcome = sup.run_batch(&frames(4..8));
    assert_eq!(outcome.gap_count(), 0);
    assert_eq!(sup.restart_count(), 1);
    assert_ne!(sup.worker_pid(), first_pid);
    sup.shutdown();
}

#[test]
fn hang_is_detected_by_liveness_timeout() {
    let mut sup = supervisor(&["--hang-on-sequence", "1"], Duration::from_millis(300));
    sup.start().expect("start");

    let started = Instant::now();
    let outcome = sup.run_batch(&frames(0..3));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!outcome.frames[0].gap);
    assert!(outcome.frames[1].gap);
    assert!(outcome.frames[2].gap);

    let outcome = sup.run_batch(&frames(3..5));
    assert_eq!(outcome.gap_count(), 0);
    assert_eq!(sup.restart_count(), 1);
    sup.shutdown();
}

#[test]
fn abort_flag_ends_collect_before_liveness_timeout() {
    let mut sup = supervisor(&["--hang-on-sequence", "1"], Duration::from_secs(30));
    let abort = Arc::new(AtomicBool::new(false));
    sup.set_abort_flag(abort.clone());
    sup.start().expect("start");

    let setter = {
        let abort = abort.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            abort.store(true, Ordering::SeqCst);
        })
    };
    let started = Instant::now();
    let outcome = sup.run_batch(&frames(0..3));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!outcome.frames[0].gap);
    assert_eq!(outcome.gap_count(), 2);
    assert!(outcome.error.is_some());
    assert_eq!(sup.restart_count(), 0);
    assert!(sup.worker_pid().is_none());
    setter.join().expect("setter thread");

    // Still aborted: no new worker is spawned.
    let outcome = sup.run_batch(&frames(3..5));
    assert_eq!(outcome.gap_count(), 2);
    assert_eq!(sup.restart_count(), 0);
}

#[test]
fn pipeline_stop_is_not_held_up_by_a_hung_worker() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = PipelineSettings {
        source_id: "hung".to_string(),
        source: SourceConfig {
            kind: SourceKind::Synthetic,
            url: "stub://hung".to_string(),
            fps: 10,
            width: 32,
            height: 24,
            frame_limit: None,
            realtime: true,
        },
        recorder: RecorderConfig {
            output_dir: dir.path().join("clips"),
            persist_backoff: Duration::from_millis(1),
            ..RecorderConfig::default()
        },
        inference: InferenceSettings {
            mode: InferenceMode::Isolated,
            backend: "stub".to_string(),
            worker_path: worker_path(),
            extra_worker_args: vec!["--hang-on-sequence".to_string(), "3".to_string()],
            batch_size: 1,
            liveness_timeout: Duration::from_secs(30),
            ..InferenceSettings::default()
        },
        ..PipelineSettings::default()
    };

    let mut pipeline = SourcePipeline::new(
        Arc::new(settings),
        Box::new(InMemoryEventStore::new()),
        Box::new(CollectingNotifier::new()),
    )
    .expect("pipeline");
    pipeline.start().expect("start");
    std::thread::sleep(Duration::from_millis(1_000));

    let started = Instant::now();
    let reports = pipeline.stop(Duration::from_millis(500)).expect("stop");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(reports.len(), 4);
    assert!(!pipeline.is_alive());
}

#[test]
fn missing_worker_binary_fails_start() {
    let mut sup = InferenceSupervisor::new(SupervisorConfig {
        worker_path: PathBuf::from("/nonexistent/vigil_infer_worker"),
        worker_args: Vec::new(),
        source_id: "cam".to_string(),
        liveness_timeout: Duration::from_secs(1),
        startup_timeout: Duration::from_secs(1),
        max_restart_backoff: Duration::from_secs(1),
    });
    assert!(sup.start().is_err());
}

#[test]
fn pipeline_survives_worker_crash_without_truncating_event() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = dir.path().join("script.json");
    std::fs::write(
        &script,
        r#"{"tracks":[{"track_id":9,"class":"person","waypoints":[
            {"t_ms":0,"x":20,"y":20},{"t_ms":20000,"x":30,"y":20}]}]}"#,
    )
    .expect("write script");

    let settings = PipelineSettings {
        source_id: "driveway".to_string(),
        source: SourceConfig {
            kind: SourceKind::Synthetic,
            url: "stub://driveway".to_string(),
            fps: 10,
            width: 32,
            height: 24,
            frame_limit: Some(300),
            realtime: false,
        },
        recorder: RecorderConfig {
            output_dir: dir.path().join("clips"),
            persist_backoff: Duration::from_millis(1),
            ..RecorderConfig::default()
        },
        inference: InferenceSettings {
            mode: InferenceMode::Isolated,
            backend: "scripted".to_string(),
            script: Some(script),
            worker_path: worker_path(),
            extra_worker_args: vec!["--crash-on-sequence".to_string(), "50".to_string()],
            batch_size: 4,
            ..InferenceSettings::default()
        },
        ..PipelineSettings::default()
    };

    let store = InMemoryEventStore::new();
    let mut pipeline = SourcePipeline::new(
        Arc::new(settings),
        Box::new(store.clone()),
        Box::new(CollectingNotifier::new()),
    )
    .expect("pipeline");
    pipeline.start().expect("start");
    pipeline.wait().expect("wait");

    let records = store.records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert!(record.gap_frames >= 1);
    assert!(!record.truncated);
    assert_eq!(record.start_ms, 0);
    assert_eq!(record.end_ms, 24_900);

    let stats = pipeline.stats();
    assert!(stats.worker_restarts >= 1);
    assert!(stats.gap_frames >= 1);
    assert_eq!(stats.frames_inferred, 300);
}
