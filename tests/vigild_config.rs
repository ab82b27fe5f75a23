use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use vigil::config::VigildConfig;
use vigil::ingest::SourceKind;
use vigil::pipeline::InferenceMode;
use vigil::recorder::{EncodingPolicy, FrameRatePolicy, WriterKind};
use vigil::rules::CrossDirection;
use vigil::Priority;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "VIGIL_CONFIG",
        "VIGIL_SOURCE_URL",
        "VIGIL_SOURCE_KIND",
        "VIGIL_DB_PATH",
        "VIGIL_OUTPUT_DIR",
        "VIGIL_MAX_SEGMENT_SECS",
        "VIGIL_GRACE_SECS",
        "VIGIL_PRE_TRIGGER_SECS",
        "VIGIL_MQTT_BROKER",
    ] {
        std::env::remove_var(key);
    }
}

fn config_file(suffix: &str, body: &str) -> NamedTempFile {
    let mut file = Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    file.write_all(body.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_json_config_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(
        ".json",
        r#"{
            "source_id": "porch_cam",
            "db_path": "porch.db",
            "output_dir": "/var/lib/vigil/porch",
            "source": { "url": "rtsp://10.0.0.8/stream", "fps": 15, "width": 1280, "height": 720 },
            "events": { "max_segment_secs": 120, "grace_secs": 8, "pre_trigger_secs": 3 },
            "output": { "writer": "ffmpeg", "frame_rate": 10, "bitrate_kbps": 2000 },
            "inference": { "mode": "isolated", "backend": "motion", "batch_size": 8 },
            "rules": {
                "regions": [
                    { "id": "zone:porch", "polygon": [[0,0],[100,0],[100,100]], "dwell_secs": 2.5 }
                ],
                "tripwires": [
                    { "id": "line:gate", "start": [0,50], "end": [100,50], "direction": "cross_to_right" }
                ]
            },
            "mqtt": { "broker": "mqtt://broker.local" }
        }"#,
    );

    std::env::set_var("VIGIL_CONFIG", file.path());
    std::env::set_var("VIGIL_GRACE_SECS", "10");
    std::env::set_var("VIGIL_DB_PATH", "override.db");

    let cfg = VigildConfig::load().expect("load config");
    let p = &cfg.pipeline;

    assert_eq!(cfg.db_path, "override.db");
    assert_eq!(p.source_id, "porch_cam");
    assert_eq!(p.source.kind, SourceKind::Rtsp);
    assert_eq!(p.source.url, "rtsp://10.0.0.8/stream");
    assert_eq!((p.source.fps, p.source.width, p.source.height), (15, 1280, 720));
    assert_eq!(p.timings.max_segment, Duration::from_secs(120));
    assert_eq!(p.timings.grace, Duration::from_secs(10));
    assert_eq!(p.recorder.pre_trigger, Duration::from_secs(3));
    assert_eq!(p.recorder.output_dir, PathBuf::from("/var/lib/vigil/porch"));
    assert_eq!(p.recorder.output.writer, WriterKind::Ffmpeg);
    assert_eq!(p.recorder.output.frame_rate, FrameRatePolicy::Target(10));
    assert_eq!(p.recorder.output.encoding, EncodingPolicy::AverageBitrate(2000));
    assert_eq!(p.inference.mode, InferenceMode::Isolated);
    assert_eq!(p.inference.batch_size, 8);
    assert_eq!(p.rules.regions[0].dwell, Duration::from_millis(2500));
    assert_eq!(p.rules.regions[0].priority, Priority::DEFAULT_DWELL);
    assert_eq!(p.rules.tripwires[0].direction, CrossDirection::CrossToRight);
    assert_eq!(p.rules.tripwires[0].priority, Priority::DEFAULT_TRIPWIRE);

    let mqtt = cfg.mqtt.expect("mqtt settings");
    assert_eq!(mqtt.broker, "mqtt://broker.local");
    assert_eq!(mqtt.topic_prefix, "vigil");
    assert_eq!(mqtt.client_id, "vigild-porch_cam");

    clear_env();
}

#[test]
fn loads_toml_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(
        ".toml",
        r#"
source_id = "yard"

[source]
url = "stub://yard"
frame_limit = 100
realtime = false

[output]
frame_rate = "passthrough"
quality = 28

[persistence]
attempts = 5
person_match_threshold = 0.9

[[rules.tripwires]]
id = "line:fence"
start = [10.0, 0.0]
end = [10.0, 100.0]
"#,
    );

    let cfg = VigildConfig::load_from(Some(file.path())).expect("load toml");
    let p = &cfg.pipeline;
    assert_eq!(p.source.kind, SourceKind::Synthetic);
    assert_eq!(p.source.frame_limit, Some(100));
    assert!(!p.source.realtime);
    assert_eq!(p.recorder.output.writer, WriterKind::Raw);
    assert_eq!(p.recorder.output.frame_rate, FrameRatePolicy::Passthrough);
    assert_eq!(p.recorder.output.encoding, EncodingPolicy::ConstantQuality(28));
    assert_eq!(p.rules.tripwires[0].direction, CrossDirection::Both);
    assert_eq!(p.recorder.persist_attempts, 5);
    assert_eq!(p.recorder.person_match_threshold, 0.9);
    assert!(cfg.mqtt.is_none());

    clear_env();
}

#[test]
fn defaults_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    std::env::set_var("VIGIL_SOURCE_URL", "/srv/footage/night.mp4");
    std::env::set_var("VIGIL_MQTT_BROKER", "mqtts://broker.example:8883");

    let cfg = VigildConfig::load().expect("load defaults");
    assert_eq!(cfg.db_path, "vigil.db");
    assert_eq!(cfg.pipeline.source.kind, SourceKind::File);
    assert_eq!(cfg.pipeline.timings.max_segment, Duration::from_secs(60));
    assert_eq!(cfg.pipeline.timings.grace, Duration::from_secs(5));
    assert_eq!(cfg.pipeline.recorder.pre_trigger, Duration::from_secs(5));
    assert_eq!(
        cfg.mqtt.map(|m| m.broker).as_deref(),
        Some("mqtts://broker.example:8883")
    );

    clear_env();
}

#[test]
fn rejects_invalid_configs() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cases = [
        // rule ids must carry their kind prefix
        r#"{ "rules": { "regions": [ { "id": "porch", "polygon": [[0,0],[10,0],[10,10]], "dwell_secs": 1 } ] } }"#,
        r#"{ "output": { "quality": 20, "bitrate_kbps": 1000 } }"#,
        r#"{ "output": { "frame_rate": "variable" } }"#,
        r#"{ "events": { "pre_trigger_secs": 31 } }"#,
        r#"{ "events": { "grace_secs": 60, "max_segment_secs": 60 } }"#,
        r#"{ "inference": { "backend": "scripted" } }"#,
        r#"{ "rules": { "tripwires": [ { "id": "line:a", "start": [1,1], "end": [1,1] } ] } }"#,
        r#"{ "unknown_key": true }"#,
        r#"{ "persistence": { "person_match_threshold": 1.5 } }"#,
        r#"{ "persistence": { "person_match_threshold": 0 } }"#,
    ];
    for body in cases {
        let file = config_file(".json", body);
        assert!(
            VigildConfig::load_from(Some(file.path())).is_err(),
            "accepted invalid config: {}",
            body
        );
    }

    std::env::set_var("VIGIL_GRACE_SECS", "soon");
    assert!(VigildConfig::load_from(None).is_err());

    clear_env();
}
