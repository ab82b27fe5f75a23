use anyhow::{anyhow, bail, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::event::EventTimings;
use crate::frame::MAX_PRE_TRIGGER_SECS;
use crate::geometry::{Point, Polygon};
use crate::ingest::{SourceConfig, SourceKind};
use crate::pipeline::{
    InferenceMode, InferenceSettings, PipelineSettings, QueueCapacities, ReconnectPolicy,
};
use crate::recorder::{EncodingPolicy, FrameRatePolicy, OutputMode, RecorderConfig, WriterKind};
use crate::rules::{CrossDirection, RegionRule, RuleSet, TripwireRule};
use crate::transport::MqttSettings;
use crate::Priority;

const DEFAULT_DB_PATH: &str = "vigil.db";
const DEFAULT_SOURCE_ID: &str = "front_camera";
const DEFAULT_OUTPUT_DIR: &str = "vigil_clips";
const DEFAULT_SOURCE_URL: &str = "stub://front_camera";
const DEFAULT_FPS: u32 = 10;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_MAX_SEGMENT_SECS: u64 = 60;
const DEFAULT_GRACE_SECS: u64 = 5;
const DEFAULT_PRE_TRIGGER_SECS: u64 = 5;
const DEFAULT_QUALITY: u8 = 23;
const DEFAULT_MQTT_TOPIC_PREFIX: &str = "vigil";
const WORKER_BINARY: &str = "vigil_infer_worker";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct VigildConfigFile {
    source_id: Option<String>,
    db_path: Option<String>,
    output_dir: Option<PathBuf>,
    stats_interval_secs: Option<u64>,
    source: Option<SourceConfigFile>,
    events: Option<EventsConfigFile>,
    output: Option<OutputConfigFile>,
    inference: Option<InferenceConfigFile>,
    rules: Option<RulesConfigFile>,
    queues: Option<QueuesConfigFile>,
    persistence: Option<PersistenceConfigFile>,
    mqtt: Option<MqttConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    kind: Option<String>,
    url: Option<String>,
    fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    frame_limit: Option<u64>,
    realtime: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct EventsConfigFile {
    max_segment_secs: Option<u64>,
    grace_secs: Option<u64>,
    cooldown_secs: Option<u64>,
    pre_trigger_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FrameRateFile {
    Named(String),
    Fps(u32),
}

#[derive(Debug, Deserialize, Default)]
struct OutputConfigFile {
    writer: Option<WriterKind>,
    /// `"passthrough"` or a target rate.
    frame_rate: Option<FrameRateFile>,
    quality: Option<u8>,
    bitrate_kbps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct InferenceConfigFile {
    mode: Option<InferenceMode>,
    backend: Option<String>,
    script: Option<PathBuf>,
    worker_path: Option<PathBuf>,
    batch_size: Option<usize>,
    liveness_timeout_ms: Option<u64>,
    startup_timeout_ms: Option<u64>,
    max_restart_backoff_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RulesConfigFile {
    #[serde(default)]
    regions: Vec<RegionConfigFile>,
    #[serde(default)]
    tripwires: Vec<TripwireConfigFile>,
}

#[derive(Debug, Deserialize)]
struct RegionConfigFile {
    id: String,
    polygon: Vec<[f64; 2]>,
    dwell_secs: f64,
    priority: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct TripwireConfigFile {
    id: String,
    start: [f64; 2],
    end: [f64; 2],
    direction: Option<CrossDirection>,
    priority: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct QueuesConfigFile {
    frames: Option<usize>,
    annotated: Option<usize>,
    recorder: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct PersistenceConfigFile {
    attempts: Option<u32>,
    backoff_ms: Option<u64>,
    person_match_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker: Option<String>,
    topic_prefix: Option<String>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

/// Validated `vigild` configuration.
#[derive(Debug, Clone)]
pub struct VigildConfig {
    pub db_path: String,
    pub pipeline: PipelineSettings,
    pub mqtt: Option<MqttSettings>,
}

impl VigildConfig {
    /// Load from the file named by `VIGIL_CONFIG` (if any), then apply
    /// environment overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("VIGIL_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => VigildConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: VigildConfigFile) -> Result<Self> {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let source_id = file
            .source_id
            .unwrap_or_else(|| DEFAULT_SOURCE_ID.to_string());

        let src = file.source.unwrap_or_default();
        let url = src.url.unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string());
        let kind = match src.kind.as_deref() {
            Some(kind) => SourceKind::parse(kind)?,
            None => SourceKind::infer(&url),
        };
        let source = SourceConfig {
            kind,
            url,
            fps: src.fps.unwrap_or(DEFAULT_FPS),
            width: src.width.unwrap_or(DEFAULT_WIDTH),
            height: src.height.unwrap_or(DEFAULT_HEIGHT),
            frame_limit: src.frame_limit,
            realtime: src.realtime.unwrap_or(true),
        };

        let events = file.events.unwrap_or_default();
        let timings = EventTimings {
            max_segment: Duration::from_secs(
                events.max_segment_secs.unwrap_or(DEFAULT_MAX_SEGMENT_SECS),
            ),
            grace: Duration::from_secs(events.grace_secs.unwrap_or(DEFAULT_GRACE_SECS)),
            cooldown: Duration::from_secs(events.cooldown_secs.unwrap_or(0)),
        };

        let out = file.output.unwrap_or_default();
        let frame_rate = match out.frame_rate {
            None => FrameRatePolicy::Passthrough,
            Some(FrameRateFile::Fps(fps)) => FrameRatePolicy::Target(fps),
            Some(FrameRateFile::Named(name)) if name == "passthrough" => {
                FrameRatePolicy::Passthrough
            }
            Some(FrameRateFile::Named(name)) => {
                bail!("output.frame_rate must be \"passthrough\" or a number, got '{}'", name)
            }
        };
        let encoding = match (out.quality, out.bitrate_kbps) {
            (Some(_), Some(_)) => {
                bail!("output.quality and output.bitrate_kbps are mutually exclusive")
            }
            (_, Some(kbps)) => EncodingPolicy::AverageBitrate(kbps),
            (quality, None) => EncodingPolicy::ConstantQuality(quality.unwrap_or(DEFAULT_QUALITY)),
        };
        let output = OutputMode {
            writer: out.writer.unwrap_or(WriterKind::Raw),
            frame_rate,
            encoding,
            nominal_fps: source.fps,
        };

        let persistence = file.persistence.unwrap_or_default();
        let recorder_defaults = RecorderConfig::default();
        let recorder = RecorderConfig {
            output_dir: file
                .output_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            pre_trigger: Duration::from_secs(
                events.pre_trigger_secs.unwrap_or(DEFAULT_PRE_TRIGGER_SECS),
            ),
            output,
            persist_attempts: persistence
                .attempts
                .unwrap_or(recorder_defaults.persist_attempts),
            persist_backoff: persistence
                .backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(recorder_defaults.persist_backoff),
            person_match_threshold: persistence
                .person_match_threshold
                .unwrap_or(recorder_defaults.person_match_threshold),
            ..recorder_defaults
        };

        let inf = file.inference.unwrap_or_default();
        let inf_defaults = InferenceSettings::default();
        let inference = InferenceSettings {
            mode: inf.mode.unwrap_or(inf_defaults.mode),
            backend: inf.backend.unwrap_or(inf_defaults.backend),
            script: inf.script,
            worker_path: inf.worker_path.unwrap_or_else(default_worker_path),
            extra_worker_args: Vec::new(),
            batch_size: inf.batch_size.unwrap_or(inf_defaults.batch_size),
            liveness_timeout: inf
                .liveness_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(inf_defaults.liveness_timeout),
            startup_timeout: inf
                .startup_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(inf_defaults.startup_timeout),
            max_restart_backoff: inf
                .max_restart_backoff_secs
                .map(Duration::from_secs)
                .unwrap_or(inf_defaults.max_restart_backoff),
        };

        let rules = build_rules(file.rules.unwrap_or_default());

        let q = file.queues.unwrap_or_default();
        let q_defaults = QueueCapacities::default();
        let queues = QueueCapacities {
            frames: q.frames.unwrap_or(q_defaults.frames),
            annotated: q.annotated.unwrap_or(q_defaults.annotated),
            recorder: q.recorder.unwrap_or(q_defaults.recorder),
            faults: q_defaults.faults,
        };

        let mqtt = match file.mqtt {
            Some(m) => m.broker.map(|broker| MqttSettings {
                broker,
                topic_prefix: m
                    .topic_prefix
                    .unwrap_or_else(|| DEFAULT_MQTT_TOPIC_PREFIX.to_string()),
                client_id: m
                    .client_id
                    .unwrap_or_else(|| format!("vigild-{}", source_id)),
                username: m.username,
                password: m.password,
            }),
            None => None,
        };

        let stats_interval = file
            .stats_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(PipelineSettings::default().stats_interval);

        Ok(Self {
            db_path,
            pipeline: PipelineSettings {
                source_id,
                source,
                rules,
                timings,
                recorder,
                inference,
                queues,
                reconnect: ReconnectPolicy::default(),
                stats_interval,
            },
            mqtt,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("VIGIL_SOURCE_URL") {
            if !url.trim().is_empty() {
                self.pipeline.source.kind = SourceKind::infer(&url);
                self.pipeline.source.url = url;
            }
        }
        if let Ok(kind) = std::env::var("VIGIL_SOURCE_KIND") {
            if !kind.trim().is_empty() {
                self.pipeline.source.kind = SourceKind::parse(&kind)?;
            }
        }
        if let Ok(path) = std::env::var("VIGIL_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(dir) = std::env::var("VIGIL_OUTPUT_DIR") {
            if !dir.trim().is_empty() {
                self.pipeline.recorder.output_dir = PathBuf::from(dir);
            }
        }
        if let Some(secs) = env_secs("VIGIL_MAX_SEGMENT_SECS")? {
            self.pipeline.timings.max_segment = secs;
        }
        if let Some(secs) = env_secs("VIGIL_GRACE_SECS")? {
            self.pipeline.timings.grace = secs;
        }
        if let Some(secs) = env_secs("VIGIL_PRE_TRIGGER_SECS")? {
            self.pipeline.recorder.pre_trigger = secs;
        }
        if let Ok(broker) = std::env::var("VIGIL_MQTT_BROKER") {
            if !broker.trim().is_empty() {
                match &mut self.mqtt {
                    Some(mqtt) => mqtt.broker = broker,
                    None => {
                        self.mqtt = Some(MqttSettings {
                            broker,
                            topic_prefix: DEFAULT_MQTT_TOPIC_PREFIX.to_string(),
                            client_id: format!("vigild-{}", self.pipeline.source_id),
                            username: None,
                            password: None,
                        })
                    }
                }
            }
        }
        Ok(())
    }

    /// Override the source URL (command line), inferring its kind.
    pub fn set_source_url(&mut self, url: &str) {
        self.pipeline.source.kind = SourceKind::infer(url);
        self.pipeline.source.url = url.to_string();
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipeline.recorder.pre_trigger > Duration::from_secs(MAX_PRE_TRIGGER_SECS) {
            bail!(
                "pre-trigger window must be at most {} seconds",
                MAX_PRE_TRIGGER_SECS
            );
        }
        if self.pipeline.source.url.trim().is_empty() {
            bail!("source url must not be empty");
        }
        if self.pipeline.source.fps == 0
            || self.pipeline.source.width == 0
            || self.pipeline.source.height == 0
        {
            bail!("source fps, width and height must be greater than zero");
        }
        if self.pipeline.inference.backend == "scripted" && self.pipeline.inference.script.is_none()
        {
            bail!("inference backend 'scripted' requires inference.script");
        }
        if self.db_path.trim().is_empty() {
            bail!("db_path must not be empty");
        }
        let threshold = self.pipeline.recorder.person_match_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            bail!("persistence.person_match_threshold must be in (0, 1]");
        }
        self.pipeline.validate()
    }
}

fn build_rules(file: RulesConfigFile) -> RuleSet {
    let to_point = |p: [f64; 2]| Point::new(p[0], p[1]);
    RuleSet {
        regions: file
            .regions
            .into_iter()
            .map(|r| RegionRule {
                id: r.id,
                polygon: Polygon::new(r.polygon.into_iter().map(to_point).collect()),
                dwell: Duration::try_from_secs_f64(r.dwell_secs).unwrap_or(Duration::ZERO),
                priority: r.priority.map(Priority::new).unwrap_or(Priority::DEFAULT_DWELL),
            })
            .collect(),
        tripwires: file
            .tripwires
            .into_iter()
            .map(|t| TripwireRule {
                id: t.id,
                start: to_point(t.start),
                end: to_point(t.end),
                direction: t.direction.unwrap_or(CrossDirection::Both),
                priority: t
                    .priority
                    .map(Priority::new)
                    .unwrap_or(Priority::DEFAULT_TRIPWIRE),
            })
            .collect(),
    }
}

fn default_worker_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .map(|exe| exe.with_file_name(WORKER_BINARY))
        .filter(|path| path.exists())
        .unwrap_or_else(|| PathBuf::from(WORKER_BINARY))
}

fn env_secs(key: &str) -> Result<Option<Duration>> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => {
            let secs: u64 = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("{} must be an integer number of seconds", key))?;
            Ok(Some(Duration::from_secs(secs)))
        }
        _ => Ok(None),
    }
}

fn read_config_file(path: &Path) -> Result<VigildConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
