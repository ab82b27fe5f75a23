use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::event::EventTimings;
use crate::ingest::SourceConfig;
use crate::recorder::RecorderConfig;
use crate::rules::RuleSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceMode {
    InProcess,
    /// Detector runs in a supervised `vigil_infer_worker` process.
    Isolated,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InferenceSettings {
    pub mode: InferenceMode,
    pub backend: String,
    pub script: Option<PathBuf>,
    pub worker_path: PathBuf,
    /// Appended to the worker command line (fault injection in tests).
    pub extra_worker_args: Vec<String>,
    /// Frames per worker batch. In-process inference always runs per frame.
    pub batch_size: usize,
    pub liveness_timeout: Duration,
    pub startup_timeout: Duration,
    pub max_restart_backoff: Duration,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            mode: InferenceMode::InProcess,
            backend: "motion".to_string(),
            script: None,
            worker_path: PathBuf::from("vigil_infer_worker"),
            extra_worker_args: Vec::new(),
            batch_size: 4,
            liveness_timeout: Duration::from_secs(5),
            startup_timeout: Duration::from_secs(10),
            max_restart_backoff: Duration::from_secs(10),
        }
    }
}

impl InferenceSettings {
    pub fn worker_command_args(&self) -> Vec<String> {
        let mut args = vec!["--backend".to_string(), self.backend.clone()];
        if let Some(script) = &self.script {
            args.push("--script".to_string());
            args.push(script.to_string_lossy().to_string());
        }
        args.extend(self.extra_worker_args.iter().cloned());
        args
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueCapacities {
    pub frames: usize,
    pub annotated: usize,
    pub recorder: usize,
    pub faults: usize,
}

impl Default for QueueCapacities {
    fn default() -> Self {
        Self {
            frames: 4,
            annotated: 32,
            recorder: 64,
            faults: 64,
        }
    }
}

/// Source reacquisition after read failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive failures before a fault is raised to close the recording.
    pub fault_after: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            fault_after: 3,
        }
    }
}

/// Immutable configuration snapshot of one source pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineSettings {
    pub source_id: String,
    pub source: SourceConfig,
    pub rules: RuleSet,
    pub timings: EventTimings,
    pub recorder: RecorderConfig,
    pub inference: InferenceSettings,
    pub queues: QueueCapacities,
    pub reconnect: ReconnectPolicy,
    /// How often the event stage logs queue statistics.
    pub stats_interval: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            source_id: "front_camera".to_string(),
            source: SourceConfig::default(),
            rules: RuleSet::default(),
            timings: EventTimings::default(),
            recorder: RecorderConfig::default(),
            inference: InferenceSettings::default(),
            queues: QueueCapacities::default(),
            reconnect: ReconnectPolicy::default(),
            stats_interval: Duration::from_secs(30),
        }
    }
}

impl PipelineSettings {
    pub fn validate(&self) -> Result<()> {
        if self.source_id.trim().is_empty() {
            bail!("source_id must not be empty");
        }
        self.rules.validate()?;
        if self.timings.max_segment.is_zero() {
            bail!("max segment duration must be greater than zero");
        }
        if self.timings.grace.is_zero() {
            bail!("grace period must be greater than zero");
        }
        if self.timings.grace >= self.timings.max_segment {
            bail!("grace period must be shorter than the max segment duration");
        }
        self.recorder.output.validate()?;
        let q = &self.queues;
        if q.frames == 0 || q.annotated == 0 || q.recorder == 0 || q.faults == 0 {
            bail!("queue capacities must be greater than zero");
        }
        if self.inference.batch_size == 0 {
            bail!("inference batch_size must be greater than zero");
        }
        if self.inference.liveness_timeout.is_zero() || self.inference.startup_timeout.is_zero() {
            bail!("inference timeouts must be greater than zero");
        }
        if self.reconnect.initial_backoff.is_zero() {
            bail!("reconnect backoff must be greater than zero");
        }
        Ok(())
    }
}
