//! Per-source pipeline composition.
//!
//! ```text
//! source -> [ingest] -frames-> [inference] -annotated-> [event] -recorder-> [recorder]
//!              |                    |                      ^                    |
//!              +------- faults -----+----------------------+-------- faults ----+
//! ```
//!
//! Queue policies:
//! - `frames`: drop-oldest for live sources (ingest never waits), blocking
//!   for finite sources so replays are lossless.
//! - `annotated`, `recorder`: blocking, so no frame is lost after inference.
//! - `faults`: blocking; drained by the event stage before every frame.
//!
//! Shutdown is stage by stage: ingest stops, each stage drains its input,
//! flushes and closes its output. Stages still running when the drain
//! window ends are aborted; the recorder then finalizes its clip as truncated.

pub mod queue;
mod settings;
pub mod stage;
mod stages;

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::detect::{BackendOptions, BackendRegistry, FrameDetections};
use crate::event::RecorderCommand;
use crate::frame::{Frame, Timestamped};
use crate::ingest::open_source;
use crate::recorder::{OutputWriterFactory, RecorderStats, RecordingCoordinator};
use crate::storage::EventStore;
use crate::supervisor::{InferenceSupervisor, SupervisorConfig};
use crate::transport::Notifier;

pub use queue::{OverflowPolicy, PipelineQueue, Pop, QueueClosed, QueueStats};
pub use settings::{
    InferenceMode, InferenceSettings, PipelineSettings, QueueCapacities, ReconnectPolicy,
};
pub use stage::{
    spawn_source, spawn_stage, spawn_stage_with, Flow, Stage, StageControl, StageHandle,
    StageReport, StopReason,
};
pub use stages::{EventStage, InferenceEngine, InferenceStage, IngestStage, RecorderStage};

/// A frame with its inference results.
#[derive(Debug)]
pub struct AnnotatedFrame {
    pub frame: Frame,
    pub detections: FrameDetections,
}

impl Timestamped for AnnotatedFrame {
    fn timestamp_ms(&self) -> u64 {
        self.frame.timestamp_ms()
    }

    fn byte_len(&self) -> usize {
        self.frame.byte_len()
    }
}

/// Items on the event -> recorder hop. A command always precedes the frame
/// it was derived from.
#[derive(Debug)]
pub enum RecorderInput {
    Command(RecorderCommand),
    Frame(AnnotatedFrame),
}

/// Failure reported by a stage to the event stage, which closes any open
/// recording defensively.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageFault {
    pub stage: &'static str,
    pub detail: String,
}

/// Counters shared between the stages and the pipeline owner.
#[derive(Clone, Debug, Default, Serialize)]
pub struct PipelineStats {
    pub frames_ingested: u64,
    pub reconnects: u64,
    pub frames_inferred: u64,
    pub gap_frames: u64,
    pub worker_restarts: u64,
    pub commands: u64,
    pub faults: u64,
    pub recorder: RecorderStats,
    pub queues: Vec<QueueStats>,
}

pub(crate) type SharedStats = Arc<Mutex<PipelineStats>>;

pub(crate) fn update_stats(stats: &SharedStats, f: impl FnOnce(&mut PipelineStats)) {
    if let Ok(mut guard) = stats.lock() {
        f(&mut guard);
    }
}

struct Collaborators {
    store: Box<dyn EventStore>,
    notifier: Box<dyn Notifier>,
}

struct Queues {
    frames: PipelineQueue<Frame>,
    annotated: PipelineQueue<AnnotatedFrame>,
    recorder: PipelineQueue<RecorderInput>,
    faults: PipelineQueue<StageFault>,
}

/// One video source's pipeline: ingest, inference, event and recorder stages.
pub struct SourcePipeline {
    settings: Arc<PipelineSettings>,
    collaborators: Option<Collaborators>,
    queues: Option<Queues>,
    /// Ingest, inference, event, recorder.
    handles: Vec<StageHandle>,
    shutdown: Arc<AtomicBool>,
    stats: SharedStats,
}

impl SourcePipeline {
    pub fn new(
        settings: Arc<PipelineSettings>,
        store: Box<dyn EventStore>,
        notifier: Box<dyn Notifier>,
    ) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            collaborators: Some(Collaborators { store, notifier }),
            queues: None,
            handles: Vec::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(Mutex::new(PipelineStats::default())),
        })
    }

    pub fn source_id(&self) -> &str {
        &self.settings.source_id
    }

    /// Build and start every stage. Inference and recorder set-up errors are
    /// returned here, before any frame is read.
    pub fn start(&mut self) -> Result<()> {
        let Collaborators { store, notifier } = self
            .collaborators
            .take()
            .ok_or_else(|| anyhow!("pipeline {} already started", self.settings.source_id))?;
        let settings = self.settings.clone();

        let source = open_source(&settings.source, &settings.source_id)?;
        let frame_policy = if source.is_live() {
            OverflowPolicy::DropOldest
        } else {
            OverflowPolicy::Block
        };
        let queues = Queues {
            frames: PipelineQueue::new("frames", settings.queues.frames, frame_policy)?,
            annotated: PipelineQueue::new(
                "annotated",
                settings.queues.annotated,
                OverflowPolicy::Block,
            )?,
            recorder: PipelineQueue::new(
                "recorder",
                settings.queues.recorder,
                OverflowPolicy::Block,
            )?,
            faults: PipelineQueue::new("faults", settings.queues.faults, OverflowPolicy::Block)?,
        };

        let inference_control = StageControl::new();
        let engine = build_inference(&settings, inference_control.abort_flag())?;
        let coordinator = RecordingCoordinator::new(
            &settings.source_id,
            settings.recorder.clone(),
            Box::new(OutputWriterFactory::new(settings.recorder.output)),
            store,
            notifier,
        )?;

        let recorder = spawn_stage(
            RecorderStage::new(coordinator, queues.faults.clone(), self.stats.clone()),
            queues.recorder.clone(),
            stage::DEFAULT_POLL_INTERVAL,
        )?;
        let event = spawn_stage(
            EventStage::new(
                &settings,
                queues.recorder.clone(),
                queues.faults.clone(),
                self.shutdown.clone(),
                self.stats.clone(),
            ),
            queues.annotated.clone(),
            stage::DEFAULT_POLL_INTERVAL,
        )?;
        let inference = spawn_stage_with(
            InferenceStage::new(
                engine,
                settings.inference.batch_size,
                queues.annotated.clone(),
                self.stats.clone(),
            ),
            queues.frames.clone(),
            stage::DEFAULT_POLL_INTERVAL,
            inference_control,
        )?;
        let ingest = spawn_source(IngestStage::new(
            source,
            settings.reconnect,
            queues.frames.clone(),
            queues.faults.clone(),
            self.stats.clone(),
        ))?;

        self.handles = vec![ingest, inference, event, recorder];
        self.queues = Some(queues);
        log::info!(
            "pipeline {} started ({} via {:?})",
            settings.source_id,
            settings.source.url,
            settings.inference.mode
        );
        Ok(())
    }

    /// True while any stage is still running.
    pub fn is_alive(&self) -> bool {
        self.handles.iter().any(|h| !h.is_finished())
    }

    /// Stop gracefully within `timeout`; stages still running afterwards are
    /// aborted.
    pub fn stop(&mut self, timeout: Duration) -> Result<Vec<StageReport>> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(ingest) = self.handles.first() {
            ingest.control().request_stop();
        }
        let deadline = Instant::now() + timeout;
        let mut aborting = false;
        for handle in &self.handles {
            if !aborting && !handle.wait_until(deadline) {
                log::warn!(
                    "stage {} still running after {:?}; aborting",
                    handle.name(),
                    timeout
                );
                aborting = true;
            }
            if aborting {
                handle.control().abort();
            }
        }
        self.join_all()
    }

    /// Wait for a finite source to run to completion.
    pub fn wait(&mut self) -> Result<Vec<StageReport>> {
        self.join_all()
    }

    fn join_all(&mut self) -> Result<Vec<StageReport>> {
        let mut reports = Vec::new();
        for handle in &mut self.handles {
            match handle.join() {
                Ok(report) => reports.push(report),
                Err(e) => log::error!("{:#}", e),
            }
        }
        self.handles.clear();
        Ok(reports)
    }

    pub fn stats(&self) -> PipelineStats {
        let mut stats = self
            .stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        if let Some(q) = &self.queues {
            stats.queues = vec![
                q.frames.stats(),
                q.annotated.stats(),
                q.recorder.stats(),
                q.faults.stats(),
            ];
        }
        stats
    }
}

impl Drop for SourcePipeline {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            let _ = self.stop(Duration::from_secs(2));
        }
    }
}

fn build_inference(settings: &PipelineSettings, abort: Arc<AtomicBool>) -> Result<InferenceEngine> {
    let inference = &settings.inference;
    match inference.mode {
        InferenceMode::InProcess => {
            let backend = BackendRegistry::with_builtin().create(
                &inference.backend,
                &BackendOptions {
                    script: inference.script.clone(),
                },
            )?;
            Ok(InferenceEngine::InProcess(backend))
        }
        InferenceMode::Isolated => {
            let mut supervisor = InferenceSupervisor::new(SupervisorConfig {
                worker_path: inference.worker_path.clone(),
                worker_args: inference.worker_command_args(),
                source_id: settings.source_id.clone(),
                liveness_timeout: inference.liveness_timeout,
                startup_timeout: inference.startup_timeout,
                max_restart_backoff: inference.max_restart_backoff,
            });
            supervisor.set_abort_flag(abort);
            supervisor.start()?;
            Ok(InferenceEngine::Isolated(Box::new(supervisor)))
        }
    }
}
