//! Recording coordinator.
//!
//! Owns the pre-trigger buffer and the active clip for one source. Commands
//! from the event stage always precede the frame they were derived from, so:
//!
//! - `Open`: buffered frames are flushed into the new clip, then the trigger
//!   frame follows as a normal frame.
//! - `Segment`: the current clip is finalized and a new clip of the same
//!   activity starts with the boundary frame.
//! - `Close`: the clip is finalized and following frames are buffered again.
//!
//! Every finalized clip produces exactly one `EventRecord`, handed to the
//! store before any further frame is accepted.

mod features;
pub mod writer;

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::event::{CloseReason, RecorderCommand};
use crate::frame::{FrameBuffer, MAX_BUFFER_FRAMES};
use crate::pipeline::AnnotatedFrame;
use crate::storage::EventStore;
use crate::transport::Notifier;
use crate::{new_event_id, EventRecord, FeatureSummary, PersonId, SegmentFile, TriggerInfo};

pub use features::{
    best_gallery_match, cosine_similarity, FeatureClusters, DEFAULT_PERSON_MATCH_THRESHOLD,
    DEFAULT_SIMILARITY_THRESHOLD,
};
pub use writer::{
    read_clip_index, ClipFrame, ClipHeader, ClipIndex, ClipWriter, ClipWriterFactory,
    EncodingPolicy, FrameRatePolicy, OutputMode, OutputWriterFactory, WriterKind,
};

#[derive(Clone, Debug, PartialEq)]
pub struct RecorderConfig {
    pub output_dir: PathBuf,
    pub pre_trigger: Duration,
    pub max_buffer_frames: usize,
    pub output: OutputMode,
    /// Store attempts per record before writing a pending sidecar.
    pub persist_attempts: u32,
    pub persist_backoff: Duration,
    /// Writer failures tolerated per clip before it is salvaged.
    pub max_write_failures: u32,
    pub similarity_threshold: f32,
    /// Gallery match threshold for person identity.
    pub person_match_threshold: f32,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("vigil_clips"),
            pre_trigger: Duration::from_secs(5),
            max_buffer_frames: MAX_BUFFER_FRAMES,
            output: OutputMode::default(),
            persist_attempts: 3,
            persist_backoff: Duration::from_millis(200),
            max_write_failures: 3,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            person_match_threshold: DEFAULT_PERSON_MATCH_THRESHOLD,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct RecorderStats {
    pub clips_finalized: u64,
    pub records_persisted: u64,
    pub records_pending: u64,
    pub frames_written: u64,
    pub write_failures: u64,
    pub repairs: u64,
    /// Pre-trigger buffer occupancy at the time of the snapshot.
    pub buffered_frames: u64,
    pub buffered_bytes: u64,
    /// Decode-to-recorder latency of the most recent frame.
    pub last_frame_latency_ms: u64,
}

struct ActiveClip {
    event_id: String,
    activity_id: String,
    segment_index: u32,
    trigger: TriggerInfo,
    escalations: Vec<TriggerInfo>,
    stem: PathBuf,
    writer: Option<Box<dyn ClipWriter>>,
    parts: Vec<SegmentFile>,
    start_ms: Option<u64>,
    last_ms: Option<u64>,
    frame_count: u64,
    gap_frames: u64,
    features: FeatureClusters,
    write_failures: u32,
}

impl ActiveClip {
    fn part_path(&self, extension: &str) -> PathBuf {
        let mut name = self.stem.as_os_str().to_owned();
        if !self.parts.is_empty() {
            name.push(format!("_p{}", self.parts.len()));
        }
        name.push(".");
        name.push(extension);
        PathBuf::from(name)
    }
}

pub struct RecordingCoordinator {
    source_id: String,
    config: RecorderConfig,
    buffer: FrameBuffer<AnnotatedFrame>,
    active: Option<ActiveClip>,
    writers: Box<dyn ClipWriterFactory>,
    store: Box<dyn EventStore>,
    notifier: Box<dyn Notifier>,
    faults: Vec<String>,
    stats: RecorderStats,
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl RecordingCoordinator {
    pub fn new(
        source_id: &str,
        config: RecorderConfig,
        writers: Box<dyn ClipWriterFactory>,
        store: Box<dyn EventStore>,
        notifier: Box<dyn Notifier>,
    ) -> Result<Self> {
        fs::create_dir_all(&config.output_dir).with_context(|| {
            format!(
                "failed to create output directory {}",
                config.output_dir.display()
            )
        })?;
        Ok(Self {
            source_id: source_id.to_string(),
            buffer: FrameBuffer::new(config.pre_trigger, config.max_buffer_frames),
            config,
            active: None,
            writers,
            store,
            notifier,
            faults: Vec::new(),
            stats: RecorderStats::default(),
        })
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    pub fn buffered_frames(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> RecorderStats {
        RecorderStats {
            buffered_frames: self.buffered_frames() as u64,
            buffered_bytes: self.buffer.memory_bytes() as u64,
            ..self.stats
        }
    }

    /// Faults raised since the last call, for the event stage.
    pub fn take_faults(&mut self) -> Vec<String> {
        std::mem::take(&mut self.faults)
    }

    pub fn on_command(&mut self, command: RecorderCommand) {
        match command {
            RecorderCommand::Open(trigger) => self.on_open(trigger),
            RecorderCommand::Escalate(trigger) => self.on_escalate(trigger),
            RecorderCommand::Segment(trigger) => self.on_segment(trigger),
            RecorderCommand::Close(reason) => self.on_close(reason),
        }
    }

    pub fn on_open(&mut self, trigger: TriggerInfo) {
        if self.active.is_some() {
            log::warn!(
                "open for {} while a clip is active; finalizing the active clip first",
                trigger.rule_id
            );
            self.stats.repairs += 1;
            self.finalize_active(None, false);
        }
        log::info!(
            "clip open on {}: rule={} priority={} at {}",
            self.source_id,
            trigger.rule_id,
            trigger.priority.level(),
            trigger.at_ms
        );
        self.start_clip(trigger, new_event_id(), 0);
        let buffered: Vec<AnnotatedFrame> = self.buffer.drain().collect();
        for item in buffered {
            self.write_to_clip(item);
        }
    }

    /// Metadata only; start time and pre-trigger frames are untouched.
    pub fn on_escalate(&mut self, trigger: TriggerInfo) {
        let Some(clip) = self.active.as_mut() else {
            log::warn!(
                "escalation to {} with no active clip; opening one",
                trigger.rule_id
            );
            self.stats.repairs += 1;
            self.on_open(trigger);
            return;
        };
        if trigger.priority <= clip.trigger.priority {
            log::debug!(
                "ignoring escalation to {} (priority {} <= {})",
                trigger.rule_id,
                trigger.priority.level(),
                clip.trigger.priority.level()
            );
            return;
        }
        log::warn!(
            "clip {} escalated: {} -> {}",
            clip.event_id,
            clip.trigger.rule_id,
            trigger.rule_id
        );
        let previous = std::mem::replace(&mut clip.trigger, trigger);
        clip.escalations.push(previous);
    }

    /// Cut at the boundary frame, which arrives next and starts the new clip.
    pub fn on_segment(&mut self, trigger: TriggerInfo) {
        let Some(clip) = self.active.as_ref() else {
            log::warn!(
                "segment for {} with no active clip; opening one",
                trigger.rule_id
            );
            self.stats.repairs += 1;
            self.on_open(trigger);
            return;
        };
        let activity_id = clip.activity_id.clone();
        let next_index = clip.segment_index + 1;
        self.finalize_active(Some(trigger.at_ms), false);
        log::info!(
            "segment {} of activity {} on {}",
            next_index,
            activity_id,
            self.source_id
        );
        self.start_clip(trigger, activity_id, next_index);
    }

    pub fn on_close(&mut self, reason: CloseReason) {
        if self.active.is_none() {
            log::debug!("close ({:?}) with no active clip", reason);
            return;
        }
        log::info!("clip close on {}: {:?}", self.source_id, reason);
        self.finalize_active(None, false);
    }

    pub fn on_frame(&mut self, item: AnnotatedFrame) {
        self.stats.last_frame_latency_ms = item.frame.age().as_millis() as u64;
        if self.active.is_some() {
            self.write_to_clip(item);
        } else {
            self.buffer.push(item);
        }
    }

    /// Finalize whatever is open. `forced` marks the clip truncated.
    pub fn shutdown(&mut self, forced: bool) {
        if self.active.is_some() {
            if forced {
                log::warn!("forced shutdown; finalizing active clip as truncated");
            }
            self.finalize_active(None, forced);
        }
        self.buffer.clear();
    }

    fn start_clip(&mut self, trigger: TriggerInfo, activity_id: String, segment_index: u32) {
        let event_id = new_event_id();
        let stem = self.config.output_dir.join(format!(
            "{}_{}_{}",
            sanitize(&self.source_id),
            trigger.at_ms,
            event_id
        ));
        let mut clip = ActiveClip {
            event_id,
            activity_id,
            segment_index,
            trigger,
            escalations: Vec::new(),
            stem,
            writer: None,
            parts: Vec::new(),
            start_ms: None,
            last_ms: None,
            frame_count: 0,
            gap_frames: 0,
            features: FeatureClusters::new(self.config.similarity_threshold),
            write_failures: 0,
        };
        let path = clip.part_path(self.writers.extension());
        match self.writers.open(&path) {
            Ok(writer) => clip.writer = Some(writer),
            Err(e) => {
                log::warn!("failed to open clip writer {}: {:#}", path.display(), e);
                clip.write_failures += 1;
                self.stats.write_failures += 1;
            }
        }
        self.active = Some(clip);
    }

    fn write_to_clip(&mut self, item: AnnotatedFrame) {
        let Some(clip) = self.active.as_mut() else {
            self.buffer.push(item);
            return;
        };
        let AnnotatedFrame { frame, detections } = item;

        loop {
            if clip.writer.is_none() {
                if clip.write_failures >= self.config.max_write_failures {
                    break;
                }
                let path = clip.part_path(self.writers.extension());
                match self.writers.open(&path) {
                    Ok(writer) => {
                        log::info!("clip {} continues in {}", clip.event_id, path.display());
                        clip.writer = Some(writer);
                    }
                    Err(e) => {
                        log::warn!("failed to reopen clip writer {}: {:#}", path.display(), e);
                        clip.write_failures += 1;
                        self.stats.write_failures += 1;
                        continue;
                    }
                }
            }
            let Some(writer) = clip.writer.as_mut() else {
                break;
            };
            match writer.write_frame(&frame) {
                Ok(()) => {
                    clip.start_ms.get_or_insert(frame.timestamp_ms());
                    clip.last_ms = Some(frame.timestamp_ms());
                    clip.frame_count += 1;
                    if detections.gap {
                        clip.gap_frames += 1;
                    }
                    for detection in &detections.detections {
                        if let Some(feature) = &detection.feature {
                            clip.features.add(feature);
                        }
                    }
                    self.stats.frames_written += 1;
                    return;
                }
                Err(e) => {
                    clip.write_failures += 1;
                    self.stats.write_failures += 1;
                    log::warn!(
                        "clip {} write failed on frame {} ({}/{}): {:#}",
                        clip.event_id,
                        frame.sequence(),
                        clip.write_failures,
                        self.config.max_write_failures,
                        e
                    );
                    if let Some(broken) = clip.writer.take() {
                        match broken.finish() {
                            Ok(part) => clip.parts.push(part),
                            Err(e) => log::warn!("failed to close broken clip part: {:#}", e),
                        }
                    }
                }
            }
        }

        let detail = format!(
            "clip {} on {} salvaged after {} writer failures",
            clip.event_id, self.source_id, clip.write_failures
        );
        log::error!("{}", detail);
        self.faults.push(detail);
        self.finalize_active(None, true);
    }

    fn finalize_active(&mut self, end_ms: Option<u64>, truncated: bool) {
        let Some(mut clip) = self.active.take() else {
            return;
        };
        if let Some(writer) = clip.writer.take() {
            match writer.finish() {
                Ok(part) => clip.parts.push(part),
                Err(e) => {
                    log::warn!("failed to finish clip {}: {:#}", clip.event_id, e);
                    self.stats.write_failures += 1;
                }
            }
        }

        let start_ms = clip.start_ms.unwrap_or(clip.trigger.at_ms);
        let end_ms = end_ms
            .or(clip.last_ms)
            .unwrap_or(start_ms)
            .max(start_ms);
        let feature_summaries = clip.features.summaries();
        let person_id = self.identify(&clip.event_id, &feature_summaries, end_ms);
        let record = EventRecord {
            event_id: clip.event_id,
            source_id: self.source_id.clone(),
            activity_id: clip.activity_id,
            segment_index: clip.segment_index,
            start_ms,
            end_ms,
            trigger_rule_id: clip.trigger.rule_id.clone(),
            trigger_kind: clip.trigger.kind,
            priority: clip.trigger.priority,
            escalations: clip.escalations,
            segments: clip.parts,
            feature_summaries,
            person_id,
            frame_count: clip.frame_count,
            gap_frames: clip.gap_frames,
            truncated,
        };
        self.stats.clips_finalized += 1;
        log::info!(
            "clip finalized: {} ({} frames, {}..{}, {} part(s){})",
            record.event_id,
            record.frame_count,
            record.start_ms,
            record.end_ms,
            record.segments.len(),
            if truncated { ", truncated" } else { "" }
        );
        self.persist(&record);
        if let Err(e) = self.notifier.notify(&record.summary()) {
            log::debug!("notification for {} failed: {:#}", record.event_id, e);
        }
    }

    fn identify(
        &mut self,
        event_id: &str,
        clusters: &[FeatureSummary],
        seen_ms: u64,
    ) -> Option<PersonId> {
        if clusters.is_empty() {
            return None;
        }
        match self
            .store
            .identify_person(clusters, self.config.person_match_threshold, seen_ms)
        {
            Ok(person) => person,
            Err(e) => {
                log::warn!("person lookup for {} failed: {:#}", event_id, e);
                None
            }
        }
    }

    fn persist(&mut self, record: &EventRecord) {
        let attempts = self.config.persist_attempts.max(1);
        let mut backoff = self.config.persist_backoff;
        for attempt in 1..=attempts {
            match self.store.save_event(record) {
                Ok(()) => {
                    self.stats.records_persisted += 1;
                    return;
                }
                Err(e) if attempt < attempts => {
                    log::warn!(
                        "persisting {} failed (attempt {}/{}): {:#}",
                        record.event_id,
                        attempt,
                        attempts,
                        e
                    );
                    std::thread::sleep(backoff);
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => {
                    log::error!(
                        "persisting {} failed after {} attempts: {:#}",
                        record.event_id,
                        attempts,
                        e
                    );
                }
            }
        }
        self.stats.records_pending += 1;
        let sidecar = self.pending_path(record);
        match write_pending(&sidecar, record) {
            Ok(()) => log::error!("record left for recovery at {}", sidecar.display()),
            Err(e) => log::error!(
                "failed to write pending record {}: {:#}",
                sidecar.display(),
                e
            ),
        }
    }

    fn pending_path(&self, record: &EventRecord) -> PathBuf {
        match record.segments.first() {
            Some(part) => {
                let mut name = part.path.as_os_str().to_owned();
                name.push(".pending.json");
                PathBuf::from(name)
            }
            None => self
                .config
                .output_dir
                .join(format!("{}.pending.json", record.event_id)),
        }
    }
}

fn write_pending(path: &Path, record: &EventRecord) -> Result<()> {
    let json = serde_json::to_vec_pretty(record)?;
    fs::write(path, json)?;
    Ok(())
}
