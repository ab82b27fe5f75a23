//! Vigil event pipeline
//!
//! This crate turns a continuous video source into discrete, persisted events:
//! bounded clips with metadata, triggered by behavior rules.
//!
//! # Architecture
//!
//! One `SourcePipeline` per video source, built from four stages connected by
//! bounded queues:
//!
//! 1. **Ingest**: pulls frames from the source; live sources drop the oldest queued frame on overload.
//! 2. **Inference**: runs the detector in-process, or in a supervised worker process.
//! 3. **Event**: behavior rules + event state machine; emits recorder commands.
//! 4. **Recorder**: pre-trigger buffer, clip writing, persistence and notification handoff.
//!
//! # Module Structure
//!
//! - `frame`: Frame ownership type and the pre-trigger ring buffer
//! - `geometry`, `rules`: rule primitives and the behavior rule engine
//! - `event`: per-source event lifecycle state machine
//! - `pipeline`: queues, stage runner, pipeline composition
//! - `supervisor`: isolated inference worker supervision
//! - `recorder`: recording coordinator and clip writers
//! - `storage`, `transport`: persistence and notification collaborators
//! - Core types: Priority, TriggerInfo, EventRecord, EventSummary

use anyhow::Result;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod detect;
pub mod event;
pub mod frame;
pub mod geometry;
pub mod ingest;
pub mod pipeline;
pub mod recorder;
pub mod rules;
pub mod storage;
pub mod supervisor;
pub mod transport;

pub use detect::{Detection, DetectorBackend, FrameDetections, ObjectClass};
pub use event::{EventState, EventStateMachine, RecorderCommand};
pub use frame::{Frame, FrameBuffer};
pub use pipeline::{PipelineQueue, SourcePipeline};
pub use rules::{RuleEngine, RuleSignal, SignalKind};
pub use storage::{EventStore, InMemoryEventStore, PersonRecord, SqliteEventStore};
pub use supervisor::InferenceSupervisor;
pub use transport::{LogNotifier, Notifier};

/// Identifier assigned to a track by the external tracking collaborator.
pub type TrackId = u64;

/// Rule id used for events opened by plain detections.
pub const BASELINE_RULE_ID: &str = "baseline";

pub(crate) fn now_ms() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis() as u64)
}

/// Random 16-hex-character identifier for events and activities.
pub fn new_event_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// -------------------- Priorities --------------------

/// Event priority. Ordering is total: tripwire > dwell > baseline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    pub const BASELINE: Priority = Priority(0);
    pub const DEFAULT_DWELL: Priority = Priority(1);
    pub const DEFAULT_TRIPWIRE: Priority = Priority(2);

    pub fn new(level: u8) -> Self {
        Priority(level)
    }

    pub fn level(self) -> u8 {
        self.0
    }
}

// -------------------- Triggers --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Baseline,
    Dwell,
    Tripwire,
}

/// What caused (or escalated) a recording.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TriggerInfo {
    pub kind: TriggerKind,
    pub rule_id: String,
    pub priority: Priority,
    pub track_id: Option<TrackId>,
    /// Frame timestamp at which the trigger was observed.
    pub at_ms: u64,
}

impl TriggerInfo {
    pub fn baseline(at_ms: u64) -> Self {
        Self {
            kind: TriggerKind::Baseline,
            rule_id: BASELINE_RULE_ID.to_string(),
            priority: Priority::BASELINE,
            track_id: None,
            at_ms,
        }
    }

    pub fn from_signal(signal: &RuleSignal) -> Self {
        let kind = match signal.kind {
            SignalKind::Dwell => TriggerKind::Dwell,
            SignalKind::Tripwire => TriggerKind::Tripwire,
        };
        Self {
            kind,
            rule_id: signal.rule_id.clone(),
            priority: signal.priority,
            track_id: Some(signal.track_id),
            at_ms: signal.timestamp_ms,
        }
    }
}

// -------------------- Event Records --------------------

/// One file written for a clip. A clip normally has a single part; encoder
/// reopen after a write failure starts a new part.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentFile {
    pub path: PathBuf,
    pub frames: u64,
    pub bytes: u64,
    /// Hex SHA-256 of the file contents.
    pub sha256: String,
}

/// Row id of a person in the persistent identity gallery.
pub type PersonId = i64;

/// Cluster of similar feature vectors observed during a clip.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureSummary {
    pub centroid: Vec<f32>,
    pub members: u32,
}

/// Finalized, immutable record of one clip. Exactly one per finalized clip.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: String,
    pub source_id: String,
    /// Shared by all segments of one continuous activity.
    pub activity_id: String,
    pub segment_index: u32,
    pub start_ms: u64,
    pub end_ms: u64,
    pub trigger_rule_id: String,
    pub trigger_kind: TriggerKind,
    pub priority: Priority,
    /// Triggers this clip was escalated from, oldest first.
    pub escalations: Vec<TriggerInfo>,
    pub segments: Vec<SegmentFile>,
    pub feature_summaries: Vec<FeatureSummary>,
    /// Gallery identity of the clip's main subject, when features were seen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub person_id: Option<PersonId>,
    pub frame_count: u64,
    /// Frames recorded while inference was unavailable.
    pub gap_frames: u64,
    pub truncated: bool,
}

impl EventRecord {
    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }

    pub fn summary(&self) -> EventSummary {
        EventSummary {
            event_id: self.event_id.clone(),
            source_id: self.source_id.clone(),
            trigger_rule_id: self.trigger_rule_id.clone(),
            trigger_kind: self.trigger_kind,
            priority: self.priority,
            start_ms: self.start_ms,
            end_ms: self.end_ms,
            clip: self.segments.first().map(|s| s.path.clone()),
            person_id: self.person_id,
            truncated: self.truncated,
        }
    }
}

/// Compact view of a record for notifications.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventSummary {
    pub event_id: String,
    pub source_id: String,
    pub trigger_rule_id: String,
    pub trigger_kind: TriggerKind,
    pub priority: Priority,
    pub start_ms: u64,
    pub end_ms: u64,
    pub clip: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub person_id: Option<PersonId>,
    pub truncated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_order_is_total() {
        assert!(Priority::DEFAULT_TRIPWIRE > Priority::DEFAULT_DWELL);
        assert!(Priority::DEFAULT_DWELL > Priority::BASELINE);
        assert_eq!(Priority::new(3).level(), 3);
    }

    #[test]
    fn trigger_from_signal_keeps_rule_and_track() {
        let signal = RuleSignal {
            rule_id: "wire:gate".to_string(),
            kind: SignalKind::Tripwire,
            priority: Priority::DEFAULT_TRIPWIRE,
            track_id: 7,
            timestamp_ms: 1_500,
        };
        let trigger = TriggerInfo::from_signal(&signal);
        assert_eq!(trigger.kind, TriggerKind::Tripwire);
        assert_eq!(trigger.rule_id, "wire:gate");
        assert_eq!(trigger.track_id, Some(7));
        assert_eq!(trigger.at_ms, 1_500);
    }

    #[test]
    fn event_ids_are_random_hex() {
        let a = new_event_id();
        let b = new_event_id();
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn summary_points_at_first_clip_part() {
        let record = EventRecord {
            event_id: "e1".to_string(),
            source_id: "cam".to_string(),
            activity_id: "a1".to_string(),
            segment_index: 0,
            start_ms: 1_000,
            end_ms: 4_000,
            trigger_rule_id: BASELINE_RULE_ID.to_string(),
            trigger_kind: TriggerKind::Baseline,
            priority: Priority::BASELINE,
            escalations: vec![],
            segments: vec![SegmentFile {
                path: PathBuf::from("/tmp/a.vclip"),
                frames: 30,
                bytes: 100,
                sha256: String::new(),
            }],
            feature_summaries: vec![],
            person_id: Some(7),
            frame_count: 30,
            gap_frames: 0,
            truncated: false,
        };
        assert_eq!(record.duration_ms(), 3_000);
        let summary = record.summary();
        assert_eq!(summary.clip, Some(PathBuf::from("/tmp/a.vclip")));
        assert_eq!(summary.person_id, Some(7));
    }
}
