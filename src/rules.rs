//! Behavior rule engine.
//!
//! Evaluates tracked objects against region (dwell) and tripwire (directional
//! line-crossing) rules and emits `RuleSignal`s.
//!
//! The engine is owned by the event stage thread. It keeps per-track state:
//! - dwell entry time per (track, region)
//! - last non-`On` side per (track, tripwire)
//! - last anchor position per track (when driven through `evaluate_frame`)
//!
//! A track absent from a frame is forgotten; if its id reappears it is treated
//! as a new track.

use anyhow::{anyhow, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::detect::FrameDetections;
use crate::geometry::{segments_intersect, side_of_line, Point, Polygon, Side};
use crate::{Priority, TrackId};

const REGION_ID_PATTERN: &str = r"^zone:[a-z0-9_-]{1,64}$";
const TRIPWIRE_ID_PATTERN: &str = r"^line:[a-z0-9_-]{1,64}$";

// ----------------------------------------------------------------------------
// Rules
// ----------------------------------------------------------------------------

/// Fires when a track stays inside `polygon` for at least `dwell`.
#[derive(Clone, Debug, PartialEq)]
pub struct RegionRule {
    pub id: String,
    pub polygon: Polygon,
    pub dwell: Duration,
    pub priority: Priority,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossDirection {
    /// Left side to right side of `start -> end`.
    CrossToRight,
    /// Right side to left side of `start -> end`.
    CrossToLeft,
    Both,
}

impl CrossDirection {
    fn allows(self, from: Side, to: Side) -> bool {
        match (self, from, to) {
            (CrossDirection::CrossToRight, Side::Left, Side::Right) => true,
            (CrossDirection::CrossToLeft, Side::Right, Side::Left) => true,
            (CrossDirection::Both, Side::Left, Side::Right)
            | (CrossDirection::Both, Side::Right, Side::Left) => true,
            _ => false,
        }
    }
}

/// Fires when a track's movement crosses the directed segment `start -> end`
/// in the configured direction.
#[derive(Clone, Debug, PartialEq)]
pub struct TripwireRule {
    pub id: String,
    pub start: Point,
    pub end: Point,
    pub direction: CrossDirection,
    pub priority: Priority,
}

/// Immutable rule snapshot handed to the engine.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RuleSet {
    pub regions: Vec<RegionRule>,
    pub tripwires: Vec<TripwireRule>,
}

impl RuleSet {
    /// Check ids, geometry and the fixed priority order
    /// (baseline < every dwell < every tripwire).
    pub fn validate(&self) -> Result<()> {
        let region_re = Regex::new(REGION_ID_PATTERN)?;
        let tripwire_re = Regex::new(TRIPWIRE_ID_PATTERN)?;
        let mut seen = HashSet::new();

        for region in &self.regions {
            if !region_re.is_match(&region.id) {
                return Err(anyhow!(
                    "invalid region rule id '{}': expected zone:<name>",
                    region.id
                ));
            }
            if !seen.insert(region.id.as_str()) {
                return Err(anyhow!("duplicate rule id '{}'", region.id));
            }
            let vertices = region.polygon.vertices();
            if vertices.len() < 3 || vertices.iter().any(|v| !v.is_finite()) {
                return Err(anyhow!(
                    "region '{}' needs at least 3 finite vertices",
                    region.id
                ));
            }
            if region.polygon.area() <= 0.0 {
                return Err(anyhow!("region '{}' polygon has zero area", region.id));
            }
            if region.dwell.is_zero() {
                return Err(anyhow!("region '{}' dwell must be greater than zero", region.id));
            }
            if region.priority <= Priority::BASELINE {
                return Err(anyhow!(
                    "region '{}' priority {} must be above baseline",
                    region.id,
                    region.priority.level()
                ));
            }
        }

        let max_dwell = self
            .regions
            .iter()
            .map(|r| r.priority)
            .max()
            .unwrap_or(Priority::BASELINE);

        for wire in &self.tripwires {
            if !tripwire_re.is_match(&wire.id) {
                return Err(anyhow!(
                    "invalid tripwire rule id '{}': expected line:<name>",
                    wire.id
                ));
            }
            if !seen.insert(wire.id.as_str()) {
                return Err(anyhow!("duplicate rule id '{}'", wire.id));
            }
            if !wire.start.is_finite() || !wire.end.is_finite() || wire.start == wire.end {
                return Err(anyhow!("tripwire '{}' needs two distinct finite points", wire.id));
            }
            if wire.priority <= max_dwell || wire.priority <= Priority::BASELINE {
                return Err(anyhow!(
                    "tripwire '{}' priority {} must be above every dwell priority ({})",
                    wire.id,
                    wire.priority.level(),
                    max_dwell.level()
                ));
            }
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Signals
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Dwell,
    Tripwire,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuleSignal {
    pub rule_id: String,
    pub kind: SignalKind,
    pub priority: Priority,
    pub track_id: TrackId,
    pub timestamp_ms: u64,
}

// ----------------------------------------------------------------------------
// Engine
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug)]
struct DwellState {
    entered_ms: u64,
    fired: bool,
}

pub struct RuleEngine {
    rules: RuleSet,
    dwell: HashMap<(TrackId, usize), DwellState>,
    sides: HashMap<(TrackId, usize), Side>,
    positions: HashMap<TrackId, Point>,
}

impl RuleEngine {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            rules,
            dwell: HashMap::new(),
            sides: HashMap::new(),
            positions: HashMap::new(),
        }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Number of tracks with live state.
    pub fn tracked_count(&self) -> usize {
        self.positions.len()
    }

    /// Evaluate one track position against every rule.
    ///
    /// `previous` is the track's anchor on its previous frame, if any. Without
    /// it no tripwire can fire (a movement segment is required).
    pub fn evaluate(
        &mut self,
        track_id: TrackId,
        centroid: Point,
        previous: Option<Point>,
        timestamp_ms: u64,
    ) -> Vec<RuleSignal> {
        let mut signals = Vec::new();
        if !centroid.is_finite() {
            log::debug!("track {} has a non-finite position; skipped", track_id);
            return signals;
        }

        for (idx, region) in self.rules.regions.iter().enumerate() {
            let key = (track_id, idx);
            if !region.polygon.contains(centroid) {
                self.dwell.remove(&key);
                continue;
            }
            let state = self.dwell.entry(key).or_insert(DwellState {
                entered_ms: timestamp_ms,
                fired: false,
            });
            let inside_ms = timestamp_ms.saturating_sub(state.entered_ms);
            if !state.fired && inside_ms >= region.dwell.as_millis() as u64 {
                state.fired = true;
                log::warn!(
                    "dwell rule {} fired: track {} inside for {} ms",
                    region.id,
                    track_id,
                    inside_ms
                );
                signals.push(RuleSignal {
                    rule_id: region.id.clone(),
                    kind: SignalKind::Dwell,
                    priority: region.priority,
                    track_id,
                    timestamp_ms,
                });
            }
        }

        for (idx, wire) in self.rules.tripwires.iter().enumerate() {
            let side = side_of_line(centroid, wire.start, wire.end);
            if side == Side::On {
                continue;
            }
            let Some(last_side) = self.sides.insert((track_id, idx), side) else {
                continue;
            };
            if last_side == side || !wire.direction.allows(last_side, side) {
                continue;
            }
            let Some(prev) = previous.filter(Point::is_finite) else {
                continue;
            };
            if segments_intersect(prev, centroid, wire.start, wire.end) {
                log::warn!(
                    "tripwire {} crossed by track {} ({:?} -> {:?})",
                    wire.id,
                    track_id,
                    last_side,
                    side
                );
                signals.push(RuleSignal {
                    rule_id: wire.id.clone(),
                    kind: SignalKind::Tripwire,
                    priority: wire.priority,
                    track_id,
                    timestamp_ms,
                });
            }
        }

        signals
    }

    /// Evaluate every tracked detection of a frame.
    ///
    /// Previous positions come from the engine's own store. Tracks missing
    /// from the frame are retired. Gap frames (inference lost) change nothing.
    pub fn evaluate_frame(&mut self, frame: &FrameDetections) -> Vec<RuleSignal> {
        if frame.gap {
            return Vec::new();
        }

        let mut present = HashSet::new();
        let mut signals = Vec::new();
        for (track_id, detection) in frame.tracked() {
            if !present.insert(track_id) {
                continue;
            }
            let anchor = detection.anchor_point();
            let previous = self.positions.get(&track_id).copied();
            signals.extend(self.evaluate(track_id, anchor, previous, frame.timestamp_ms));
            if anchor.is_finite() {
                self.positions.insert(track_id, anchor);
            }
        }

        let absent: Vec<TrackId> = self
            .positions
            .keys()
            .filter(|id| !present.contains(id))
            .copied()
            .collect();
        for track_id in absent {
            self.forget_track(track_id);
        }

        signals
    }

    /// Drop all state for a track.
    pub fn forget_track(&mut self, track_id: TrackId) {
        self.positions.remove(&track_id);
        self.dwell.retain(|(id, _), _| *id != track_id);
        self.sides.retain(|(id, _), _| *id != track_id);
    }

    /// Forget every track, e.g. after the source was lost.
    pub fn reset(&mut self) {
        self.positions.clear();
        self.dwell.clear();
        self.sides.clear();
    }
}
