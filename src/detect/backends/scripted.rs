//! Deterministic detector driven by a track script.
//!
//! A script lists tracks with timed waypoints for their anchor point. At each
//! frame the backend reports every track whose waypoint span covers the frame
//! timestamp, interpolating the position linearly. Used for rule and pipeline
//! tests and for replaying recorded annotations through `vigild`.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection, ObjectClass};
use crate::frame::Frame;
use crate::geometry::Point;
use crate::TrackId;

fn default_confidence() -> f32 {
    0.9
}

fn default_size() -> (f64, f64) {
    (40.0, 80.0)
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct Waypoint {
    pub t_ms: u64,
    pub x: f64,
    pub y: f64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ScriptedTrack {
    pub track_id: Option<TrackId>,
    pub class: ObjectClass,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    /// Box width and height in pixels.
    #[serde(default = "default_size")]
    pub size: (f64, f64),
    #[serde(default)]
    pub feature: Option<Vec<f32>>,
    pub waypoints: Vec<Waypoint>,
}

impl ScriptedTrack {
    fn position_at(&self, t_ms: u64) -> Option<Point> {
        let first = self.waypoints.first()?;
        let last = self.waypoints.last()?;
        if t_ms < first.t_ms || t_ms > last.t_ms {
            return None;
        }
        for pair in self.waypoints.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if t_ms >= a.t_ms && t_ms <= b.t_ms {
                let span = (b.t_ms - a.t_ms) as f64;
                let f = if span == 0.0 {
                    1.0
                } else {
                    (t_ms - a.t_ms) as f64 / span
                };
                return Some(Point::new(a.x + (b.x - a.x) * f, a.y + (b.y - a.y) * f));
            }
        }
        Some(Point::new(last.x, last.y))
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct DetectionScript {
    pub tracks: Vec<ScriptedTrack>,
}

impl DetectionScript {
    pub fn from_json(raw: &str) -> Result<Self> {
        let script: DetectionScript =
            serde_json::from_str(raw).map_err(|e| anyhow!("invalid detection script: {}", e))?;
        for track in &script.tracks {
            if track.waypoints.is_empty() {
                return Err(anyhow!("scripted track {:?} has no waypoints", track.track_id));
            }
            if track.waypoints.windows(2).any(|w| w[1].t_ms < w[0].t_ms) {
                return Err(anyhow!(
                    "scripted track {:?} waypoints must be time-ordered",
                    track.track_id
                ));
            }
        }
        Ok(script)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read detection script {}", path.display()))?;
        Self::from_json(&raw)
    }
}

pub struct ScriptedBackend {
    script: DetectionScript,
}

impl ScriptedBackend {
    pub fn new(script: DetectionScript) -> Self {
        Self { script }
    }

    pub fn detections_at(&self, t_ms: u64) -> Vec<Detection> {
        self.script
            .tracks
            .iter()
            .filter_map(|track| {
                let anchor = track.position_at(t_ms)?;
                let (w, h) = track.size;
                Some(Detection {
                    bbox: BoundingBox::new(anchor.x - w / 2.0, anchor.y - h, anchor.x + w / 2.0, anchor.y),
                    class: track.class,
                    confidence: track.confidence,
                    track_id: track.track_id,
                    feature: track.feature.clone(),
                })
            })
            .collect()
    }
}

impl DetectorBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        Ok(self.detections_at(frame.timestamp_ms()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = r#"{
        "tracks": [
            {"track_id": 1, "class": "person", "size": [10, 20],
             "waypoints": [{"t_ms": 0, "x": 0, "y": 100}, {"t_ms": 1000, "x": 100, "y": 100}]}
        ]
    }"#;

    #[test]
    fn scripted_positions_interpolate() {
        let backend = ScriptedBackend::new(DetectionScript::from_json(SCRIPT).unwrap());
        let dets = backend.detections_at(500);
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].anchor_point(), Point::new(50.0, 100.0));
        assert_eq!(dets[0].track_id, Some(1));
        assert!(backend.detections_at(1_001).is_empty());
    }

    #[test]
    fn unordered_waypoints_are_rejected() {
        let raw = r#"{"tracks":[{"track_id":1,"class":"person",
            "waypoints":[{"t_ms":10,"x":0,"y":0},{"t_ms":5,"x":1,"y":1}]}]}"#;
        assert!(DetectionScript::from_json(raw).is_err());
    }
}
