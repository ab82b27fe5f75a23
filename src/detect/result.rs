use serde::{Deserialize, Serialize};

use crate::geometry::Point;
use crate::TrackId;

#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectClass {
    Person,
    Vehicle,
    Animal,
    Package,
    Unknown,
}

/// Axis-aligned box in pixel coordinates, `(x1, y1)` top-left.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BoundingBox {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn center(&self) -> Point {
        Point::new((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Ground contact point: bottom-center of the box.
    pub fn bottom_center(&self) -> Point {
        Point::new((self.x1 + self.x2) / 2.0, self.y2)
    }
}

/// One detected object in one frame. Immutable once produced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class: ObjectClass,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<TrackId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature: Option<Vec<f32>>,
}

impl Detection {
    /// Point used by the behavior rules for a tracked object.
    pub fn anchor_point(&self) -> Point {
        self.bbox.bottom_center()
    }
}

/// Detector output for one frame.
///
/// `gap` marks frames whose inference result was lost (worker crash or hang).
/// A gap frame carries no detections and must not be read as "scene empty"
/// by anything except the grace timer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameDetections {
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub detections: Vec<Detection>,
    #[serde(default)]
    pub gap: bool,
}

impl FrameDetections {
    pub fn new(sequence: u64, timestamp_ms: u64, detections: Vec<Detection>) -> Self {
        Self {
            sequence,
            timestamp_ms,
            detections,
            gap: false,
        }
    }

    pub fn gap(sequence: u64, timestamp_ms: u64) -> Self {
        Self {
            sequence,
            timestamp_ms,
            detections: Vec::new(),
            gap: true,
        }
    }

    pub fn has_activity(&self) -> bool {
        !self.detections.is_empty()
    }

    /// Detections carrying a track id.
    pub fn tracked(&self) -> impl Iterator<Item = (TrackId, &Detection)> {
        self.detections
            .iter()
            .filter_map(|d| d.track_id.map(|id| (id, d)))
    }
}
