use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection, ObjectClass};
use crate::frame::Frame;

/// Sampling grid step in pixels.
const GRID_STEP: u32 = 8;
/// Per-sample luminance delta counted as change.
const CHANGE_THRESHOLD: u8 = 24;

/// CPU frame-difference backend.
///
/// Emits one untracked `Unknown` detection covering the changed area when the
/// frame differs from the previous one. Frames of a different size reset it.
#[derive(Default)]
pub struct MotionBackend {
    last_hash: Option<[u8; 32]>,
    last_luma: Vec<u8>,
    last_dims: (u32, u32),
}

impl MotionBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn sample_luma(frame: &Frame) -> Vec<u8> {
        let (w, h) = (frame.width(), frame.height());
        let pixels = frame.pixels();
        let mut out = Vec::with_capacity(((w / GRID_STEP + 1) * (h / GRID_STEP + 1)) as usize);
        for y in (0..h).step_by(GRID_STEP as usize) {
            for x in (0..w).step_by(GRID_STEP as usize) {
                let idx = ((y * w + x) * 3) as usize;
                let luma = match pixels.get(idx..idx + 3) {
                    Some(px) => ((px[0] as u16 + px[1] as u16 * 2 + px[2] as u16) / 4) as u8,
                    None => 0,
                };
                out.push(luma);
            }
        }
        out
    }
}

impl DetectorBackend for MotionBackend {
    fn name(&self) -> &'static str {
        "motion"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let current_hash: [u8; 32] = Sha256::digest(frame.pixels()).into();
        let dims = (frame.width(), frame.height());
        let unchanged = self.last_hash == Some(current_hash);
        let comparable = self.last_hash.is_some() && self.last_dims == dims;
        self.last_hash = Some(current_hash);

        if unchanged {
            return Ok(Vec::new());
        }

        let luma = Self::sample_luma(frame);
        let previous = std::mem::replace(&mut self.last_luma, luma);
        self.last_dims = dims;
        if !comparable || previous.len() != self.last_luma.len() {
            return Ok(Vec::new());
        }

        let cols = dims.0.div_ceil(GRID_STEP);
        let mut changed = 0usize;
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (u32::MAX, u32::MAX, 0u32, 0u32);
        for (i, (a, b)) in previous.iter().zip(self.last_luma.iter()).enumerate() {
            if a.abs_diff(*b) < CHANGE_THRESHOLD {
                continue;
            }
            changed += 1;
            let x = (i as u32 % cols) * GRID_STEP;
            let y = (i as u32 / cols) * GRID_STEP;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x + GRID_STEP);
            max_y = max_y.max(y + GRID_STEP);
        }

        if changed == 0 {
            return Ok(Vec::new());
        }

        let ratio = changed as f32 / self.last_luma.len().max(1) as f32;
        Ok(vec![Detection {
            bbox: BoundingBox::new(
                min_x as f64,
                min_y as f64,
                max_x.min(dims.0) as f64,
                max_y.min(dims.1) as f64,
            ),
            class: ObjectClass::Unknown,
            confidence: (0.5 + ratio).min(0.95),
            track_id: None,
            feature: None,
        }])
    }
}
