//! Synthetic frame source for `stub://` URLs.
//!
//! Generates a static gray background with a bright square that periodically
//! walks across the frame (10 s visible, 10 s absent), so frame-difference
//! detectors see intermittent activity. Timestamps advance by exactly one
//! frame interval per frame from `start_ms`.

use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{FrameSource, SourceConfig, SourceStats};
use crate::frame::Frame;

const BACKGROUND: u8 = 40;
const SQUARE: u32 = 32;
const SCENE_PERIOD_SECS: u64 = 10;

pub struct SyntheticSource {
    config: SourceConfig,
    source_id: Arc<str>,
    frame_count: u64,
    start_ms: u64,
    started_at: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(config: SourceConfig, source_id: Arc<str>, start_ms: u64) -> Self {
        Self {
            config,
            source_id,
            frame_count: 0,
            start_ms,
            started_at: None,
        }
    }

    fn frame_interval_ms(&self) -> u64 {
        1_000 / u64::from(self.config.fps.max(1))
    }

    fn generate_pixels(&self, sequence: u64) -> Vec<u8> {
        let (w, h) = (self.config.width, self.config.height);
        let mut pixels = vec![BACKGROUND; (w * h * 3) as usize];

        let period = SCENE_PERIOD_SECS * u64::from(self.config.fps.max(1));
        if (sequence / period) % 2 == 0 || w <= SQUARE || h <= SQUARE {
            return pixels;
        }
        let progress = (sequence % period) as f64 / period as f64;
        let sx = ((w - SQUARE) as f64 * progress) as u32;
        let sy = (h - SQUARE) / 2;
        for y in sy..sy + SQUARE {
            for x in sx..sx + SQUARE {
                let idx = ((y * w + x) * 3) as usize;
                pixels[idx..idx + 3].copy_from_slice(&[230, 230, 230]);
            }
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn describe(&self) -> String {
        format!("{} (synthetic)", self.config.url)
    }

    fn connect(&mut self) -> Result<()> {
        // Synthetic sources are always "connected".
        self.started_at.get_or_insert_with(Instant::now);
        log::info!("source connected: {}", self.describe());
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self
            .config
            .frame_limit
            .is_some_and(|limit| self.frame_count >= limit)
        {
            return Ok(None);
        }

        let sequence = self.frame_count;
        let offset_ms = sequence * self.frame_interval_ms();

        if self.config.realtime {
            let started = *self.started_at.get_or_insert_with(Instant::now);
            let due = started + Duration::from_millis(offset_ms);
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }
        }

        let pixels = self.generate_pixels(sequence);
        self.frame_count += 1;
        Ok(Some(Frame::new(
            self.source_id.clone(),
            sequence,
            self.start_ms + offset_ms,
            self.config.width,
            self.config.height,
            pixels,
        )))
    }

    fn is_live(&self) -> bool {
        self.config.frame_limit.is_none()
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            reconnects: 0,
            url: self.config.url.clone(),
        }
    }
}
