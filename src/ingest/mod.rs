//! Frame ingestion sources.
//!
//! - `stub://` URLs: synthetic frames (testing, demos)
//! - RTSP streams and local files: decoded by an `ffmpeg` child process
//!
//! Every source produces `Frame`s with strictly increasing sequence numbers.
//! `next_frame` returns `Ok(None)` at the end of a finite source; live sources
//! only end by error and are reconnected by the ingest stage.

mod ffmpeg;
mod synthetic;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::frame::Frame;

pub use ffmpeg::FfmpegSource;
pub use synthetic::SyntheticSource;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Synthetic,
    Rtsp,
    File,
}

impl SourceKind {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "synthetic" | "stub" => Ok(SourceKind::Synthetic),
            "rtsp" => Ok(SourceKind::Rtsp),
            "file" => Ok(SourceKind::File),
            other => Err(anyhow!("unknown source kind '{}'", other)),
        }
    }

    /// Guess the kind from a URL.
    pub fn infer(url: &str) -> Self {
        if url.starts_with("stub://") {
            SourceKind::Synthetic
        } else if url.starts_with("rtsp://") || url.starts_with("rtsps://") {
            SourceKind::Rtsp
        } else {
            SourceKind::File
        }
    }
}

/// Configuration for a frame source.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub url: String,
    /// Target frame rate (frames per second).
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    /// Stop after this many frames (end-of-stream).
    pub frame_limit: Option<u64>,
    /// Pace finite sources at `fps` instead of as fast as possible.
    pub realtime: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Synthetic,
            url: "stub://front_camera".to_string(),
            fps: 10,
            width: 640,
            height: 480,
            frame_limit: None,
            realtime: true,
        }
    }
}

/// Statistics for a frame source.
#[derive(Clone, Debug, Default)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub reconnects: u64,
    pub url: String,
}

pub trait FrameSource: Send {
    fn describe(&self) -> String;

    /// Connect, or reconnect after a failure.
    fn connect(&mut self) -> Result<()>;

    /// Next decoded frame, or `None` at end of stream.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Live sources are reconnected on failure; finite ones end.
    fn is_live(&self) -> bool;

    fn is_healthy(&self) -> bool;

    fn stats(&self) -> SourceStats;
}

/// Build the source for a configuration.
pub fn open_source(config: &SourceConfig, source_id: &str) -> Result<Box<dyn FrameSource>> {
    if config.width == 0 || config.height == 0 || config.fps == 0 {
        return Err(anyhow!("source dimensions and fps must be greater than zero"));
    }
    let id: Arc<str> = Arc::from(source_id);
    Ok(match config.kind {
        SourceKind::Synthetic => {
            let start_ms = if config.frame_limit.is_some() {
                0
            } else {
                crate::now_ms()?
            };
            Box::new(SyntheticSource::new(config.clone(), id, start_ms))
        }
        SourceKind::Rtsp | SourceKind::File => Box::new(FfmpegSource::new(config.clone(), id)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_inferred_from_urls() {
        assert_eq!(SourceKind::infer("stub://cam"), SourceKind::Synthetic);
        assert_eq!(SourceKind::infer("rtsp://10.0.0.2/live"), SourceKind::Rtsp);
        assert_eq!(SourceKind::infer("/videos/a.mp4"), SourceKind::File);
        assert_eq!(SourceKind::parse("RTSP").unwrap(), SourceKind::Rtsp);
        assert!(SourceKind::parse("webcam").is_err());
    }

    #[test]
    fn open_source_rejects_zero_sizes() {
        let config = SourceConfig {
            width: 0,
            ..SourceConfig::default()
        };
        assert!(open_source(&config, "cam").is_err());
    }
}
