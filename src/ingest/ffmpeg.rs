//! FFmpeg-backed source for RTSP streams and local files.
//!
//! Runs the `ffmpeg` CLI as a child process decoding to raw BGR24 on stdout,
//! scaled to the configured size and resampled to the configured rate, and
//! reads exactly one frame's worth of bytes per `next_frame`.
//!
//! Live streams are stamped with the wall-clock time of the first connect plus
//! monotonic elapsed time, so stamps never go backwards when the system clock
//! is stepped. Files are stamped with media time from zero (one frame interval
//! per frame).

use anyhow::{anyhow, Context, Result};
use std::io::{ErrorKind, Read};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::time::Instant;

use super::{FrameSource, SourceConfig, SourceKind, SourceStats};
use crate::frame::Frame;

/// Wall-clock anchor advanced by `Instant`, never decreasing.
#[derive(Debug)]
struct LiveClock {
    anchor_ms: u64,
    started: Instant,
    last_ms: u64,
}

impl LiveClock {
    fn new(anchor_ms: u64, started: Instant) -> Self {
        Self {
            anchor_ms,
            started,
            last_ms: anchor_ms,
        }
    }

    fn stamp_at(&mut self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.started).as_millis() as u64;
        self.last_ms = self.last_ms.max(self.anchor_ms + elapsed);
        self.last_ms
    }

    fn stamp(&mut self) -> u64 {
        self.stamp_at(Instant::now())
    }
}

pub struct FfmpegSource {
    config: SourceConfig,
    source_id: Arc<str>,
    child: Option<(Child, ChildStdout)>,
    frame_count: u64,
    reconnects: u64,
    connected_once: bool,
    last_error: Option<String>,
    clock: Option<LiveClock>,
}

impl FfmpegSource {
    pub fn new(config: SourceConfig, source_id: Arc<str>) -> Self {
        Self {
            config,
            source_id,
            child: None,
            frame_count: 0,
            reconnects: 0,
            connected_once: false,
            last_error: None,
            clock: None,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-hide_banner", "-loglevel", "error", "-nostdin"]);
        match self.config.kind {
            SourceKind::Rtsp => {
                cmd.args(["-rtsp_transport", "tcp", "-rtbufsize", "20M"]);
            }
            SourceKind::File if self.config.realtime => {
                cmd.arg("-re");
            }
            _ => {}
        }
        let scale = format!("scale={}:{}", self.config.width, self.config.height);
        let rate = self.config.fps.to_string();
        cmd.args(["-i", self.config.url.as_str()]);
        cmd.args([
            "-vf",
            scale.as_str(),
            "-r",
            rate.as_str(),
            "-f",
            "rawvideo",
            "-pix_fmt",
            "bgr24",
            "-",
        ]);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        cmd
    }

    fn frame_bytes(&self) -> usize {
        self.config.width as usize * self.config.height as usize * 3
    }

    fn kill_child(&mut self) {
        if let Some((mut child, _)) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl FrameSource for FfmpegSource {
    fn describe(&self) -> String {
        format!("{} (ffmpeg {:?})", self.config.url, self.config.kind)
    }

    fn connect(&mut self) -> Result<()> {
        self.kill_child();
        if self.connected_once {
            self.reconnects += 1;
        }
        let mut child = self
            .command()
            .spawn()
            .with_context(|| format!("failed to start ffmpeg for {}", self.config.url))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("ffmpeg stdout unavailable"))?;
        self.child = Some((child, stdout));
        if self.clock.is_none() && self.is_live() {
            self.clock = Some(LiveClock::new(crate::now_ms()?, Instant::now()));
        }
        self.connected_once = true;
        self.last_error = None;
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

        let frame_bytes = self.frame_bytes();
        let (_, stdout) = self
            .child
            .as_mut()
            .ok_or_else(|| anyhow!("source not connected"))?;

        let mut data = vec![0u8; frame_bytes];
        if let Err(e) = stdout.read_exact(&mut data) {
            self.kill_child();
            if e.kind() == ErrorKind::UnexpectedEof && self.config.kind == SourceKind::File {
                log::info!("source {} reached end of file", self.config.url);
                return Ok(None);
            }
            self.last_error = Some(e.to_string());
            return Err(anyhow!("ffmpeg stream {} ended: {}", self.config.url, e));
        }

        let sequence = self.frame_count;
        self.frame_count += 1;
        let timestamp_ms = match (&mut self.clock, self.config.kind) {
            (_, SourceKind::File) => sequence * 1_000 / u64::from(self.config.fps.max(1)),
            (Some(clock), _) => clock.stamp(),
            (None, _) => return Err(anyhow!("live source {} has no clock", self.config.url)),
        };
        Ok(Some(Frame::new(
            self.source_id.clone(),
            sequence,
            timestamp_ms,
            self.config.width,
            self.config.height,
            data,
        )))
    }

    fn is_live(&self) -> bool {
        self.config.kind != SourceKind::File
    }

    fn is_healthy(&self) -> bool {
        self.child.is_some() && self.last_error.is_none()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            reconnects: self.reconnects,
            url: self.config.url.clone(),
        }
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.kill_child();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn live_clock_advances_from_anchor() {
        let t0 = Instant::now();
        let mut clock = LiveClock::new(1_000, t0);
        assert_eq!(clock.stamp_at(t0), 1_000);
        assert_eq!(clock.stamp_at(t0 + Duration::from_millis(250)), 1_250);
        assert_eq!(clock.stamp_at(t0 + Duration::from_secs(2)), 3_000);
    }

    #[test]
    fn live_clock_never_goes_backwards() {
        let t0 = Instant::now();
        let mut clock = LiveClock::new(50_000, t0 + Duration::from_millis(100));
        // An instant before the anchor saturates to the anchor.
        assert_eq!(clock.stamp_at(t0), 50_000);
        assert_eq!(clock.stamp_at(t0 + Duration::from_millis(600)), 50_500);
        assert_eq!(clock.stamp_at(t0 + Duration::from_millis(300)), 50_500);

        let mut last = 0;
        for _ in 0..1_000 {
            let ts = clock.stamp();
            assert!(ts >= last);
            last = ts;
        }
    }

    #[test]
    fn rtsp_sources_are_live_and_files_are_not() {
        let mut config = SourceConfig {
            kind: SourceKind::Rtsp,
            url: "rtsp://cam.local/stream".to_string(),
            fps: 10,
            width: 32,
            height: 24,
            frame_limit: None,
            realtime: true,
        };
        assert!(FfmpegSource::new(config.clone(), Arc::from("cam")).is_live());
        config.kind = SourceKind::File;
        let source = FfmpegSource::new(config, Arc::from("cam"));
        assert!(!source.is_live());
        assert!(!source.is_healthy());
    }
}
