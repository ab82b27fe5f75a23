//! Frame ownership layer.
//!
//! - `Frame`: one decoded image. Moved between stages, never cloned or mutated.
//! - `FrameBuffer`: bounded ring buffer backing the pre-trigger window.
//!
//! `Frame` deliberately has no `Clone`, no `Serialize` and no mutable accessor.
//! Once a stage pushes a frame to the next queue it no longer holds any alias to it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Build-time maximum pre-trigger duration in seconds.
pub const MAX_PRE_TRIGGER_SECS: u64 = 30;

/// Build-time maximum frame buffer capacity.
/// At 30 fps, 30 seconds = 900 frames.
pub const MAX_BUFFER_FRAMES: usize = 900;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// A decoded frame. Pixel data is BGR24, row-major.
///
/// Frames cannot be duplicated:
///
/// ```compile_fail
/// use std::sync::Arc;
/// use vigil::Frame;
///
/// let frame = Frame::new(Arc::from("cam"), 0, 0, 1, 1, vec![0; 3]);
/// let copy = frame.clone();
/// ```
///
/// nor serialized:
///
/// ```compile_fail
/// use vigil::Frame;
///
/// fn export<T: serde::Serialize>(_: &T) {}
/// fn leak(frame: &Frame) {
///     export(frame);
/// }
/// ```
///
/// and the pixel buffer is read-only:
///
/// ```compile_fail
/// use std::sync::Arc;
/// use vigil::Frame;
///
/// let mut frame = Frame::new(Arc::from("cam"), 0, 0, 1, 1, vec![0; 3]);
/// frame.data[0] = 255;
/// ```
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    sequence: u64,
    timestamp_ms: u64,
    source_id: Arc<str>,
    /// Monotonic capture instant, for latency accounting only.
    captured_at: Instant,
}

impl Frame {
    pub fn new(
        source_id: Arc<str>,
        sequence: u64,
        timestamp_ms: u64,
        width: u32,
        height: u32,
        data: Vec<u8>,
    ) -> Self {
        Self {
            data,
            width,
            height,
            sequence,
            timestamp_ms,
            source_id,
            captured_at: Instant::now(),
        }
    }

    /// Read-only pixel access for detectors and clip writers.
    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Strictly increasing per source.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Time since the frame was decoded.
    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("source_id", &self.source_id)
            .field("sequence", &self.sequence)
            .field("timestamp_ms", &self.timestamp_ms)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Anything the ring buffer can age out by frame timestamp.
pub trait Timestamped {
    fn timestamp_ms(&self) -> u64;
    fn byte_len(&self) -> usize;
}

impl Timestamped for Frame {
    fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    fn byte_len(&self) -> usize {
        self.data.len()
    }
}

// ----------------------------------------------------------------------------
// FrameBuffer: bounded ring buffer for the pre-trigger window
// ----------------------------------------------------------------------------

/// Keeps the most recent `max_age` of frames (by frame timestamp), capped at
/// `max_frames` entries. Evicts from the front.
pub struct FrameBuffer<T: Timestamped = Frame> {
    buffer: VecDeque<T>,
    max_frames: usize,
    max_age_ms: u64,
}

impl<T: Timestamped> FrameBuffer<T> {
    pub fn new(max_age: Duration, max_frames: usize) -> Self {
        let max_frames = max_frames.clamp(1, MAX_BUFFER_FRAMES);
        let max_age_ms = max_age
            .min(Duration::from_secs(MAX_PRE_TRIGGER_SECS))
            .as_millis() as u64;
        Self {
            buffer: VecDeque::with_capacity(max_frames),
            max_frames,
            max_age_ms,
        }
    }

    /// Push a frame, evicting anything older than the window or over capacity.
    pub fn push(&mut self, item: T) {
        let newest = item.timestamp_ms();
        while let Some(oldest) = self.buffer.front() {
            if newest.saturating_sub(oldest.timestamp_ms()) > self.max_age_ms {
                self.buffer.pop_front();
            } else {
                break;
            }
        }

        while self.buffer.len() >= self.max_frames {
            self.buffer.pop_front();
        }

        self.buffer.push_back(item);
    }

    pub fn latest(&self) -> Option<&T> {
        self.buffer.back()
    }

    pub fn oldest_timestamp_ms(&self) -> Option<u64> {
        self.buffer.front().map(|f| f.timestamp_ms())
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Take every buffered frame, oldest first. The buffer is empty afterwards.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.buffer.drain(..)
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Memory usage estimate.
    pub fn memory_bytes(&self) -> usize {
        self.buffer.iter().map(|f| f.byte_len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_frame(seq: u64, ts: u64) -> Frame {
        Frame::new(Arc::from("cam"), seq, ts, 4, 2, vec![seq as u8; 24])
    }

    #[test]
    fn frame_exposes_read_only_metadata() {
        let frame = make_frame(3, 300);
        assert_eq!(frame.sequence(), 3);
        assert_eq!(frame.timestamp_ms(), 300);
        assert_eq!(frame.source_id(), "cam");
        assert_eq!(frame.pixels().len(), 24);
        assert_eq!(frame.byte_len(), 24);
    }

    #[test]
    fn buffer_evicts_by_frame_time() {
        let mut buf = FrameBuffer::new(Duration::from_secs(2), 100);
        for i in 0..50u64 {
            buf.push(make_frame(i, i * 100));
        }
        // newest = 4900ms, window = 2000ms => oldest kept is 2900ms
        assert_eq!(buf.oldest_timestamp_ms(), Some(2_900));
        assert_eq!(buf.latest().map(|f| f.sequence()), Some(49));
    }

    #[test]
    fn buffer_enforces_capacity() {
        let mut buf = FrameBuffer::new(Duration::from_secs(30), 5);
        for i in 0..20u64 {
            buf.push(make_frame(i, i));
        }
        assert_eq!(buf.len(), 5);
        let drained: Vec<u64> = buf.drain().map(|f| f.sequence()).collect();
        assert_eq!(drained, vec![15, 16, 17, 18, 19]);
        assert!(buf.is_empty());
    }

    #[test]
    fn buffer_caps_window_at_build_limit() {
        let mut buf = FrameBuffer::new(Duration::from_secs(3_600), MAX_BUFFER_FRAMES * 10);
        buf.push(make_frame(0, 0));
        buf.push(make_frame(1, (MAX_PRE_TRIGGER_SECS + 1) * 1_000));
        assert_eq!(buf.len(), 1);
    }
}
