//! Clip writers.
//!
//! Two containers:
//! - raw `.vclip`: magic line, JSON header line (written with the first frame),
//!   then per frame `timestamp_ms: u64 LE`, `sequence: u64 LE`, `len: u32 LE`
//!   and the BGR24 pixels. Default; needs no external tools.
//! - `ffmpeg`: frames are spooled as raw BGR24 and transcoded when the clip
//!   finishes, so the passthrough rate can be measured from the clip's own
//!   timestamps.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::frame::Frame;
use crate::SegmentFile;

pub const VCLIP_MAGIC: &[u8] = b"VCLIP1\n";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriterKind {
    Raw,
    Ffmpeg,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "fps")]
pub enum FrameRatePolicy {
    /// Keep the source cadence.
    Passthrough,
    /// Resample to a fixed rate.
    Target(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "value")]
pub enum EncodingPolicy {
    /// x264 CRF value (0-51).
    ConstantQuality(u8),
    /// Average bitrate in kbit/s.
    AverageBitrate(u32),
}

/// Output settings, fixed for the whole run and applied at each clip open.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputMode {
    pub writer: WriterKind,
    pub frame_rate: FrameRatePolicy,
    pub encoding: EncodingPolicy,
    /// Source rate, used when a clip is too short to measure its own.
    pub nominal_fps: u32,
}

impl Default for OutputMode {
    fn default() -> Self {
        Self {
            writer: WriterKind::Raw,
            frame_rate: FrameRatePolicy::Passthrough,
            encoding: EncodingPolicy::ConstantQuality(23),
            nominal_fps: 10,
        }
    }
}

impl OutputMode {
    pub fn validate(&self) -> Result<()> {
        if self.nominal_fps == 0 {
            bail!("output nominal_fps must be greater than zero");
        }
        if let FrameRatePolicy::Target(0) = self.frame_rate {
            bail!("output target fps must be greater than zero");
        }
        match self.encoding {
            EncodingPolicy::ConstantQuality(q) if q > 51 => {
                bail!("constant quality must be within 0..=51, got {}", q)
            }
            EncodingPolicy::AverageBitrate(0) => bail!("average bitrate must be greater than zero"),
            _ => Ok(()),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self.writer {
            WriterKind::Raw => "vclip",
            WriterKind::Ffmpeg => "mp4",
        }
    }
}

pub trait ClipWriter: Send {
    fn path(&self) -> &Path;

    fn write_frame(&mut self, frame: &Frame) -> Result<()>;

    /// Flush and close. The returned part describes what is on disk.
    fn finish(self: Box<Self>) -> Result<SegmentFile>;
}

/// Opens writers for new clips and clip parts.
pub trait ClipWriterFactory: Send {
    fn extension(&self) -> &'static str;

    fn open(&mut self, path: &Path) -> Result<Box<dyn ClipWriter>>;
}

/// Factory for the configured output mode.
pub struct OutputWriterFactory {
    mode: OutputMode,
}

impl OutputWriterFactory {
    pub fn new(mode: OutputMode) -> Self {
        Self { mode }
    }
}

impl ClipWriterFactory for OutputWriterFactory {
    fn extension(&self) -> &'static str {
        self.mode.extension()
    }

    fn open(&mut self, path: &Path) -> Result<Box<dyn ClipWriter>> {
        Ok(match self.mode.writer {
            WriterKind::Raw => Box::new(RawClipWriter::create(path, self.mode)?),
            WriterKind::Ffmpeg => Box::new(FfmpegClipWriter::create(path, self.mode)?),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClipHeader {
    pub source_id: String,
    pub width: u32,
    pub height: u32,
    pub output: OutputMode,
}

/// Writes `Write` output while hashing and counting it.
struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    bytes: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    fn put(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write_all(data)?;
        self.hasher.update(data);
        self.bytes += data.len() as u64;
        Ok(())
    }
}

pub struct RawClipWriter {
    path: PathBuf,
    out: HashingWriter<BufWriter<File>>,
    mode: OutputMode,
    geometry: Option<(u32, u32)>,
    frames: u64,
}

impl RawClipWriter {
    pub fn create(path: &Path, mode: OutputMode) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("failed to create clip {}", path.display()))?;
        let mut out = HashingWriter::new(BufWriter::new(file));
        out.put(VCLIP_MAGIC)?;
        Ok(Self {
            path: path.to_path_buf(),
            out,
            mode,
            geometry: None,
            frames: 0,
        })
    }
}

impl ClipWriter for RawClipWriter {
    fn path(&self) -> &Path {
        &self.path
    }

    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        match self.geometry {
            None => {
                let header = ClipHeader {
                    source_id: frame.source_id().to_string(),
                    width: frame.width(),
                    height: frame.height(),
                    output: self.mode,
                };
                let mut line = serde_json::to_vec(&header)?;
                line.push(b'\n');
                self.out.put(&line)?;
                self.geometry = Some((frame.width(), frame.height()));
            }
            Some(geometry) if geometry != (frame.width(), frame.height()) => {
                bail!(
                    "frame {} size {}x{} does not match clip {}x{}",
                    frame.sequence(),
                    frame.width(),
                    frame.height(),
                    geometry.0,
                    geometry.1
                );
            }
            Some(_) => {}
        }
        let len = u32::try_from(frame.pixels().len())
            .map_err(|_| anyhow!("frame {} too large for clip", frame.sequence()))?;
        self.out.put(&frame.timestamp_ms().to_le_bytes())?;
        self.out.put(&frame.sequence().to_le_bytes())?;
        self.out.put(&len.to_le_bytes())?;
        self.out.put(frame.pixels())?;
        self.frames += 1;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<SegmentFile> {
        let RawClipWriter {
            path, out, frames, ..
        } = *self;
        let HashingWriter {
            inner,
            hasher,
            bytes,
        } = out;
        let file = inner
            .into_inner()
            .map_err(|e| anyhow!("failed to flush clip {}: {}", path.display(), e.error()))?;
        file.sync_all()?;
        Ok(SegmentFile {
            path,
            frames,
            bytes,
            sha256: hex::encode(hasher.finalize()),
        })
    }
}

/// Frame entry of a raw clip.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClipFrame {
    pub sequence: u64,
    pub timestamp_ms: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClipIndex {
    pub header: Option<ClipHeader>,
    pub frames: Vec<ClipFrame>,
}

/// Read the frame index of a raw clip. A clip cut short mid-frame yields the
/// frames that were complete.
pub fn read_clip_index(path: &Path) -> Result<ClipIndex> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("failed to open clip {}", path.display()))?,
    );
    let mut magic = [0u8; 7];
    reader.read_exact(&mut magic)?;
    if magic != VCLIP_MAGIC {
        bail!("{} is not a vclip file", path.display());
    }

    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match reader.read_exact(&mut byte) {
            Ok(()) if byte[0] == b'\n' => break,
            Ok(()) => line.push(byte[0]),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof && line.is_empty() => {
                return Ok(ClipIndex {
                    header: None,
                    frames: Vec::new(),
                });
            }
            Err(e) => return Err(e.into()),
        }
    }
    let header: ClipHeader = serde_json::from_slice(&line)?;

    let mut frames = Vec::new();
    let mut prefix = [0u8; 20];
    loop {
        match reader.read_exact(&mut prefix) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let mut ts = [0u8; 8];
        let mut seq = [0u8; 8];
        let mut len = [0u8; 4];
        ts.copy_from_slice(&prefix[0..8]);
        seq.copy_from_slice(&prefix[8..16]);
        len.copy_from_slice(&prefix[16..20]);
        let len = u64::from(u32::from_le_bytes(len));
        let skipped = std::io::copy(&mut (&mut reader).take(len), &mut std::io::sink())?;
        if skipped != len {
            break;
        }
        frames.push(ClipFrame {
            sequence: u64::from_le_bytes(seq),
            timestamp_ms: u64::from_le_bytes(ts),
        });
    }
    Ok(ClipIndex {
        header: Some(header),
        frames,
    })
}

/// Hex SHA-256 of a file on disk.
pub fn sha256_file(path: &Path) -> Result<(u64, String)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let bytes = std::io::copy(&mut file, &mut hasher)?;
    Ok((bytes, hex::encode(hasher.finalize())))
}

pub struct FfmpegClipWriter {
    path: PathBuf,
    spool_path: PathBuf,
    spool: BufWriter<File>,
    mode: OutputMode,
    geometry: Option<(u32, u32)>,
    first_ms: Option<u64>,
    last_ms: u64,
    frames: u64,
}

impl FfmpegClipWriter {
    pub fn create(path: &Path, mode: OutputMode) -> Result<Self> {
        let mut spool_path = path.as_os_str().to_owned();
        spool_path.push(".bgr24");
        let spool_path = PathBuf::from(spool_path);
        let spool = File::create(&spool_path)
            .with_context(|| format!("failed to create spool {}", spool_path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            spool_path,
            spool: BufWriter::new(spool),
            mode,
            geometry: None,
            first_ms: None,
            last_ms: 0,
            frames: 0,
        })
    }

    /// Input rate for the encoder: measured from timestamps for passthrough.
    fn input_fps(&self) -> f64 {
        let nominal = f64::from(self.mode.nominal_fps.max(1));
        match self.first_ms {
            Some(first) if self.frames > 1 && self.last_ms > first => {
                (self.frames - 1) as f64 * 1_000.0 / (self.last_ms - first) as f64
            }
            _ => nominal,
        }
    }

    fn encode_command(&self, width: u32, height: u32) -> Command {
        let mut cmd = Command::new("ffmpeg");
        let size = format!("{}x{}", width, height);
        let input_fps = format!("{:.3}", self.input_fps());
        cmd.args(["-hide_banner", "-loglevel", "error", "-nostdin", "-y"]);
        cmd.args([
            "-f",
            "rawvideo",
            "-pix_fmt",
            "bgr24",
            "-s",
            size.as_str(),
            "-r",
            input_fps.as_str(),
        ]);
        cmd.arg("-i").arg(&self.spool_path);
        if let FrameRatePolicy::Target(fps) = self.mode.frame_rate {
            cmd.args(["-r", fps.to_string().as_str()]);
        }
        cmd.args(["-c:v", "libx264", "-pix_fmt", "yuv420p"]);
        match self.mode.encoding {
            EncodingPolicy::ConstantQuality(q) => {
                cmd.args(["-crf", q.to_string().as_str()]);
            }
            EncodingPolicy::AverageBitrate(kbps) => {
                cmd.args(["-b:v", format!("{}k", kbps).as_str()]);
            }
        }
        cmd.arg(&self.path);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());
        cmd
    }
}

impl ClipWriter for FfmpegClipWriter {
    fn path(&self) -> &Path {
        &self.path
    }

    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let geometry = (frame.width(), frame.height());
        if *self.geometry.get_or_insert(geometry) != geometry {
            bail!("frame {} size changed mid-clip", frame.sequence());
        }
        self.spool.write_all(frame.pixels())?;
        self.first_ms.get_or_insert(frame.timestamp_ms());
        self.last_ms = frame.timestamp_ms();
        self.frames += 1;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<SegmentFile> {
        let mut writer = *self;
        writer.spool.flush()?;

        let Some((width, height)) = writer.geometry else {
            let _ = fs::remove_file(&writer.spool_path);
            return Ok(SegmentFile {
                path: writer.path,
                frames: 0,
                bytes: 0,
                sha256: hex::encode(Sha256::digest(b"")),
            });
        };

        let status = writer
            .encode_command(width, height)
            .status()
            .context("failed to run ffmpeg encoder");
        match status {
            Ok(status) if status.success() => {
                let _ = fs::remove_file(&writer.spool_path);
                let (bytes, sha256) = sha256_file(&writer.path)?;
                Ok(SegmentFile {
                    path: writer.path,
                    frames: writer.frames,
                    bytes,
                    sha256,
                })
            }
            other => {
                // Keep the raw spool so the footage is not lost.
                match other {
                    Ok(status) => log::warn!(
                        "ffmpeg encode of {} failed ({}); keeping raw spool",
                        writer.path.display(),
                        status
                    ),
                    Err(e) => log::warn!("{:#}; keeping raw spool", e),
                }
                let (bytes, sha256) = sha256_file(&writer.spool_path)?;
                Ok(SegmentFile {
                    path: writer.spool_path,
                    frames: writer.frames,
                    bytes,
                    sha256,
                })
            }
        }
    }
}
