//! Wire protocol between `InferenceSupervisor` and `vigil_infer_worker`.
//!
//! Requests (supervisor -> worker stdin): one JSON line, followed for a
//! `batch` by the raw pixel bytes of each frame, back to back, in header order.
//!
//! Responses (worker stdout -> supervisor): one JSON object per line.
//! - `ready` once after start-up
//! - `frame` per processed frame, in batch order
//! - `batch_done` with a terminal status (`ok`, `partial`, `failed`)
//!
//! The worker writes nothing else to stdout. Logs go to stderr.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};

use crate::detect::Detection;
use crate::frame::Frame;

/// Upper bound on one frame payload (8K BGR24).
pub const MAX_FRAME_BYTES: usize = 7680 * 4320 * 3;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameHeader {
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub width: u32,
    pub height: u32,
    pub len: usize,
}

impl FrameHeader {
    pub fn of(frame: &Frame) -> Self {
        Self {
            sequence: frame.sequence(),
            timestamp_ms: frame.timestamp_ms(),
            width: frame.width(),
            height: frame.height(),
            len: frame.byte_len(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    Batch {
        batch_id: u64,
        source_id: String,
        frames: Vec<FrameHeader>,
    },
    Shutdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Ok,
    Partial,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    Ready {
        backend: String,
        pid: u32,
    },
    Frame {
        batch_id: u64,
        sequence: u64,
        detections: Vec<Detection>,
    },
    BatchDone {
        batch_id: u64,
        status: BatchStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Serialize a batch request: header line plus concatenated pixel bytes.
pub fn encode_batch(batch_id: u64, source_id: &str, frames: &[Frame]) -> Result<Vec<u8>> {
    let request = WorkerRequest::Batch {
        batch_id,
        source_id: source_id.to_string(),
        frames: frames.iter().map(FrameHeader::of).collect(),
    };
    let payload_len: usize = frames.iter().map(Frame::byte_len).sum();
    let mut buf = serde_json::to_vec(&request)?;
    buf.reserve(payload_len + 1);
    buf.push(b'\n');
    for frame in frames {
        buf.extend_from_slice(frame.pixels());
    }
    Ok(buf)
}

pub fn encode_shutdown() -> Result<Vec<u8>> {
    let mut buf = serde_json::to_vec(&WorkerRequest::Shutdown)?;
    buf.push(b'\n');
    Ok(buf)
}

/// Read the next request and its frame payloads. `Ok(None)` on clean EOF.
pub fn read_request<R: BufRead>(reader: &mut R) -> Result<Option<(WorkerRequest, Vec<Frame>)>> {
    let mut line = String::new();
    if reader.read_line(&mut line).context("read request header")? == 0 {
        return Ok(None);
    }
    let request: WorkerRequest =
        serde_json::from_str(line.trim_end()).context("invalid request header")?;

    let frames = match &request {
        WorkerRequest::Batch {
            source_id, frames, ..
        } => {
            let source: std::sync::Arc<str> = std::sync::Arc::from(source_id.as_str());
            let mut out = Vec::with_capacity(frames.len());
            for header in frames {
                if header.len > MAX_FRAME_BYTES {
                    return Err(anyhow!(
                        "frame {} payload {} exceeds limit",
                        header.sequence,
                        header.len
                    ));
                }
                let mut data = vec![0u8; header.len];
                reader
                    .read_exact(&mut data)
                    .with_context(|| format!("read payload of frame {}", header.sequence))?;
                out.push(Frame::new(
                    source.clone(),
                    header.sequence,
                    header.timestamp_ms,
                    header.width,
                    header.height,
                    data,
                ));
            }
            out
        }
        WorkerRequest::Shutdown => Vec::new(),
    };
    Ok(Some((request, frames)))
}

/// Write one response line and flush.
pub fn write_response<W: Write>(writer: &mut W, response: &WorkerResponse) -> Result<()> {
    serde_json::to_writer(&mut *writer, response)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

pub fn parse_response(line: &str) -> Result<WorkerResponse> {
    serde_json::from_str(line.trim_end())
        .map_err(|e| anyhow!("invalid worker response '{}': {}", line.trim_end(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Arc;

    #[test]
    fn batch_request_carries_pixels_in_order() {
        let source: Arc<str> = Arc::from("cam");
        let frames = vec![
            Frame::new(source.clone(), 1, 100, 2, 1, vec![1; 6]),
            Frame::new(source, 2, 200, 2, 1, vec![2; 6]),
        ];
        let bytes = encode_batch(7, "cam", &frames).unwrap();

        let mut reader = Cursor::new(bytes);
        let (request, decoded) = read_request(&mut reader).unwrap().unwrap();
        match request {
            WorkerRequest::Batch { batch_id, frames, .. } => {
                assert_eq!(batch_id, 7);
                assert_eq!(frames.len(), 2);
            }
            other => panic!("unexpected request {:?}", other),
        }
        assert_eq!(decoded[0].pixels(), &[1; 6]);
        assert_eq!(decoded[1].pixels(), &[2; 6]);
        assert_eq!(decoded[1].timestamp_ms(), 200);
        assert!(read_request(&mut reader).unwrap().is_none());
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let source: Arc<str> = Arc::from("cam");
        let frames = vec![Frame::new(source, 1, 100, 2, 1, vec![1; 6])];
        let mut bytes = encode_batch(1, "cam", &frames).unwrap();
        bytes.truncate(bytes.len() - 2);
        assert!(read_request(&mut Cursor::new(bytes)).is_err());
    }

    #[test]
    fn responses_use_tagged_json_lines() {
        let mut out = Vec::new();
        write_response(
            &mut out,
            &WorkerResponse::BatchDone {
                batch_id: 3,
                status: BatchStatus::Partial,
                error: None,
            },
        )
        .unwrap();
        let line = String::from_utf8(out).unwrap();
        assert_eq!(line, "{\"type\":\"batch_done\",\"batch_id\":3,\"status\":\"partial\"}\n");
        assert!(matches!(
            parse_response(&line).unwrap(),
            WorkerResponse::BatchDone { batch_id: 3, .. }
        ));
    }
}
