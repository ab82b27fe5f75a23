//! Inference isolation supervisor.
//!
//! Runs the detector in a separate `vigil_infer_worker` process so a crash or
//! hang in the model cannot take the pipeline down.
//!
//! - A writer thread owns the worker's stdin; the supervisor hands it encoded
//!   batches over a channel and never blocks on the pipe itself.
//! - A reader thread owns stdout and forwards parsed response lines.
//! - Liveness is the exit status plus a progress timeout: no response line
//!   within `liveness_timeout` while a batch is in flight counts as a hang.
//!
//! On crash or hang the worker is terminated (SIGTERM, then kill), every
//! unanswered frame of the in-flight batch is reported as a detection gap and
//! the worker is restarted with bounded exponential backoff.
//!
//! `collect` waits in short slices so an abort flag set by the owner ends the
//! wait promptly instead of after the full liveness timeout.

pub mod protocol;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::detect::{Detection, FrameDetections};
use crate::frame::Frame;
use protocol::{encode_batch, encode_shutdown, parse_response, BatchStatus, WorkerResponse};

const TERMINATE_GRACE: Duration = Duration::from_millis(500);
const INITIAL_RESTART_BACKOFF: Duration = Duration::from_millis(200);
/// Longest single wait inside `collect` between abort checks.
const COLLECT_SLICE: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub worker_path: PathBuf,
    /// Extra worker arguments (backend selection, fault injection).
    pub worker_args: Vec<String>,
    pub source_id: String,
    pub liveness_timeout: Duration,
    pub startup_timeout: Duration,
    pub max_restart_backoff: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Ready,
    Busy,
    Crashed,
    Restarting,
}

/// Ticket for a submitted batch. Redeemed with `collect`.
#[derive(Debug)]
pub struct BatchHandle {
    batch_id: u64,
    generation: u64,
    frames: Vec<(u64, u64)>,
}

impl BatchHandle {
    pub fn batch_id(&self) -> u64 {
        self.batch_id
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Per-frame results of one batch, in submission order. Frames the worker
/// never answered are gap entries.
#[derive(Debug)]
pub struct BatchOutcome {
    pub status: BatchStatus,
    pub frames: Vec<FrameDetections>,
    pub error: Option<String>,
}

impl BatchOutcome {
    pub fn gap_count(&self) -> usize {
        self.frames.iter().filter(|f| f.gap).count()
    }

    fn all_gaps(frames: &[(u64, u64)], error: String) -> Self {
        Self {
            status: BatchStatus::Failed,
            frames: frames
                .iter()
                .map(|&(seq, ts)| FrameDetections::gap(seq, ts))
                .collect(),
            error: Some(error),
        }
    }
}

enum WorkerEvent {
    Response(WorkerResponse),
    Exited,
}

struct WorkerProcess {
    child: Child,
    generation: u64,
    requests: Option<Sender<Vec<u8>>>,
    events: Receiver<(u64, WorkerEvent)>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl WorkerProcess {
    fn spawn(config: &SupervisorConfig, generation: u64) -> Result<Self> {
        let mut child = Command::new(&config.worker_path)
            .args(&config.worker_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("spawn worker {}", config.worker_path.display()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("worker stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("worker stdout unavailable"))?;

        let (req_tx, req_rx) = unbounded::<Vec<u8>>();
        let (ev_tx, ev_rx) = unbounded();

        let writer = thread::Builder::new()
            .name(format!("vigil-worker-w{}", generation))
            .spawn(move || writer_loop(stdin, req_rx))?;

        let reader_tx = ev_tx;
        let reader = thread::Builder::new()
            .name(format!("vigil-worker-r{}", generation))
            .spawn(move || {
                let reader = BufReader::new(stdout);
                for line in reader.lines() {
                    let Ok(line) = line else { break };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match parse_response(&line) {
                        Ok(resp) => {
                            if reader_tx.send((generation, WorkerEvent::Response(resp))).is_err() {
                                return;
                            }
                        }
                        Err(e) => log::warn!("worker (gen {}): {}", generation, e),
                    }
                }
                let _ = reader_tx.send((generation, WorkerEvent::Exited));
            })?;

        Ok(Self {
            child,
            generation,
            requests: Some(req_tx),
            events: ev_rx,
            writer: Some(writer),
            reader: Some(reader),
        })
    }

    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn send(&self, payload: Vec<u8>) -> Result<()> {
        self.requests
            .as_ref()
            .ok_or_else(|| anyhow!("worker request channel closed"))?
            .send(payload)
            .map_err(|_| anyhow!("worker writer thread gone"))
    }

    /// SIGTERM, short grace, then kill. Reaps the child and joins both threads.
    fn terminate(mut self) -> Option<std::process::ExitStatus> {
        self.requests = None;
        let status = match self.child.try_wait() {
            Ok(Some(status)) => Some(status),
            _ => {
                send_sigterm(&self.child);
                let deadline = Instant::now() + TERMINATE_GRACE;
                loop {
                    match self.child.try_wait() {
                        Ok(Some(status)) => break Some(status),
                        Ok(None) if Instant::now() < deadline => {
                            thread::sleep(Duration::from_millis(20))
                        }
                        _ => {
                            let _ = self.child.kill();
                            break self.child.wait().ok();
                        }
                    }
                }
            }
        };
        if let Some(handle) = self.writer.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
        status
    }
}

fn writer_loop(mut stdin: ChildStdin, requests: Receiver<Vec<u8>>) {
    for payload in requests.iter() {
        if let Err(e) = stdin.write_all(&payload).and_then(|_| stdin.flush()) {
            log::warn!("worker stdin write failed: {}", e);
            return;
        }
    }
    // Channel closed: dropping stdin signals EOF to the worker.
}

#[cfg(unix)]
fn send_sigterm(child: &Child) {
    let Ok(pid) = libc::pid_t::try_from(child.id()) else {
        return;
    };
    // SAFETY: plain kill(2) on a pid we spawned and have not yet reaped.
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) {}

/// Supervises one worker process for one source.
pub struct InferenceSupervisor {
    config: SupervisorConfig,
    state: WorkerState,
    worker: Option<WorkerProcess>,
    generation: u64,
    next_batch_id: u64,
    restart_count: u64,
    last_failure_ms: Option<u64>,
    backoff: Duration,
    next_restart_at: Option<Instant>,
    abort: Option<Arc<AtomicBool>>,
}

impl InferenceSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            state: WorkerState::Crashed,
            worker: None,
            generation: 0,
            next_batch_id: 1,
            restart_count: 0,
            last_failure_ms: None,
            backoff: INITIAL_RESTART_BACKOFF,
            next_restart_at: None,
            abort: None,
        }
    }

    /// Once `flag` is set, `collect` and `run_batch` give up on the batch and
    /// report its unanswered frames as gaps.
    pub fn set_abort_flag(&mut self, flag: Arc<AtomicBool>) {
        self.abort = Some(flag);
    }

    fn abort_requested(&self) -> bool {
        self.abort
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Spawn the first worker and wait for its `ready` line.
    pub fn start(&mut self) -> Result<()> {
        self.state = WorkerState::Starting;
        self.launch()
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn restart_count(&self) -> u64 {
        self.restart_count
    }

    pub fn last_failure_ms(&self) -> Option<u64> {
        self.last_failure_ms
    }

    pub fn worker_pid(&self) -> Option<u32> {
        self.worker.as_ref().map(WorkerProcess::pid)
    }

    fn launch(&mut self) -> Result<()> {
        self.generation += 1;
        let worker = WorkerProcess::spawn(&self.config, self.generation)?;
        let deadline = Instant::now() + self.config.startup_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match worker.events.recv_timeout(remaining) {
                Ok((_, WorkerEvent::Response(WorkerResponse::Ready { backend, pid }))) => {
                    log::info!(
                        "inference worker ready: pid={} backend={} generation={}",
                        pid,
                        backend,
                        self.generation
                    );
                    self.worker = Some(worker);
                    self.state = WorkerState::Ready;
                    self.backoff = INITIAL_RESTART_BACKOFF;
                    self.next_restart_at = None;
                    return Ok(());
                }
                Ok((_, WorkerEvent::Response(other))) => {
                    log::warn!("worker sent {:?} before ready; ignored", other);
                }
                Ok((_, WorkerEvent::Exited)) => {
                    let status = worker.terminate();
                    self.state = WorkerState::Crashed;
                    return Err(anyhow!("worker exited during start-up ({:?})", status));
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    worker.terminate();
                    self.state = WorkerState::Crashed;
                    return Err(anyhow!(
                        "worker not ready within {:?}",
                        self.config.startup_timeout
                    ));
                }
            }
        }
    }

    /// Make sure a ready worker exists, restarting (with backoff) if needed.
    fn ensure_ready(&mut self) -> Result<()> {
        if self.state == WorkerState::Ready && self.worker.is_some() {
            return Ok(());
        }
        if let Some(at) = self.next_restart_at {
            if Instant::now() < at {
                return Err(anyhow!("worker restart backing off"));
            }
        }
        self.state = WorkerState::Restarting;
        self.restart_count += 1;
        log::info!("restarting inference worker (restart #{})", self.restart_count);
        match self.launch() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.next_restart_at = Some(Instant::now() + self.backoff);
                self.backoff = (self.backoff * 2).min(self.config.max_restart_backoff);
                Err(e)
            }
        }
    }

    /// Send a batch to the worker.
    ///
    /// Fails only when no worker can be made ready; the caller then treats the
    /// batch as a detection gap.
    pub fn submit(&mut self, frames: &[Frame]) -> Result<BatchHandle> {
        self.ensure_ready()?;
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;
        let payload = encode_batch(batch_id, &self.config.source_id, frames)?;
        let worker = self
            .worker
            .as_ref()
            .ok_or_else(|| anyhow!("no worker process"))?;
        worker.send(payload)?;
        self.state = WorkerState::Busy;
        Ok(BatchHandle {
            batch_id,
            generation: worker.generation,
            frames: frames
                .iter()
                .map(|f| (f.sequence(), f.timestamp_ms()))
                .collect(),
        })
    }

    /// Wait for the results of a submitted batch. Never fails: a crash or hang
    /// turns the unanswered frames into gaps and schedules a restart.
    pub fn collect(&mut self, handle: BatchHandle) -> BatchOutcome {
        let mut answered: HashMap<u64, Vec<Detection>> = HashMap::new();
        let liveness = self.config.liveness_timeout;
        let mut last_progress = Instant::now();
        let mut aborted = false;
        let failure = loop {
            let Some(worker) = self.worker.as_ref().filter(|w| w.generation == handle.generation)
            else {
                break "worker replaced before batch completed".to_string();
            };
            let event = worker.events.recv_timeout(COLLECT_SLICE.min(liveness));
            if event.is_ok() {
                last_progress = Instant::now();
            }
            match event {
                Ok((gen, _)) if gen != handle.generation => continue,
                Ok((_, WorkerEvent::Response(WorkerResponse::Frame {
                    batch_id,
                    sequence,
                    detections,
                }))) => {
                    if batch_id == handle.batch_id {
                        answered.insert(sequence, detections);
                    }
                }
                Ok((_, WorkerEvent::Response(WorkerResponse::BatchDone {
                    batch_id,
                    status,
                    error,
                }))) => {
                    if batch_id != handle.batch_id {
                        continue;
                    }
                    self.state = WorkerState::Ready;
                    if let Some(err) = &error {
                        log::warn!("worker batch {} finished {:?}: {}", batch_id, status, err);
                    }
                    return assemble(&handle, answered, status, error);
                }
                Ok((_, WorkerEvent::Response(WorkerResponse::Ready { .. }))) => {
                    log::warn!("unexpected ready from worker mid-batch");
                }
                Ok((_, WorkerEvent::Exited)) | Err(RecvTimeoutError::Disconnected) => {
                    break "worker exited mid-batch".to_string();
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.abort_requested() {
                        aborted = true;
                        break "batch abandoned on abort".to_string();
                    }
                    if last_progress.elapsed() >= liveness {
                        break format!("worker made no progress for {:?}", liveness);
                    }
                }
            }
        };

        if aborted {
            self.abandon_worker();
        } else {
            self.mark_crashed(&failure);
        }
        let status = if answered.is_empty() {
            BatchStatus::Failed
        } else {
            BatchStatus::Partial
        };
        let outcome = assemble(&handle, answered, status, Some(failure));
        log::warn!(
            "batch {}: {} of {} frames recorded as detection gap",
            handle.batch_id,
            outcome.gap_count(),
            handle.len()
        );
        outcome
    }

    /// Submit and collect in one call; an unavailable worker yields all gaps.
    pub fn run_batch(&mut self, frames: &[Frame]) -> BatchOutcome {
        let refs: Vec<(u64, u64)> = frames
            .iter()
            .map(|f| (f.sequence(), f.timestamp_ms()))
            .collect();
        if self.abort_requested() {
            return BatchOutcome::all_gaps(&refs, "inference aborted".to_string());
        }
        match self.submit(frames) {
            Ok(handle) => self.collect(handle),
            Err(e) => {
                log::warn!("inference unavailable for {} frames: {:#}", frames.len(), e);
                BatchOutcome::all_gaps(&refs, e.to_string())
            }
        }
    }

    fn mark_crashed(&mut self, reason: &str) {
        self.last_failure_ms = crate::now_ms().ok();
        self.state = WorkerState::Crashed;
        if let Some(worker) = self.worker.take() {
            let pid = worker.pid();
            let status = worker.terminate();
            log::error!(
                "inference worker pid={} failed: {} (exit {:?})",
                pid,
                reason,
                status
            );
        }
    }

    /// Drop a busy worker without counting it as a failure.
    fn abandon_worker(&mut self) {
        self.state = WorkerState::Crashed;
        if let Some(worker) = self.worker.take() {
            let pid = worker.pid();
            let status = worker.terminate();
            log::info!("inference worker pid={} abandoned mid-batch ({:?})", pid, status);
        }
    }

    /// Ask the worker to exit, then terminate it if it lingers.
    pub fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            if let Ok(payload) = encode_shutdown() {
                let _ = worker.send(payload);
            }
            let mut worker = worker;
            worker.requests = None;
            let deadline = Instant::now() + TERMINATE_GRACE;
            while Instant::now() < deadline {
                if let Ok(Some(_)) = worker.child.try_wait() {
                    break;
                }
                thread::sleep(Duration::from_millis(20));
            }
            let status = worker.terminate();
            log::info!("inference worker stopped ({:?})", status);
        }
        self.state = WorkerState::Crashed;
    }
}

impl Drop for InferenceSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn assemble(
    handle: &BatchHandle,
    mut answered: HashMap<u64, Vec<Detection>>,
    status: BatchStatus,
    error: Option<String>,
) -> BatchOutcome {
    let frames = handle
        .frames
        .iter()
        .map(|&(seq, ts)| match answered.remove(&seq) {
            Some(detections) => FrameDetections::new(seq, ts, detections),
            None => FrameDetections::gap(seq, ts),
        })
        .collect();
    BatchOutcome {
        status,
        frames,
        error,
    }
}
