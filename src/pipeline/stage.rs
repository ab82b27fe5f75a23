//! Uniform stage interface and the generic stage runner.
//!
//! A stage owns its output queue(s). The runner owns the stage and its input
//! queue, drives `consume`/`idle` on a dedicated thread, and calls `stop`
//! exactly once on exit, after which the input queue is closed so a blocked
//! upstream producer is released.

use anyhow::{anyhow, Result};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::queue::{PipelineQueue, Pop};

/// How long the runner waits for input before calling `idle`.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Whether the runner should keep going after a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// Upstream closed and everything queued was consumed.
    InputClosed,
    /// The stage asked to stop, or a graceful stop was requested.
    Requested,
    /// Forced stop after the drain window.
    Aborted,
    StartFailed,
}

pub trait Stage: Send + 'static {
    type Input: Send + 'static;

    fn name(&self) -> &'static str;

    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Process one input item.
    fn consume(&mut self, input: Self::Input) -> Result<Flow>;

    /// Called when no input arrived within the poll interval. Source stages
    /// (input `Infallible`) do all their work here.
    fn idle(&mut self) -> Result<Flow> {
        Ok(Flow::Continue)
    }

    /// Flush and close outputs. Called exactly once.
    fn stop(&mut self, reason: StopReason) -> Result<()>;
}

/// Flags shared between a running stage and its owner.
#[derive(Clone, Debug, Default)]
pub struct StageControl {
    stop: Arc<AtomicBool>,
    abort: Arc<AtomicBool>,
}

impl StageControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Graceful stop: finish the current item and exit.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Forced stop: exit without draining the input.
    pub fn abort(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// The abort flag itself, for code that blocks inside a stage call.
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }
}

#[derive(Clone, Debug)]
pub struct StageReport {
    pub name: &'static str,
    pub consumed: u64,
    pub errors: u64,
    pub reason: StopReason,
}

pub struct StageHandle {
    name: &'static str,
    control: StageControl,
    thread: Option<JoinHandle<StageReport>>,
}

impl StageHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn control(&self) -> &StageControl {
        &self.control
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Wait until the stage exits or `deadline` passes. Returns true if it exited.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        while !self.is_finished() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        true
    }

    pub fn join(&mut self) -> Result<StageReport> {
        let thread = self
            .thread
            .take()
            .ok_or_else(|| anyhow!("stage {} already joined", self.name))?;
        thread
            .join()
            .map_err(|_| anyhow!("stage {} panicked", self.name))
    }
}

struct RunState {
    consumed: u64,
    errors: u64,
}

impl RunState {
    fn record(&mut self, name: &'static str, result: Result<Flow>) -> Flow {
        match result {
            Ok(flow) => flow,
            Err(e) => {
                self.errors += 1;
                log::error!("stage {}: {:#}", name, e);
                Flow::Continue
            }
        }
    }
}

/// Run a stage that consumes from `input`.
pub fn spawn_stage<S: Stage>(
    stage: S,
    input: PipelineQueue<S::Input>,
    poll: Duration,
) -> Result<StageHandle> {
    spawn_stage_with(stage, input, poll, StageControl::new())
}

/// Like `spawn_stage`, with a control created before the stage was built.
pub fn spawn_stage_with<S: Stage>(
    mut stage: S,
    input: PipelineQueue<S::Input>,
    poll: Duration,
    control: StageControl,
) -> Result<StageHandle> {
    let name = stage.name();
    let ctl = control.clone();
    let thread = thread::Builder::new()
        .name(format!("vigil-{}", name))
        .spawn(move || {
            let mut run = RunState {
                consumed: 0,
                errors: 0,
            };
            let reason = match stage.start() {
                Err(e) => {
                    log::error!("stage {} failed to start: {:#}", name, e);
                    StopReason::StartFailed
                }
                Ok(()) => {
                    log::info!("stage {} started", name);
                    loop {
                        if ctl.aborted() {
                            break StopReason::Aborted;
                        }
                        match input.pop_timeout(poll) {
                            Pop::Item(item) => {
                                run.consumed += 1;
                                let result = stage.consume(item);
                                if run.record(name, result) == Flow::Stop {
                                    break StopReason::Requested;
                                }
                            }
                            Pop::Empty => {
                                let result = stage.idle();
                                if run.record(name, result) == Flow::Stop {
                                    break StopReason::Requested;
                                }
                            }
                            Pop::Closed => break StopReason::InputClosed,
                        }
                    }
                }
            };
            finish(&mut stage, name, reason, &run);
            input.close();
            StageReport {
                name,
                consumed: run.consumed,
                errors: run.errors,
                reason,
            }
        })?;
    Ok(StageHandle {
        name,
        control,
        thread: Some(thread),
    })
}

/// Run a source stage. It has no input queue; `idle` is called in a loop
/// until it returns `Flow::Stop` or a stop is requested.
pub fn spawn_source<S: Stage<Input = Infallible>>(mut stage: S) -> Result<StageHandle> {
    let name = stage.name();
    let control = StageControl::new();
    let ctl = control.clone();
    let thread = thread::Builder::new()
        .name(format!("vigil-{}", name))
        .spawn(move || {
            let mut run = RunState {
                consumed: 0,
                errors: 0,
            };
            let reason = match stage.start() {
                Err(e) => {
                    log::error!("stage {} failed to start: {:#}", name, e);
                    StopReason::StartFailed
                }
                Ok(()) => {
                    log::info!("stage {} started", name);
                    loop {
                        if ctl.aborted() {
                            break StopReason::Aborted;
                        }
                        if ctl.stop_requested() {
                            break StopReason::Requested;
                        }
                        let result = stage.idle();
                        if run.record(name, result) == Flow::Stop {
                            break StopReason::Requested;
                        }
                    }
                }
            };
            finish(&mut stage, name, reason, &run);
            StageReport {
                name,
                consumed: run.consumed,
                errors: run.errors,
                reason,
            }
        })?;
    Ok(StageHandle {
        name,
        control,
        thread: Some(thread),
    })
}

fn finish<S: Stage>(stage: &mut S, name: &'static str, reason: StopReason, run: &RunState) {
    if let Err(e) = stage.stop(reason) {
        log::error!("stage {} failed to stop cleanly: {:#}", name, e);
    }
    log::info!(
        "stage {} stopped ({:?}): consumed={} errors={}",
        name,
        reason,
        run.consumed,
        run.errors
    );
}
