//! The four pipeline stages.

use anyhow::Result;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::queue::{PipelineQueue, Pop};
use super::settings::{PipelineSettings, ReconnectPolicy};
use super::stage::{Flow, Stage, StopReason};
use super::{update_stats, AnnotatedFrame, RecorderInput, SharedStats, StageFault};
use crate::detect::{DetectorBackend, FrameDetections};
use crate::event::{CloseReason, EventStateMachine, RecorderCommand};
use crate::frame::Frame;
use crate::ingest::FrameSource;
use crate::recorder::RecordingCoordinator;
use crate::rules::RuleEngine;
use crate::supervisor::InferenceSupervisor;

/// Longest single sleep while waiting to reconnect, so stop requests are seen.
const RECONNECT_SLICE: Duration = Duration::from_millis(50);

// -------------------- Ingest --------------------

pub struct IngestStage {
    source: Box<dyn FrameSource>,
    policy: ReconnectPolicy,
    output: PipelineQueue<Frame>,
    faults: PipelineQueue<StageFault>,
    stats: SharedStats,
    connected: bool,
    failures: u32,
    backoff: Duration,
    retry_at: Option<Instant>,
}

impl IngestStage {
    pub fn new(
        source: Box<dyn FrameSource>,
        policy: ReconnectPolicy,
        output: PipelineQueue<Frame>,
        faults: PipelineQueue<StageFault>,
        stats: SharedStats,
    ) -> Self {
        Self {
            source,
            backoff: policy.initial_backoff,
            policy,
            output,
            faults,
            stats,
            connected: false,
            failures: 0,
            retry_at: None,
        }
    }

    fn record_failure(&mut self, what: &str, error: anyhow::Error) {
        self.connected = false;
        self.failures += 1;
        log::warn!(
            "source {} {} (failure {}): {:#}; retrying in {:?}",
            self.source.describe(),
            what,
            self.failures,
            error,
            self.backoff
        );
        if self.failures == self.policy.fault_after {
            let fault = StageFault {
                stage: "ingest",
                detail: format!("source unavailable after {} attempts: {:#}", self.failures, error),
            };
            if self.faults.push(fault).is_err() {
                log::debug!("fault queue closed; ingest fault not delivered");
            }
        }
        self.retry_at = Some(Instant::now() + self.backoff);
        self.backoff = (self.backoff * 2).min(self.policy.max_backoff);
    }

    fn try_connect(&mut self) {
        match self.source.connect() {
            Ok(()) => {
                self.connected = true;
                self.retry_at = None;
            }
            Err(e) => self.record_failure("connect failed", e),
        }
    }
}

impl Stage for IngestStage {
    type Input = Infallible;

    fn name(&self) -> &'static str {
        "ingest"
    }

    fn start(&mut self) -> Result<()> {
        self.try_connect();
        Ok(())
    }

    fn consume(&mut self, input: Infallible) -> Result<Flow> {
        match input {}
    }

    fn idle(&mut self) -> Result<Flow> {
        if let Some(at) = self.retry_at {
            let now = Instant::now();
            if now < at {
                std::thread::sleep((at - now).min(RECONNECT_SLICE));
                return Ok(Flow::Continue);
            }
            self.try_connect();
            return Ok(Flow::Continue);
        }
        if !self.connected {
            self.try_connect();
            return Ok(Flow::Continue);
        }

        match self.source.next_frame() {
            Ok(Some(frame)) => {
                self.failures = 0;
                self.backoff = self.policy.initial_backoff;
                let source_stats = self.source.stats();
                update_stats(&self.stats, |s| {
                    s.frames_ingested = source_stats.frames_captured;
                    s.reconnects = source_stats.reconnects;
                });
                if self.output.push(frame).is_err() {
                    return Ok(Flow::Stop);
                }
                Ok(Flow::Continue)
            }
            Ok(None) => {
                log::info!("source {} reached end of stream", self.source.describe());
                Ok(Flow::Stop)
            }
            Err(e) if self.source.is_live() => {
                self.record_failure("read failed", e);
                Ok(Flow::Continue)
            }
            Err(e) => {
                log::error!("source {} failed: {:#}", self.source.describe(), e);
                Ok(Flow::Stop)
            }
        }
    }

    fn stop(&mut self, _reason: StopReason) -> Result<()> {
        self.output.close();
        Ok(())
    }
}

// -------------------- Inference --------------------

pub enum InferenceEngine {
    InProcess(Box<dyn DetectorBackend>),
    Isolated(Box<InferenceSupervisor>),
}

pub struct InferenceStage {
    engine: InferenceEngine,
    batch_size: usize,
    pending: Vec<Frame>,
    output: PipelineQueue<AnnotatedFrame>,
    stats: SharedStats,
}

impl InferenceStage {
    pub fn new(
        engine: InferenceEngine,
        batch_size: usize,
        output: PipelineQueue<AnnotatedFrame>,
        stats: SharedStats,
    ) -> Self {
        let batch_size = match engine {
            InferenceEngine::InProcess(_) => 1,
            InferenceEngine::Isolated(_) => batch_size.max(1),
        };
        Self {
            engine,
            batch_size,
            pending: Vec::with_capacity(batch_size),
            output,
            stats,
        }
    }

    fn infer(&mut self, frames: &[Frame]) -> Vec<FrameDetections> {
        match &mut self.engine {
            InferenceEngine::InProcess(backend) => frames
                .iter()
                .map(|frame| match backend.detect(frame) {
                    Ok(detections) => {
                        FrameDetections::new(frame.sequence(), frame.timestamp_ms(), detections)
                    }
                    Err(e) => {
                        log::warn!("detector failed on frame {}: {:#}", frame.sequence(), e);
                        FrameDetections::gap(frame.sequence(), frame.timestamp_ms())
                    }
                })
                .collect(),
            InferenceEngine::Isolated(supervisor) => {
                let outcome = supervisor.run_batch(frames);
                let restarts = supervisor.restart_count();
                update_stats(&self.stats, |s| s.worker_restarts = restarts);
                outcome.frames
            }
        }
    }

    /// Run the pending batch and forward it. Returns `Stop` if downstream closed.
    fn flush(&mut self) -> Flow {
        if self.pending.is_empty() {
            return Flow::Continue;
        }
        let frames = std::mem::take(&mut self.pending);
        let mut results = self.infer(&frames).into_iter();
        let mut gaps = 0u64;
        let count = frames.len() as u64;
        let mut flow = Flow::Continue;
        for frame in frames {
            let detections = match results.next() {
                Some(d) if d.sequence == frame.sequence() => d,
                _ => FrameDetections::gap(frame.sequence(), frame.timestamp_ms()),
            };
            if detections.gap {
                gaps += 1;
            }
            if self
                .output
                .push(AnnotatedFrame { frame, detections })
                .is_err()
            {
                flow = Flow::Stop;
                break;
            }
        }
        update_stats(&self.stats, |s| {
            s.frames_inferred += count;
            s.gap_frames += gaps;
        });
        flow
    }
}

impl Stage for InferenceStage {
    type Input = Frame;

    fn name(&self) -> &'static str {
        "inference"
    }

    fn consume(&mut self, frame: Frame) -> Result<Flow> {
        self.pending.push(frame);
        if self.pending.len() >= self.batch_size {
            return Ok(self.flush());
        }
        Ok(Flow::Continue)
    }

    /// A partial batch is sent when input goes quiet.
    fn idle(&mut self) -> Result<Flow> {
        Ok(self.flush())
    }

    fn stop(&mut self, reason: StopReason) -> Result<()> {
        if reason != StopReason::Aborted {
            self.flush();
        }
        if let InferenceEngine::Isolated(supervisor) = &mut self.engine {
            supervisor.shutdown();
        }
        self.output.close();
        Ok(())
    }
}

// -------------------- Event --------------------

pub struct EventStage {
    rules: RuleEngine,
    machine: EventStateMachine,
    output: PipelineQueue<RecorderInput>,
    faults: PipelineQueue<StageFault>,
    shutdown: Arc<AtomicBool>,
    stats: SharedStats,
    stats_interval: Duration,
    last_stats_log: Instant,
    source_id: String,
}

impl EventStage {
    pub fn new(
        settings: &PipelineSettings,
        output: PipelineQueue<RecorderInput>,
        faults: PipelineQueue<StageFault>,
        shutdown: Arc<AtomicBool>,
        stats: SharedStats,
    ) -> Self {
        Self {
            rules: RuleEngine::new(settings.rules.clone()),
            machine: EventStateMachine::new(settings.timings),
            output,
            faults,
            shutdown,
            stats,
            stats_interval: settings.stats_interval,
            last_stats_log: Instant::now(),
            source_id: settings.source_id.clone(),
        }
    }

    fn send(&mut self, command: RecorderCommand) -> Flow {
        log::debug!("{}: recorder command {}", self.source_id, command.name());
        update_stats(&self.stats, |s| s.commands += 1);
        match self.output.push(RecorderInput::Command(command)) {
            Ok(()) => Flow::Continue,
            Err(_) => Flow::Stop,
        }
    }

    fn drain_faults(&mut self) -> Flow {
        while let Pop::Item(fault) = self.faults.pop_timeout(Duration::ZERO) {
            log::warn!("{}: fault from {}: {}", self.source_id, fault.stage, fault.detail);
            update_stats(&self.stats, |s| s.faults += 1);
            if fault.stage == "ingest" {
                self.rules.reset();
            }
            let detail = format!("{}: {}", fault.stage, fault.detail);
            if let Some(command) = self.machine.fail(detail) {
                if self.send(command) == Flow::Stop {
                    return Flow::Stop;
                }
            }
        }
        Flow::Continue
    }

    fn maybe_log_stats(&mut self) {
        if self.last_stats_log.elapsed() < self.stats_interval {
            return;
        }
        self.last_stats_log = Instant::now();
        if let Ok(stats) = self.stats.lock() {
            log::debug!(
                "{}: ingested={} inferred={} gaps={} restarts={} commands={} faults={} clips={} buffered={} ({} bytes) latency={}ms",
                self.source_id,
                stats.frames_ingested,
                stats.frames_inferred,
                stats.gap_frames,
                stats.worker_restarts,
                stats.commands,
                stats.faults,
                stats.recorder.clips_finalized,
                stats.recorder.buffered_frames,
                stats.recorder.buffered_bytes,
                stats.recorder.last_frame_latency_ms
            );
        }
        log::debug!(
            "{}: recorder queue {}/{}",
            self.source_id,
            self.output.len(),
            self.output.stats().capacity
        );
    }
}

impl Stage for EventStage {
    type Input = AnnotatedFrame;

    fn name(&self) -> &'static str {
        "event"
    }

    fn consume(&mut self, item: AnnotatedFrame) -> Result<Flow> {
        if self.drain_faults() == Flow::Stop {
            return Ok(Flow::Stop);
        }
        let detections = &item.detections;
        let (activity, signals) = if detections.gap {
            (false, Vec::new())
        } else {
            (
                detections.has_activity(),
                self.rules.evaluate_frame(detections),
            )
        };
        if let Some(command) =
            self.machine
                .on_frame(item.frame.timestamp_ms(), activity, &signals)
        {
            if self.send(command) == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }
        if self.output.push(RecorderInput::Frame(item)).is_err() {
            return Ok(Flow::Stop);
        }
        self.maybe_log_stats();
        Ok(Flow::Continue)
    }

    fn idle(&mut self) -> Result<Flow> {
        if self.drain_faults() == Flow::Stop {
            return Ok(Flow::Stop);
        }
        if let Some(command) = self.machine.tick(Instant::now()) {
            if self.send(command) == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }
        self.maybe_log_stats();
        Ok(Flow::Continue)
    }

    fn stop(&mut self, reason: StopReason) -> Result<()> {
        if reason != StopReason::Aborted {
            self.drain_faults();
            let close = if self.shutdown.load(Ordering::SeqCst) {
                CloseReason::Shutdown
            } else {
                CloseReason::EndOfStream
            };
            if let Some(command) = self.machine.finish(close) {
                self.send(command);
            }
        }
        self.faults.close();
        self.output.close();
        Ok(())
    }
}

// -------------------- Recorder --------------------

pub struct RecorderStage {
    coordinator: RecordingCoordinator,
    faults: PipelineQueue<StageFault>,
    stats: SharedStats,
}

impl RecorderStage {
    pub fn new(
        coordinator: RecordingCoordinator,
        faults: PipelineQueue<StageFault>,
        stats: SharedStats,
    ) -> Self {
        Self {
            coordinator,
            faults,
            stats,
        }
    }

    fn report(&mut self) {
        for detail in self.coordinator.take_faults() {
            let fault = StageFault {
                stage: "recorder",
                detail,
            };
            if self.faults.push(fault).is_err() {
                log::debug!("fault queue closed; recorder fault not delivered");
            }
        }
        let recorder = self.coordinator.stats();
        update_stats(&self.stats, |s| s.recorder = recorder);
    }
}

impl Stage for RecorderStage {
    type Input = RecorderInput;

    fn name(&self) -> &'static str {
        "recorder"
    }

    fn consume(&mut self, input: RecorderInput) -> Result<Flow> {
        match input {
            RecorderInput::Command(command) => self.coordinator.on_command(command),
            RecorderInput::Frame(item) => self.coordinator.on_frame(item),
        }
        self.report();
        Ok(Flow::Continue)
    }

    fn stop(&mut self, reason: StopReason) -> Result<()> {
        self.coordinator.shutdown(reason == StopReason::Aborted);
        self.report();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{DetectionScript, ScriptedBackend};
    use crate::event::EventTimings;
    use crate::pipeline::queue::OverflowPolicy;
    use crate::ingest::SourceStats;
    use crate::pipeline::stage::spawn_source;
    use crate::pipeline::PipelineStats;
    use crate::TriggerKind;
    use anyhow::anyhow;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    /// A live camera that never comes back.
    struct UnreachableCamera {
        attempts: Arc<AtomicU32>,
    }

    impl FrameSource for UnreachableCamera {
        fn describe(&self) -> String {
            "rtsp://unreachable".to_string()
        }

        fn connect(&mut self) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("connection refused"))
        }

        fn next_frame(&mut self) -> Result<Option<Frame>> {
            Err(anyhow!("not connected"))
        }

        fn is_live(&self) -> bool {
            true
        }

        fn is_healthy(&self) -> bool {
            false
        }

        fn stats(&self) -> SourceStats {
            SourceStats {
                frames_captured: 0,
                reconnects: 0,
                url: self.describe(),
            }
        }
    }

    fn shared() -> SharedStats {
        Arc::new(Mutex::new(PipelineStats::default()))
    }

    fn frame(seq: u64, ts: u64) -> Frame {
        Frame::new(Arc::from("cam"), seq, ts, 4, 2, vec![0; 24])
    }

    fn drain<T>(q: &PipelineQueue<T>) -> Vec<T> {
        let mut out = Vec::new();
        while let Pop::Item(item) = q.pop_timeout(Duration::from_millis(1)) {
            out.push(item);
        }
        out
    }

    #[test]
    fn event_stage_emits_command_before_frame() -> Result<()> {
        let output = PipelineQueue::new("recorder", 16, OverflowPolicy::Block)?;
        let faults = PipelineQueue::new("faults", 4, OverflowPolicy::Block)?;
        let settings = PipelineSettings {
            timings: EventTimings {
                grace: Duration::from_secs(1),
                ..EventTimings::default()
            },
            ..PipelineSettings::default()
        };
        let mut stage = EventStage::new(
            &settings,
            output.clone(),
            faults.clone(),
            Arc::new(AtomicBool::new(false)),
            shared(),
        );

        let script = DetectionScript::from_json(
            r#"{"tracks":[{"track_id":1,"class":"person","waypoints":[{"t_ms":0,"x":10,"y":10},{"t_ms":100,"x":12,"y":10}]}]}"#,
        )?;
        let mut backend = ScriptedBackend::new(script);
        for (seq, ts) in [(0u64, 0u64), (1, 100)] {
            let f = frame(seq, ts);
            let detections = FrameDetections::new(seq, ts, backend.detect(&f)?);
            stage.consume(AnnotatedFrame {
                frame: f,
                detections,
            })?;
        }
        faults
            .push(StageFault {
                stage: "ingest",
                detail: "gone".to_string(),
            })
            .ok();
        stage.idle()?;
        stage.stop(StopReason::InputClosed)?;

        let items = drain(&output);
        let names: Vec<String> = items
            .iter()
            .map(|i| match i {
                RecorderInput::Command(c) => c.name().to_string(),
                RecorderInput::Frame(f) => format!("frame{}", f.frame.sequence()),
            })
            .collect();
        assert_eq!(names, vec!["open", "frame0", "frame1", "close"]);
        match &items[0] {
            RecorderInput::Command(RecorderCommand::Open(t)) => {
                assert_eq!(t.kind, TriggerKind::Baseline)
            }
            other => panic!("unexpected {:?}", other),
        }
        match &items[3] {
            RecorderInput::Command(RecorderCommand::Close(CloseReason::Fault(detail))) => {
                assert!(detail.contains("ingest"))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(output.is_closed());
        Ok(())
    }

    #[test]
    fn unreachable_source_faults_once_and_closes_open_event() -> Result<()> {
        let recorder = PipelineQueue::new("recorder", 16, OverflowPolicy::Block)?;
        let faults = PipelineQueue::new("faults", 8, OverflowPolicy::Block)?;
        let frames = PipelineQueue::new("frames", 8, OverflowPolicy::DropOldest)?;
        let stats = shared();
        let mut event = EventStage::new(
            &PipelineSettings::default(),
            recorder.clone(),
            faults.clone(),
            Arc::new(AtomicBool::new(false)),
            stats.clone(),
        );
        let script = DetectionScript::from_json(
            r#"{"tracks":[{"track_id":1,"class":"person","waypoints":[{"t_ms":0,"x":10,"y":10},{"t_ms":100,"x":12,"y":10}]}]}"#,
        )?;
        let mut backend = ScriptedBackend::new(script);
        let f = frame(0, 0);
        let detections = FrameDetections::new(0, 0, backend.detect(&f)?);
        event.consume(AnnotatedFrame {
            frame: f,
            detections,
        })?;

        let attempts = Arc::new(AtomicU32::new(0));
        let policy = ReconnectPolicy {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            fault_after: 3,
        };
        let mut ingest = spawn_source(IngestStage::new(
            Box::new(UnreachableCamera {
                attempts: attempts.clone(),
            }),
            policy,
            frames.clone(),
            faults.clone(),
            stats.clone(),
        ))?;
        let deadline = Instant::now() + Duration::from_secs(5);
        while attempts.load(Ordering::SeqCst) < 10 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        ingest.control().request_stop();
        let report = ingest.join()?;
        assert_eq!(report.reason, StopReason::Requested);
        assert!(attempts.load(Ordering::SeqCst) >= 10);
        assert!(frames.is_empty());

        event.idle()?;
        let faults_seen = stats.lock().map(|s| s.faults).unwrap_or_default();
        assert_eq!(faults_seen, 1);

        let items = drain(&recorder);
        let names: Vec<&str> = items
            .iter()
            .map(|i| match i {
                RecorderInput::Command(c) => c.name(),
                RecorderInput::Frame(_) => "frame",
            })
            .collect();
        assert_eq!(names, vec!["open", "frame", "close"]);
        match &items[2] {
            RecorderInput::Command(RecorderCommand::Close(CloseReason::Fault(detail))) => {
                assert!(detail.contains("after 3 attempts"), "{}", detail)
            }
            other => panic!("unexpected {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn in_process_inference_forwards_every_frame() -> Result<()> {
        let output = PipelineQueue::new("annotated", 16, OverflowPolicy::Block)?;
        let backend: Box<dyn DetectorBackend> = Box::new(crate::detect::StubBackend::default());
        let mut stage = InferenceStage::new(
            InferenceEngine::InProcess(backend),
            8,
            output.clone(),
            shared(),
        );
        for seq in 0..3 {
            stage.consume(frame(seq, seq * 100))?;
        }
        stage.stop(StopReason::InputClosed)?;
        let items = drain(&output);
        assert_eq!(items.len(), 3);
        assert!(items.iter().all(|i| !i.detections.gap));
        assert!(output.is_closed());
        Ok(())
    }
}
