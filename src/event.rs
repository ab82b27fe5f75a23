//! Per-source event lifecycle state machine.
//!
//! States:
//! - `Idle`: nothing recording.
//! - `Recording`: one active clip with its current priority and trigger.
//! - `Closing`: a close was just issued; the next input returns to `Idle`.
//!
//! Every transition emits exactly one `RecorderCommand`. Times are frame
//! timestamps, so replaying the same frames yields the same commands.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::rules::RuleSignal;
use crate::{Priority, TriggerInfo};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum CloseReason {
    /// No detections or signals for the grace period.
    GraceExpired,
    /// No frames for the grace period.
    Stalled,
    EndOfStream,
    Shutdown,
    /// Defensive close after a pipeline fault.
    Fault(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum RecorderCommand {
    Open(TriggerInfo),
    Escalate(TriggerInfo),
    Segment(TriggerInfo),
    Close(CloseReason),
}

impl RecorderCommand {
    pub fn name(&self) -> &'static str {
        match self {
            RecorderCommand::Open(_) => "open",
            RecorderCommand::Escalate(_) => "escalate",
            RecorderCommand::Segment(_) => "segment",
            RecorderCommand::Close(_) => "close",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum EventState {
    Idle,
    Recording {
        priority: Priority,
        trigger: TriggerInfo,
        segment_start_ms: u64,
    },
    Closing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventTimings {
    pub max_segment: Duration,
    pub grace: Duration,
    /// After a close, baseline detections alone do not reopen until this has
    /// passed. Zero disables.
    pub cooldown: Duration,
}

impl Default for EventTimings {
    fn default() -> Self {
        Self {
            max_segment: Duration::from_secs(60),
            grace: Duration::from_secs(5),
            cooldown: Duration::ZERO,
        }
    }
}

pub struct EventStateMachine {
    timings: EventTimings,
    state: EventState,
    last_activity_ms: u64,
    /// Timestamp of the last frame seen and when it was seen.
    last_frame: Option<(u64, Instant)>,
    cooldown_until_ms: u64,
}

impl EventStateMachine {
    pub fn new(timings: EventTimings) -> Self {
        Self {
            timings,
            state: EventState::Idle,
            last_activity_ms: 0,
            last_frame: None,
            cooldown_until_ms: 0,
        }
    }

    pub fn state(&self) -> &EventState {
        &self.state
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.state, EventState::Recording { .. })
    }

    /// Feed one frame's observations.
    ///
    /// `activity` is true when the frame has at least one detection.
    pub fn on_frame(
        &mut self,
        timestamp_ms: u64,
        activity: bool,
        signals: &[RuleSignal],
    ) -> Option<RecorderCommand> {
        if self.state == EventState::Closing {
            self.state = EventState::Idle;
        }
        self.last_frame = Some((timestamp_ms, Instant::now()));

        let best = highest_signal(signals);
        let active = activity || best.is_some();
        if active {
            self.last_activity_ms = timestamp_ms;
        }

        match &self.state {
            EventState::Idle | EventState::Closing => {
                if !active {
                    return None;
                }
                if best.is_none() && timestamp_ms < self.cooldown_until_ms {
                    log::debug!("baseline activity at {} ms ignored during cooldown", timestamp_ms);
                    return None;
                }
                let trigger = trigger_for(best, timestamp_ms);
                self.state = EventState::Recording {
                    priority: trigger.priority,
                    trigger: trigger.clone(),
                    segment_start_ms: timestamp_ms,
                };
                Some(RecorderCommand::Open(trigger))
            }
            EventState::Recording {
                priority,
                segment_start_ms,
                ..
            } => {
                let (priority, segment_start_ms) = (*priority, *segment_start_ms);
                let quiet_ms = timestamp_ms.saturating_sub(self.last_activity_ms);
                if !active && quiet_ms >= self.timings.grace.as_millis() as u64 {
                    return Some(self.close(CloseReason::GraceExpired, timestamp_ms));
                }

                let elapsed_ms = timestamp_ms.saturating_sub(segment_start_ms);
                if elapsed_ms >= self.timings.max_segment.as_millis() as u64 {
                    let trigger = trigger_for(best, timestamp_ms);
                    self.state = EventState::Recording {
                        priority: trigger.priority,
                        trigger: trigger.clone(),
                        segment_start_ms: timestamp_ms,
                    };
                    return Some(RecorderCommand::Segment(trigger));
                }

                match best {
                    Some(signal) if signal.priority > priority => {
                        let trigger = TriggerInfo::from_signal(signal);
                        self.state = EventState::Recording {
                            priority: trigger.priority,
                            trigger: trigger.clone(),
                            segment_start_ms,
                        };
                        Some(RecorderCommand::Escalate(trigger))
                    }
                    _ => None,
                }
            }
        }
    }

    /// Apply the grace timeout when no frames arrive.
    ///
    /// Frame time is extrapolated from the last frame by wall-clock elapsed time.
    pub fn tick(&mut self, now: Instant) -> Option<RecorderCommand> {
        if self.state == EventState::Closing {
            self.state = EventState::Idle;
            return None;
        }
        if !self.is_recording() {
            return None;
        }
        let (last_ts, seen_at) = self.last_frame?;
        let estimated_ms = last_ts + now.saturating_duration_since(seen_at).as_millis() as u64;
        if estimated_ms.saturating_sub(self.last_activity_ms) >= self.timings.grace.as_millis() as u64
        {
            log::warn!("no frames for {} ms; closing active event", estimated_ms - last_ts);
            return Some(self.close(CloseReason::Stalled, last_ts));
        }
        None
    }

    /// Close on end-of-stream or shutdown.
    pub fn finish(&mut self, reason: CloseReason) -> Option<RecorderCommand> {
        if !self.is_recording() {
            return None;
        }
        let ts = self.last_frame.map(|(ts, _)| ts).unwrap_or(self.last_activity_ms);
        Some(self.close(reason, ts))
    }

    /// Defensive close after a fatal pipeline error. Valid from any state.
    pub fn fail(&mut self, detail: impl Into<String>) -> Option<RecorderCommand> {
        let detail = detail.into();
        if self.state == EventState::Closing {
            log::debug!("fault while closing ignored: {}", detail);
            return None;
        }
        log::warn!("defensive close: {}", detail);
        let ts = self.last_frame.map(|(ts, _)| ts).unwrap_or(0);
        Some(self.close(CloseReason::Fault(detail), ts))
    }

    fn close(&mut self, reason: CloseReason, timestamp_ms: u64) -> RecorderCommand {
        self.state = EventState::Closing;
        self.cooldown_until_ms = timestamp_ms + self.timings.cooldown.as_millis() as u64;
        RecorderCommand::Close(reason)
    }
}

/// Highest-priority signal; the first one wins ties.
fn highest_signal(signals: &[RuleSignal]) -> Option<&RuleSignal> {
    signals.iter().fold(None, |best: Option<&RuleSignal>, s| match best {
        Some(b) if b.priority >= s.priority => Some(b),
        _ => Some(s),
    })
}

fn trigger_for(best: Option<&RuleSignal>, timestamp_ms: u64) -> TriggerInfo {
    best.map(TriggerInfo::from_signal)
        .unwrap_or_else(|| TriggerInfo::baseline(timestamp_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::SignalKind;
    use crate::TriggerKind;

    fn timings(max_secs: u64, grace_secs: u64) -> EventTimings {
        EventTimings {
            max_segment: Duration::from_secs(max_secs),
            grace: Duration::from_secs(grace_secs),
            cooldown: Duration::ZERO,
        }
    }

    fn signal(kind: SignalKind, level: u8, ts: u64) -> RuleSignal {
        RuleSignal {
            rule_id: match kind {
                SignalKind::Dwell => "zone:a".to_string(),
                SignalKind::Tripwire => "line:b".to_string(),
            },
            kind,
            priority: Priority::new(level),
            track_id: 1,
            timestamp_ms: ts,
        }
    }

    #[test]
    fn detection_opens_baseline_event() {
        let mut sm = EventStateMachine::new(timings(60, 5));
        assert_eq!(sm.on_frame(0, false, &[]), None);
        match sm.on_frame(100, true, &[]) {
            Some(RecorderCommand::Open(t)) => {
                assert_eq!(t.kind, TriggerKind::Baseline);
                assert_eq!(t.at_ms, 100);
            }
            other => panic!("expected open, got {:?}", other),
        }
        assert!(sm.is_recording());
    }

    #[test]
    fn escalation_is_monotonic() {
        let mut sm = EventStateMachine::new(timings(60, 5));
        assert!(matches!(sm.on_frame(0, true, &[]), Some(RecorderCommand::Open(_))));
        assert!(matches!(
            sm.on_frame(100, true, &[signal(SignalKind::Dwell, 1, 100)]),
            Some(RecorderCommand::Escalate(_))
        ));
        // Equal priority does not escalate.
        assert_eq!(sm.on_frame(200, true, &[signal(SignalKind::Dwell, 1, 200)]), None);
        assert!(matches!(
            sm.on_frame(300, true, &[signal(SignalKind::Tripwire, 2, 300)]),
            Some(RecorderCommand::Escalate(_))
        ));
        // Lower priority never de-escalates.
        assert_eq!(sm.on_frame(400, true, &[signal(SignalKind::Dwell, 1, 400)]), None);
        match sm.state() {
            EventState::Recording {
                priority,
                segment_start_ms,
                ..
            } => {
                assert_eq!(*priority, Priority::new(2));
                assert_eq!(*segment_start_ms, 0);
            }
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn grace_period_closes_then_idles() {
        let mut sm = EventStateMachine::new(timings(60, 5));
        sm.on_frame(0, true, &[]);
        assert_eq!(sm.on_frame(4_900, false, &[]), None);
        assert_eq!(
            sm.on_frame(5_000, false, &[]),
            Some(RecorderCommand::Close(CloseReason::GraceExpired))
        );
        assert_eq!(sm.state(), &EventState::Closing);
        assert_eq!(sm.on_frame(5_100, false, &[]), None);
        assert_eq!(sm.state(), &EventState::Idle);
    }

    #[test]
    fn segments_at_max_duration_and_reevaluates_priority() {
        let mut sm = EventStateMachine::new(timings(60, 5));
        sm.on_frame(0, true, &[signal(SignalKind::Tripwire, 2, 0)]);
        let mut segments = Vec::new();
        for ts in (100..=185_000).step_by(100) {
            if let Some(cmd) = sm.on_frame(ts, true, &[]) {
                segments.push((ts, cmd));
            }
        }
        let cut_at: Vec<u64> = segments.iter().map(|(ts, _)| *ts).collect();
        assert_eq!(cut_at, vec![60_000, 120_000, 180_000]);
        match &segments[0].1 {
            RecorderCommand::Segment(t) => assert_eq!(t.kind, TriggerKind::Baseline),
            other => panic!("expected segment, got {:?}", other),
        }
        // The new segment can be escalated again.
        assert!(matches!(
            sm.on_frame(185_100, true, &[signal(SignalKind::Dwell, 1, 185_100)]),
            Some(RecorderCommand::Escalate(_))
        ));
    }

    #[test]
    fn fault_closes_from_any_state() {
        let mut sm = EventStateMachine::new(timings(60, 5));
        sm.on_frame(0, true, &[]);
        assert!(matches!(
            sm.fail("recorder i/o"),
            Some(RecorderCommand::Close(CloseReason::Fault(_)))
        ));
        assert_eq!(sm.fail("again"), None);
    }

    #[test]
    fn tick_closes_stalled_stream() {
        let mut sm = EventStateMachine::new(timings(60, 2));
        sm.on_frame(1_000, true, &[]);
        let now = Instant::now();
        assert_eq!(sm.tick(now), None);
        assert_eq!(
            sm.tick(now + Duration::from_secs(3)),
            Some(RecorderCommand::Close(CloseReason::Stalled))
        );
    }

    #[test]
    fn finish_only_closes_active_recording() {
        let mut sm = EventStateMachine::new(timings(60, 5));
        assert_eq!(sm.finish(CloseReason::EndOfStream), None);
        sm.on_frame(0, true, &[]);
        assert_eq!(
            sm.finish(CloseReason::EndOfStream),
            Some(RecorderCommand::Close(CloseReason::EndOfStream))
        );
    }

    #[test]
    fn cooldown_suppresses_baseline_reopen_only() {
        let mut sm = EventStateMachine::new(EventTimings {
            cooldown: Duration::from_secs(10),
            ..timings(60, 1)
        });
        sm.on_frame(0, true, &[]);
        sm.on_frame(1_000, false, &[]);
        assert_eq!(sm.on_frame(2_000, true, &[]), None);
        assert!(matches!(
            sm.on_frame(2_100, true, &[signal(SignalKind::Dwell, 1, 2_100)]),
            Some(RecorderCommand::Open(_))
        ));
    }
}
