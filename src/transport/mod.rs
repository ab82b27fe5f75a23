//! Event notification.
//!
//! Notification is fire-and-forget: the recorder calls `notify` after a record
//! is handed to persistence and only logs a failure.

mod mqtt;

use anyhow::Result;
use std::sync::{Arc, Mutex};

use crate::EventSummary;

pub use mqtt::{parse_mqtt_endpoint, MqttEndpoint, MqttNotifier, MqttSettings};

pub trait Notifier: Send {
    fn notify(&mut self, summary: &EventSummary) -> Result<()>;
}

/// Writes one log line per finalized event.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&mut self, summary: &EventSummary) -> Result<()> {
        log::info!(
            "event {} on {}: rule={} priority={} span={}..{}{}",
            summary.event_id,
            summary.source_id,
            summary.trigger_rule_id,
            summary.priority.level(),
            summary.start_ms,
            summary.end_ms,
            if summary.truncated { " (truncated)" } else { "" }
        );
        Ok(())
    }
}

/// Collects summaries in memory. Clones share the same list.
#[derive(Clone, Default)]
pub struct CollectingNotifier {
    seen: Arc<Mutex<Vec<EventSummary>>>,
}

impl CollectingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn summaries(&self) -> Vec<EventSummary> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Notifier for CollectingNotifier {
    fn notify(&mut self, summary: &EventSummary) -> Result<()> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(summary.clone());
        }
        Ok(())
    }
}

/// Fans a summary out to several notifiers; one failing does not stop the rest.
#[derive(Default)]
pub struct NotifierSet {
    notifiers: Vec<Box<dyn Notifier>>,
}

impl NotifierSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, notifier: Box<dyn Notifier>) {
        self.notifiers.push(notifier);
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }
}

impl Notifier for NotifierSet {
    fn notify(&mut self, summary: &EventSummary) -> Result<()> {
        for notifier in &mut self.notifiers {
            if let Err(e) = notifier.notify(summary) {
                log::debug!("notification for {} failed: {:#}", summary.event_id, e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Priority, TriggerKind};

    struct Failing;

    impl Notifier for Failing {
        fn notify(&mut self, _summary: &EventSummary) -> Result<()> {
            Err(anyhow::anyhow!("broker down"))
        }
    }

    fn summary() -> EventSummary {
        EventSummary {
            event_id: "e1".to_string(),
            source_id: "cam".to_string(),
            trigger_rule_id: "line:gate".to_string(),
            trigger_kind: TriggerKind::Tripwire,
            priority: Priority::DEFAULT_TRIPWIRE,
            start_ms: 0,
            end_ms: 1_000,
            clip: None,
            person_id: None,
            truncated: false,
        }
    }

    #[test]
    fn notifier_set_swallows_failures() -> Result<()> {
        let collected = CollectingNotifier::new();
        let mut set = NotifierSet::new();
        set.push(Box::new(Failing));
        set.push(Box::new(collected.clone()));
        set.push(Box::new(LogNotifier));
        set.notify(&summary())?;
        assert_eq!(set.len(), 3);
        assert_eq!(collected.summaries(), vec![summary()]);
        Ok(())
    }
}
