//! Event bus: trait for emitting sequence analytics events.
//!
//! Engine components accept an `Arc<dyn EventSink>` and emit one event per
//! lifecycle change (enrollment, step outcome, exit, conversion).

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::types::{SequenceEvent, SequenceEventType};

pub trait EventSink: Send + Sync {
    fn emit(&self, event: SequenceEvent);
}

/// No-op sink for tests and deployments without an analytics pipeline.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: SequenceEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<SequenceEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SequenceEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_type(&self, event_type: SequenceEventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    /// Events for one enrollment, in emission order.
    pub fn for_enrollment(&self, enrollment_id: &Uuid) -> Vec<SequenceEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.enrollment_id.as_ref() == Some(enrollment_id))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: SequenceEvent) {
        self.events.lock().push(event);
    }
}

/// Writes every event as a structured log line, stamped with this node.
pub struct TracingSink {
    node_id: String,
}

impl TracingSink {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
        }
    }
}

impl EventSink for TracingSink {
    fn emit(&self, event: SequenceEvent) {
        info!(
            target: "outreach_events",
            node_id = %self.node_id,
            event_type = ?event.event_type,
            sequence_id = %event.sequence_id,
            enrollment_id = ?event.enrollment_id,
            step_id = ?event.step_id,
            detail = %event.detail,
            "Sequence event"
        );
    }
}

/// Delivers each event to every inner sink.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: SequenceEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}

/// Builds a `SequenceEvent` stamped with a fresh id and the current time.
pub fn make_event(
    event_type: SequenceEventType,
    sequence_id: Uuid,
    enrollment_id: Option<Uuid>,
    step_id: Option<Uuid>,
    detail: serde_json::Value,
) -> SequenceEvent {
    SequenceEvent {
        event_id: Uuid::new_v4(),
        event_type,
        sequence_id,
        enrollment_id,
        step_id,
        node_id: "local".into(),
        detail,
        timestamp: Utc::now(),
    }
}

pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
