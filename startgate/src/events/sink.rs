//! Progress events for startup steps, build stages and the privilege gate.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, warn, Level};

/// Receives progress events.
///
/// Event types are dotted names such as `startup.step.completed` or
/// `stage.cached`; the payload is a small JSON object naming the step or
/// stage involved.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event, awaiting the sink if it needs to.
    async fn emit(&self, event_type: &str, data: Option<Value>) {
        self.try_emit(event_type, data);
    }

    /// Emits an event without blocking. Never fails.
    fn try_emit(&self, event_type: &str, data: Option<Value>);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn try_emit(&self, _event_type: &str, _data: Option<Value>) {}
}

/// Returns true for event types that report a failure or a refusal.
fn is_failure(event_type: &str) -> bool {
    [".failed", ".denied", ".timed_out", ".unhealthy"]
        .iter()
        .any(|suffix| event_type.ends_with(suffix))
}

/// The step, stage or command an event is about, if its payload names one.
fn subject(data: Option<&Value>) -> Option<&str> {
    let data = data?;
    ["step", "stage", "command", "target"]
        .iter()
        .find_map(|key| data.get(*key).and_then(Value::as_str))
}

/// Writes events to the tracing subscriber.
///
/// Failures and denials are logged at `WARN`; everything else at the
/// configured progress level.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    progress_level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self {
            progress_level: Level::INFO,
        }
    }
}

impl LoggingEventSink {
    /// Logs progress events at `DEBUG`, keeping only failures visible at
    /// the default filter.
    #[must_use]
    pub fn quiet() -> Self {
        Self {
            progress_level: Level::DEBUG,
        }
    }
}

impl EventSink for LoggingEventSink {
    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        let subject = subject(data.as_ref()).unwrap_or("-");
        if is_failure(event_type) {
            warn!(event = %event_type, subject = %subject, data = ?data, "{event_type}");
        } else if self.progress_level == Level::DEBUG {
            debug!(event = %event_type, subject = %subject, data = ?data, "{event_type}");
        } else {
            info!(event = %event_type, subject = %subject, data = ?data, "{event_type}");
        }
    }
}

/// One event captured by [`CollectingEventSink`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    /// Dotted event type.
    pub event_type: String,
    /// Payload, if any.
    pub data: Option<Value>,
}

impl RecordedEvent {
    /// A string field of the payload.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.data.as_ref()?.get(name)?.as_str()
    }
}

/// Keeps every event in memory, for assertions in tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<RecordedEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything emitted so far, in order.
    #[must_use]
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.read().clone()
    }

    /// The event types emitted so far, in order.
    #[must_use]
    pub fn event_types(&self) -> Vec<String> {
        self.events.read().iter().map(|e| e.event_type.clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Events whose type starts with `type_prefix`.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<RecordedEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type.starts_with(type_prefix))
            .cloned()
            .collect()
    }

    /// The `field` value of every event of exactly `event_type`.
    #[must_use]
    pub fn field_values(&self, event_type: &str, field: &str) -> Vec<String> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type == event_type)
            .filter_map(|e| e.field(field).map(str::to_string))
            .collect()
    }
}

impl EventSink for CollectingEventSink {
    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        self.events.write().push(RecordedEvent {
            event_type: event_type.to_string(),
            data,
        });
    }
}
