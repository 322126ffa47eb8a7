//! Progress events.
//!
//! Events complement `tracing` logs with a typed record of what the
//! orchestrator and the build graph did, in order.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink, RecordedEvent};
