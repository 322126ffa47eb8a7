//! Readiness gate.
//!
//! Startup blocks here until the primary data dependency accepts
//! connections, within a bounded budget.

mod gate;
mod policy;
mod probe;
mod target;

pub use gate::{ReadinessCheck, ReadinessGate};
pub use policy::{BackoffStrategy, JitterStrategy, PollPolicy};
pub use probe::{ConnectivityProbe, ProbeFailure, TcpProbe};
pub use target::{redact, Endpoint, ReadinessTarget};
