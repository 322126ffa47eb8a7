//! Health probe for the running server.
//!
//! Checks are read-only `GET`s against the status endpoint. The probe only
//! classifies; acting on the result is left to the container runtime.

mod checker;
mod policy;
mod probe;

#[cfg(feature = "http-health")]
pub use checker::HttpHealthChecker;
pub use checker::{CheckFailure, HealthChecker};
pub use policy::{HealthPolicy, DEFAULT_HEALTHCHECK_URL};
pub use probe::{check_with_timeout, HealthMonitor, HealthProbe};
