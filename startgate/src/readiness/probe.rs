//! Connectivity probes.

use super::target::Endpoint;
use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpStream;

/// A failed probe. Every cause (refused, reset, DNS) means "not yet ready".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ProbeFailure(pub String);

impl ProbeFailure {
    /// Creates a failure.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Checks whether an endpoint accepts connections.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// Attempts one connection.
    async fn probe(&self, endpoint: &Endpoint) -> Result<(), ProbeFailure>;
}

/// Probe that opens and immediately closes a TCP connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

#[async_trait]
impl ConnectivityProbe for TcpProbe {
    async fn probe(&self, endpoint: &Endpoint) -> Result<(), ProbeFailure> {
        TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map(drop)
            .map_err(|e| ProbeFailure::new(format!("{endpoint}: {e}")))
    }
}
