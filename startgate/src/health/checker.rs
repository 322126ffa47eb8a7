//! Single health checks against the running server.

use async_trait::async_trait;
use thiserror::Error;

/// Why a health check did not pass.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct CheckFailure(pub String);

impl CheckFailure {
    /// Creates a failure.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Performs one read-only check.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Returns `Ok` if the server is ready to serve.
    async fn check(&self) -> Result<(), CheckFailure>;
}

#[cfg(feature = "http-health")]
pub use http::HttpHealthChecker;

#[cfg(feature = "http-health")]
mod http {
    use super::{CheckFailure, HealthChecker};
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use std::time::Duration;

    /// `GET`s the status endpoint. Only `200` counts as healthy.
    #[derive(Debug, Clone)]
    pub struct HttpHealthChecker {
        client: reqwest::Client,
        url: String,
    }

    impl HttpHealthChecker {
        /// Creates a checker with a per-request timeout.
        pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, CheckFailure> {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .map_err(|e| CheckFailure::new(format!("http client: {e}")))?;
            Ok(Self {
                client,
                url: url.into(),
            })
        }

        /// The probed URL.
        #[must_use]
        pub fn url(&self) -> &str {
            &self.url
        }
    }

    #[async_trait]
    impl HealthChecker for HttpHealthChecker {
        async fn check(&self) -> Result<(), CheckFailure> {
            let response = self
                .client
                .get(&self.url)
                .send()
                .await
                .map_err(|e| CheckFailure::new(format!("GET {}: {e}", self.url)))?;
            match response.status() {
                StatusCode::OK => Ok(()),
                status => Err(CheckFailure::new(format!("GET {}: status {status}", self.url))),
            }
        }
    }

}
