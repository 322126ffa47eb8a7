//! Readiness targets parsed from database URIs.

use crate::errors::ReadinessError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

// The password runs up to the last '@' of the authority, so an unencoded
// '@' in it still leaves the host intact.
static DATABASE_URI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<scheme>[A-Za-z][A-Za-z0-9.+-]*)://(?:(?P<user>[^:@/]*)(?::(?P<password>[^/]*))?@)?(?P<host>\[[^\]]*\]|[^:/?#@]*)(?::(?P<port>[0-9]*))?(?P<rest>[/?#].*)?$",
    )
    .unwrap_or_else(|e| unreachable!("static pattern: {e}"))
});

/// A host and port to probe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host name or address (IPv6 without brackets).
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// The dependency the readiness gate waits for.
///
/// Displays with any password redacted, so it is safe to log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessTarget {
    /// Base scheme without driver suffix, e.g. `postgresql`.
    pub scheme: String,
    /// Where to probe. `None` means the dependency is local (e.g. sqlite)
    /// and is ready without waiting.
    pub endpoint: Option<Endpoint>,
    redacted: String,
}

impl ReadinessTarget {
    /// A plain TCP target.
    #[must_use]
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        let endpoint = Endpoint {
            host: host.into(),
            port,
        };
        Self {
            scheme: "tcp".to_string(),
            redacted: format!("tcp://{endpoint}"),
            endpoint: Some(endpoint),
        }
    }

    /// Parses a SQLAlchemy-style database URI such as
    /// `postgresql+psycopg2://linotp:secret@db:5432/linotp`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTarget` for malformed URIs, unsupported schemes and
    /// invalid ports.
    pub fn from_database_uri(uri: &str) -> Result<Self, ReadinessError> {
        let invalid = |reason: &str| ReadinessError::InvalidTarget {
            target: redact(uri),
            reason: reason.to_string(),
        };

        let caps = DATABASE_URI
            .captures(uri.trim())
            .ok_or_else(|| invalid("not a URI of the form scheme://[user[:password]@]host[:port]/database"))?;

        let full_scheme = caps["scheme"].to_ascii_lowercase();
        let scheme = full_scheme
            .split('+')
            .next()
            .unwrap_or_default()
            .to_string();

        let default_port = match scheme.as_str() {
            "sqlite" => {
                return Ok(Self {
                    scheme,
                    endpoint: None,
                    redacted: redact(uri),
                })
            }
            "postgres" | "postgresql" => 5432,
            "mysql" | "mariadb" => 3306,
            _ => return Err(invalid("unsupported database scheme")),
        };

        let host = caps
            .name("host")
            .map(|m| m.as_str().trim_start_matches('[').trim_end_matches(']'))
            .filter(|h| !h.is_empty())
            .unwrap_or("localhost")
            .to_string();

        let port = match caps.name("port").map(|m| m.as_str()) {
            None | Some("") => default_port,
            Some(p) => p.parse::<u16>().ok().filter(|p| *p != 0).ok_or_else(|| invalid("invalid port"))?,
        };

        Ok(Self {
            scheme,
            endpoint: Some(Endpoint { host, port }),
            redacted: redact(uri),
        })
    }

    /// Returns true if the gate has to poll this target.
    #[must_use]
    pub fn needs_wait(&self) -> bool {
        self.endpoint.is_some()
    }
}

impl fmt::Display for ReadinessTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted)
    }
}

/// Replaces the password in a URI with `***`.
#[must_use]
pub fn redact(uri: &str) -> String {
    match DATABASE_URI.captures(uri.trim()) {
        Some(caps) => match caps.name("password") {
            Some(password) => {
                let mut out = uri.trim().to_string();
                out.replace_range(password.range(), "***");
                out
            }
            None => uri.trim().to_string(),
        },
        None => "<unparseable uri>".to_string(),
    }
}
