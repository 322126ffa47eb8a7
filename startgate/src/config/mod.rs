//! Startup configuration.
//!
//! Every setting the orchestrator recognizes is read from the environment
//! exactly once, validated, and collected into [`StartupConfig`]. Variable
//! names are `<PREFIX>_<NAME>`; the prefix defaults to `LINOTP`.

mod duration;

pub use duration::{parse_bool, parse_duration};

use crate::errors::ConfigError;
use crate::health::HealthPolicy;
use crate::observability::LogFormat;
use crate::process::{LaunchMode, LaunchSpec, SAFE_PATH};
use crate::readiness::{PollPolicy, ReadinessTarget};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix used when none is configured.
pub const DEFAULT_ENV_PREFIX: &str = "LINOTP";

/// Overrides the prefix for [`StartupConfig::load`].
pub const PREFIX_OVERRIDE_VAR: &str = "STARTGATE_ENV_PREFIX";

/// System trust store directory the mounted certificates are copied into.
pub const DEFAULT_CA_STORE_DIR: &str = "/usr/local/share/ca-certificates/linotp";

/// A value that must never be logged.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Wraps a value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The plain value.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// All environment-derived settings of one container start.
#[derive(Clone)]
pub struct StartupConfig {
    /// Variable name prefix, without the trailing underscore.
    pub prefix: String,
    /// Base path for persisted state.
    pub root_dir: PathBuf,
    /// Cache directory.
    pub cache_dir: PathBuf,
    /// Backup directory.
    pub backup_dir: PathBuf,
    /// Log directory.
    pub log_dir: PathBuf,
    /// Operator-provided templates.
    pub custom_templates_dir: PathBuf,
    /// Operator-provided static assets.
    pub custom_assets_dir: PathBuf,
    /// Installed application; custom directories are linked below it.
    pub app_dir: PathBuf,
    /// Primary datastore URI.
    pub database_uri: Option<Secret>,
    /// Readiness target derived from `database_uri`.
    pub readiness_target: Option<ReadinessTarget>,
    /// Readiness timeout budget.
    pub db_waittime: Duration,
    /// Readiness poll interval.
    pub db_poll_interval: Duration,
    /// Mounted CA certificates.
    pub ca_certificates_dir: PathBuf,
    /// Trust store destination.
    pub ca_store_dir: PathBuf,
    /// Initial administrator name.
    pub admin_user: String,
    /// Initial administrator password.
    pub admin_password: Option<Secret>,
    /// Passed through to the server untouched.
    pub disable_controllers: Option<String>,
    /// Unprivileged identity the server runs as.
    pub service_user: String,
    /// Server program and arguments.
    pub server_command: Vec<String>,
    /// Address the server listens on.
    pub server_listen: String,
    /// Status endpoint for health checks.
    pub healthcheck_url: String,
    /// Health probe timing.
    pub health: HealthPolicy,
    /// Fallback log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Log output format.
    pub log_format: LogFormat,
    /// Spawn and supervise the server instead of exec'ing it.
    pub supervise: bool,
    environment: BTreeMap<String, String>,
}

impl fmt::Debug for StartupConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartupConfig")
            .field("prefix", &self.prefix)
            .field("root_dir", &self.root_dir)
            .field("app_dir", &self.app_dir)
            .field(
                "database",
                &self.readiness_target.as_ref().map(ToString::to_string),
            )
            .field("db_waittime", &self.db_waittime)
            .field("db_poll_interval", &self.db_poll_interval)
            .field("admin_user", &self.admin_user)
            .field("admin_password", &self.admin_password)
            .field("service_user", &self.service_user)
            .field("server_command", &self.server_command)
            .field("supervise", &self.supervise)
            .finish_non_exhaustive()
    }
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self::defaults(DEFAULT_ENV_PREFIX)
    }
}

impl StartupConfig {
    fn defaults(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            root_dir: PathBuf::from("/var/lib/linotp"),
            cache_dir: PathBuf::from("/var/cache/linotp"),
            backup_dir: PathBuf::from("/var/backups/linotp"),
            log_dir: PathBuf::from("/var/log/linotp"),
            custom_templates_dir: PathBuf::from("/etc/linotp/custom-templates"),
            custom_assets_dir: PathBuf::from("/etc/linotp/custom-assets"),
            app_dir: PathBuf::from("/usr/share/linotp"),
            database_uri: None,
            readiness_target: None,
            db_waittime: Duration::from_secs(30),
            db_poll_interval: Duration::from_secs(1),
            ca_certificates_dir: PathBuf::from("/usr/local/share/ca-certificates/linotp-mounted"),
            ca_store_dir: PathBuf::from(DEFAULT_CA_STORE_DIR),
            admin_user: "admin".to_string(),
            admin_password: None,
            disable_controllers: None,
            service_user: "linotp".to_string(),
            server_command: vec!["linotp".to_string(), "run".to_string()],
            server_listen: "0.0.0.0:5000".to_string(),
            healthcheck_url: health_url_for("0.0.0.0:5000"),
            health: HealthPolicy::default(),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            supervise: false,
            environment: BTreeMap::new(),
        }
    }

    /// Reads the process environment using the prefix from
    /// `STARTGATE_ENV_PREFIX`, or `LINOTP`.
    pub fn load() -> Result<Self, ConfigError> {
        let prefix = std::env::var(PREFIX_OVERRIDE_VAR)
            .ok()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_ENV_PREFIX.to_string());
        Self::from_env(&prefix)
    }

    /// Reads the process environment.
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        Self::from_vars(prefix, std::env::vars())
    }

    /// Builds the configuration from explicit variables.
    ///
    /// Empty values count as unset.
    pub fn from_vars<I, K, V>(prefix: &str, vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let prefix = prefix.trim().trim_end_matches('_');
        if prefix.is_empty() {
            return Err(ConfigError::invalid(PREFIX_OVERRIDE_VAR, "prefix must not be empty"));
        }

        let environment: BTreeMap<String, String> =
            vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        let mut config = Self::defaults(prefix);
        let reader = Reader {
            prefix,
            vars: &environment,
        };

        for (name, field) in [
            ("ROOT_DIR", &mut config.root_dir),
            ("CACHE_DIR", &mut config.cache_dir),
            ("BACKUP_DIR", &mut config.backup_dir),
            ("LOG_DIR", &mut config.log_dir),
            ("CUSTOM_TEMPLATES_DIR", &mut config.custom_templates_dir),
            ("CUSTOM_ASSETS_DIR", &mut config.custom_assets_dir),
            ("APP_DIR", &mut config.app_dir),
            ("CA_CERTIFICATES_DIR", &mut config.ca_certificates_dir),
            ("CA_STORE_DIR", &mut config.ca_store_dir),
        ] {
            if let Some(path) = reader.path(name)? {
                *field = path;
            }
        }

        if let Some(uri) = reader.get("DATABASE_URI") {
            let target = ReadinessTarget::from_database_uri(uri)
                .map_err(|e| ConfigError::invalid(reader.key("DATABASE_URI"), e.to_string()))?;
            config.readiness_target = Some(target);
            config.database_uri = Some(Secret::new(uri));
        }

        config.db_waittime = reader.duration("DB_WAITTIME", config.db_waittime)?;
        config.db_poll_interval = reader.duration("DB_POLL_INTERVAL", config.db_poll_interval)?;
        for (name, value) in [
            ("DB_WAITTIME", config.db_waittime),
            ("DB_POLL_INTERVAL", config.db_poll_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::invalid(reader.key(name), "must be greater than zero"));
            }
        }

        if let Some(user) = reader.get("ADMIN_USER") {
            config.admin_user = user.to_string();
        }
        config.admin_password = reader.get("ADMIN_PASSWORD").map(Secret::new);
        config.disable_controllers = reader.get("DISABLE_CONTROLLERS").map(str::to_string);

        if let Some(user) = reader.get("SERVICE_USER") {
            config.service_user = user.to_string();
        }
        if let Some(command) = reader.get("SERVER_COMMAND") {
            config.server_command = command.split_whitespace().map(str::to_string).collect();
        }
        if let Some(listen) = reader.get("SERVER_LISTEN") {
            config.server_listen = listen.to_string();
            config.healthcheck_url = health_url_for(listen);
        }
        if let Some(url) = reader.get("HEALTHCHECK_URL") {
            config.healthcheck_url = url.to_string();
        }

        config.health = HealthPolicy {
            interval: reader.duration("HEALTHCHECK_INTERVAL", config.health.interval)?,
            timeout: reader.duration("HEALTHCHECK_TIMEOUT", config.health.timeout)?,
            retries: reader.parse("HEALTHCHECK_RETRIES", config.health.retries)?,
            start_period: reader.duration("HEALTHCHECK_START_PERIOD", config.health.start_period)?,
        };
        config.health.validate().map_err(|e| match e {
            ConfigError::Invalid { key, reason } => ConfigError::invalid(reader.key(&key), reason),
            other => other,
        })?;

        if let Some(level) = reader.get("LOG_LEVEL") {
            config.log_level = level.to_string();
        }
        config.log_format = reader.parse("LOG_FORMAT", config.log_format)?;
        if let Some(value) = reader.get("SUPERVISE") {
            config.supervise =
                parse_bool(value).map_err(|reason| ConfigError::invalid(reader.key("SUPERVISE"), reason))?;
        }

        config.environment = environment;
        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_command.is_empty() {
            return Err(ConfigError::invalid(self.key("SERVER_COMMAND"), "must not be empty"));
        }
        if self.service_user.trim().is_empty() {
            return Err(ConfigError::invalid(self.key("SERVICE_USER"), "must not be empty"));
        }
        if self.admin_user.trim().is_empty() {
            return Err(ConfigError::invalid(self.key("ADMIN_USER"), "must not be empty"));
        }
        Ok(())
    }

    /// Full variable name for `name`.
    #[must_use]
    pub fn key(&self, name: &str) -> String {
        format!("{}_{name}", self.prefix)
    }

    /// The readiness target, required for a startup.
    pub fn require_database(&self) -> Result<&ReadinessTarget, ConfigError> {
        self.readiness_target
            .as_ref()
            .ok_or_else(|| ConfigError::Missing(self.key("DATABASE_URI")))
    }

    /// Fixed-interval polling within `DB_WAITTIME`.
    #[must_use]
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy::fixed(self.db_poll_interval, self.db_waittime)
    }

    /// Persisted directories, in creation order. The custom template and
    /// asset directories are part of the layout so the symlink step always
    /// has a target.
    #[must_use]
    pub fn persisted_dirs(&self) -> Vec<&Path> {
        vec![
            self.root_dir.as_path(),
            self.cache_dir.as_path(),
            self.backup_dir.as_path(),
            self.log_dir.as_path(),
            self.custom_templates_dir.as_path(),
            self.custom_assets_dir.as_path(),
        ]
    }

    /// `(link, target)` pairs for the custom template and asset directories.
    #[must_use]
    pub fn custom_links(&self) -> Vec<(PathBuf, PathBuf)> {
        vec![
            (
                self.app_dir.join("templates").join("custom"),
                self.custom_templates_dir.clone(),
            ),
            (
                self.app_dir.join("public").join("custom"),
                self.custom_assets_dir.clone(),
            ),
        ]
    }

    /// Environment of the server: everything the container was started
    /// with, minus the one-time bootstrap credentials.
    #[must_use]
    pub fn server_environment(&self) -> BTreeMap<String, String> {
        let hidden = [self.key("ADMIN_USER"), self.key("ADMIN_PASSWORD")];
        self.environment
            .iter()
            .filter(|(k, _)| !hidden.contains(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Environment for provisioning commands: the server environment plus
    /// the bootstrap credentials.
    #[must_use]
    pub fn provisioning_environment(&self) -> BTreeMap<String, String> {
        let mut env = self.server_environment();
        env.insert(self.key("ADMIN_USER"), self.admin_user.clone());
        if let Some(password) = &self.admin_password {
            env.insert(self.key("ADMIN_PASSWORD"), password.expose().to_string());
        }
        env
    }

    /// The server launch, before the identity is applied. The container's
    /// `PATH` is kept; without one the server gets [`SAFE_PATH`].
    #[must_use]
    pub fn launch_spec(&self) -> LaunchSpec {
        let mut parts = self.server_command.iter().cloned();
        let mut env = self.server_environment();
        env.entry("PATH".to_string())
            .or_insert_with(|| SAFE_PATH.to_string());
        LaunchSpec {
            program: parts.next().unwrap_or_default(),
            args: parts.collect(),
            env,
            uid: None,
            gid: None,
            cwd: Some(self.root_dir.clone()),
            mode: if self.supervise {
                LaunchMode::Supervise
            } else {
                LaunchMode::Exec
            },
        }
    }
}

fn health_url_for(listen: &str) -> String {
    let local = match listen.rsplit_once(':') {
        Some(("0.0.0.0" | "" | "*", port)) => format!("127.0.0.1:{port}"),
        Some(("[::]", port)) => format!("[::1]:{port}"),
        _ => listen.to_string(),
    };
    format!("http://{local}/healthcheck/status")
}

struct Reader<'a> {
    prefix: &'a str,
    vars: &'a BTreeMap<String, String>,
}

impl Reader<'_> {
    fn key(&self, name: &str) -> String {
        format!("{}_{name}", self.prefix)
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .get(&self.key(name))
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn path(&self, name: &str) -> Result<Option<PathBuf>, ConfigError> {
        let Some(value) = self.get(name) else {
            return Ok(None);
        };
        let path = PathBuf::from(value);
        if !path.is_absolute() {
            return Err(ConfigError::invalid(self.key(name), "must be an absolute path"));
        }
        Ok(Some(path))
    }

    fn duration(&self, name: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.get(name).map_or(Ok(default), |value| {
            parse_duration(value).map_err(|reason| ConfigError::invalid(self.key(name), reason))
        })
    }

    fn parse<T>(&self, name: &str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: fmt::Display,
    {
        self.get(name).map_or(Ok(default), |value| {
            value
                .parse()
                .map_err(|e: T::Err| ConfigError::invalid(self.key(name), e.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
    }

    #[test]
    fn test_defaults() {
        let config = StartupConfig::from_vars("LINOTP", vars(&[])).unwrap();
        assert_eq!(config.root_dir, PathBuf::from("/var/lib/linotp"));
        assert_eq!(config.db_waittime, Duration::from_secs(30));
        assert_eq!(config.db_poll_interval, Duration::from_secs(1));
        assert_eq!(config.service_user, "linotp");
        assert_eq!(config.server_command, vec!["linotp", "run"]);
        assert_eq!(config.healthcheck_url, "http://127.0.0.1:5000/healthcheck/status");
        assert_eq!(config.health, HealthPolicy::default());
        assert!(!config.supervise);
        assert!(matches!(config.require_database(), Err(ConfigError::Missing(k)) if k == "LINOTP_DATABASE_URI"));
    }

    #[test]
    fn test_reads_prefixed_values() {
        let config = StartupConfig::from_vars(
            "ACME",
            vars(&[
                ("ACME_ROOT_DIR", "/data"),
                ("ACME_DATABASE_URI", "postgresql+psycopg2://linotp:s3cret@db/linotp"),
                ("ACME_DB_WAITTIME", "2m"),
                ("ACME_ADMIN_PASSWORD", "hunter2"),
                ("ACME_SUPERVISE", "yes"),
                ("ACME_LOG_FORMAT", "json"),
                ("ACME_HEALTHCHECK_RETRIES", "5"),
                ("LINOTP_ROOT_DIR", "/ignored"),
            ]),
        )
        .unwrap();

        assert_eq!(config.root_dir, PathBuf::from("/data"));
        assert_eq!(config.db_waittime, Duration::from_secs(120));
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.health.retries, 5);
        assert!(config.supervise);
        assert_eq!(config.launch_spec().mode, LaunchMode::Supervise);
        assert_eq!(
            config.require_database().unwrap().to_string(),
            "postgresql+psycopg2://linotp:***@db/linotp"
        );
    }

    #[test]
    fn test_secrets_stay_out_of_debug_and_server_env() {
        let config = StartupConfig::from_vars(
            "LINOTP",
            vars(&[
                ("LINOTP_DATABASE_URI", "mysql://u:topsecret@db/linotp"),
                ("LINOTP_ADMIN_USER", "root-admin"),
                ("LINOTP_ADMIN_PASSWORD", "hunter2"),
                ("LINOTP_DISABLE_CONTROLLERS", "gettoken"),
            ]),
        )
        .unwrap();

        let debug = format!("{config:?}");
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("topsecret"));

        let env = config.server_environment();
        assert!(!env.contains_key("LINOTP_ADMIN_PASSWORD"));
        assert!(!env.contains_key("LINOTP_ADMIN_USER"));
        assert_eq!(env.get("LINOTP_DISABLE_CONTROLLERS").map(String::as_str), Some("gettoken"));
        assert!(env.contains_key("LINOTP_DATABASE_URI"));

        let provisioning = config.provisioning_environment();
        assert_eq!(provisioning.get("LINOTP_ADMIN_PASSWORD").map(String::as_str), Some("hunter2"));
    }

    #[test]
    fn test_invalid_values() {
        let cases = [
            ("LINOTP_DB_WAITTIME", "0"),
            ("LINOTP_DB_WAITTIME", "forever"),
            ("LINOTP_DB_POLL_INTERVAL", "PT0S"),
            ("LINOTP_ROOT_DIR", "relative/path"),
            ("LINOTP_DATABASE_URI", "oracle://db/x"),
            ("LINOTP_SUPERVISE", "sometimes"),
            ("LINOTP_HEALTHCHECK_RETRIES", "0"),
            ("LINOTP_LOG_FORMAT", "xml"),
        ];
        for (key, value) in cases {
            let result = StartupConfig::from_vars("LINOTP", vars(&[(key, value)]));
            assert!(
                matches!(result, Err(ConfigError::Invalid { .. })),
                "{key}={value}"
            );
        }
    }

    #[test]
    fn test_empty_values_are_unset() {
        let config = StartupConfig::from_vars(
            "LINOTP",
            vars(&[("LINOTP_DB_WAITTIME", ""), ("LINOTP_ADMIN_PASSWORD", "  ")]),
        )
        .unwrap();
        assert_eq!(config.db_waittime, Duration::from_secs(30));
        assert!(config.admin_password.is_none());
    }

    #[test]
    fn test_custom_links_and_listen() {
        let config = StartupConfig::from_vars(
            "LINOTP",
            vars(&[
                ("LINOTP_APP_DIR", "/opt/app"),
                ("LINOTP_SERVER_LISTEN", "0.0.0.0:8080"),
            ]),
        )
        .unwrap();
        assert_eq!(
            config.custom_links()[0],
            (
                PathBuf::from("/opt/app/templates/custom"),
                PathBuf::from("/etc/linotp/custom-templates")
            )
        );
        assert_eq!(config.healthcheck_url, "http://127.0.0.1:8080/healthcheck/status");
    }

    #[test]
    fn test_health_errors_name_the_prefixed_setting() {
        let result = StartupConfig::from_vars("ACME", vars(&[("ACME_HEALTHCHECK_TIMEOUT", "0")]));
        assert!(
            matches!(result, Err(ConfigError::Invalid { ref key, .. }) if key == "ACME_HEALTHCHECK_TIMEOUT"),
            "{result:?}"
        );
    }

    #[test]
    fn test_server_path_defaults_to_safe_path() {
        let bare = StartupConfig::from_vars("LINOTP", vars(&[])).unwrap();
        assert_eq!(bare.launch_spec().env.get("PATH").map(String::as_str), Some(SAFE_PATH));

        let inherited =
            StartupConfig::from_vars("LINOTP", vars(&[("PATH", "/opt/linotp/bin:/usr/bin")])).unwrap();
        assert_eq!(
            inherited.launch_spec().env.get("PATH").map(String::as_str),
            Some("/opt/linotp/bin:/usr/bin")
        );
    }

    #[test]
    fn test_layout_includes_every_link_target() {
        let config = StartupConfig::from_vars("LINOTP", vars(&[])).unwrap();
        let dirs = config.persisted_dirs();
        for (_, target) in config.custom_links() {
            assert!(dirs.contains(&target.as_path()), "{}", target.display());
        }
        assert_eq!(dirs.len(), 6);
    }
}
