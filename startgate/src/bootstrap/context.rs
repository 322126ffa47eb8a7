//! Identities and the shared context bootstrap actions run in.

use crate::cancellation::CancellationToken;
use crate::config::StartupConfig;
use crate::errors::BootstrapError;
use crate::events::EventSink;
use crate::privilege::PrivilegeGate;
use crate::process::{CommandExecutor, ExecRequest};
use nix::unistd::{geteuid, User};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// A resolved Unix account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
    /// Account name.
    pub name: String,
    /// User id.
    pub uid: u32,
    /// Primary group id.
    pub gid: u32,
    /// Home directory, if known.
    pub home: Option<PathBuf>,
}

impl ServiceIdentity {
    /// Creates an identity.
    #[must_use]
    pub fn new(name: impl Into<String>, uid: u32, gid: u32) -> Self {
        Self {
            name: name.into(),
            uid,
            gid,
            home: None,
        }
    }

    /// The superuser.
    #[must_use]
    pub fn root() -> Self {
        Self::new("root", 0, 0)
    }

    /// Returns true for uid 0.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.name, self.uid, self.gid)
    }
}

/// Looks up accounts.
#[cfg_attr(test, mockall::automock)]
pub trait IdentityResolver: Send + Sync {
    /// The identity this process runs as.
    fn current(&self) -> Result<ServiceIdentity, BootstrapError>;

    /// The account called `name`.
    fn lookup(&self, name: &str) -> Result<ServiceIdentity, BootstrapError>;
}

/// Resolver backed by the system user database.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemIdentities;

impl SystemIdentities {
    fn from_user(user: User) -> ServiceIdentity {
        ServiceIdentity {
            name: user.name,
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            home: Some(user.dir),
        }
    }
}

impl IdentityResolver for SystemIdentities {
    fn current(&self) -> Result<ServiceIdentity, BootstrapError> {
        let uid = geteuid();
        match User::from_uid(uid) {
            Ok(Some(user)) => Ok(Self::from_user(user)),
            Ok(None) => Ok(ServiceIdentity::new(uid.to_string(), uid.as_raw(), nix::unistd::getegid().as_raw())),
            Err(e) => Err(BootstrapError::action("identity", format!("uid {uid}: {e}"))),
        }
    }

    fn lookup(&self, name: &str) -> Result<ServiceIdentity, BootstrapError> {
        match User::from_name(name) {
            Ok(Some(user)) => Ok(Self::from_user(user)),
            Ok(None) => Err(BootstrapError::UnknownUser(name.to_string())),
            Err(e) => Err(BootstrapError::action("identity", format!("{name}: {e}"))),
        }
    }
}

/// Everything a bootstrap action may use.
#[derive(Clone)]
pub struct BootstrapContext {
    /// Validated settings.
    pub config: Arc<StartupConfig>,
    /// Runs unprivileged commands.
    pub executor: Arc<dyn CommandExecutor>,
    /// Runs allow-listed root commands.
    pub privilege: PrivilegeGate,
    /// Account lookups.
    pub identities: Arc<dyn IdentityResolver>,
    /// Progress events.
    pub event_sink: Arc<dyn EventSink>,
    /// Aborts long-running actions.
    pub cancel: Arc<CancellationToken>,
    /// The identity the orchestrator runs as.
    pub current: ServiceIdentity,
}

impl fmt::Debug for BootstrapContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapContext")
            .field("current", &self.current)
            .field("service_user", &self.config.service_user)
            .finish_non_exhaustive()
    }
}

impl BootstrapContext {
    /// Returns true when the orchestrator runs as root.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.current.is_root()
    }

    /// The identity service-level work runs as: the configured service user
    /// when running as root, otherwise the current identity.
    pub fn service_identity(&self) -> Result<ServiceIdentity, BootstrapError> {
        if self.is_root() {
            self.identities.lookup(&self.config.service_user)
        } else {
            Ok(self.current.clone())
        }
    }

    /// A command of the server's own CLI (`<server program> args..`), run
    /// as the service identity with the provisioning environment.
    pub fn server_cli<I, S>(&self, args: I) -> Result<ExecRequest, BootstrapError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let program = self
            .config
            .server_command
            .first()
            .cloned()
            .ok_or_else(|| BootstrapError::action("server-cli", "server command is empty"))?;
        let mut request = ExecRequest::new(program)
            .with_args(args)
            .in_dir(self.config.root_dir.clone());
        request.env = self.config.provisioning_environment();
        if self.is_root() {
            let service = self.service_identity()?;
            request = request.as_identity(service.uid, service.gid);
        }
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoOpEventSink;
    use crate::privilege::AllowList;
    use crate::process::MockCommandExecutor;

    fn context(current: ServiceIdentity, identities: MockIdentityResolver) -> BootstrapContext {
        let executor: Arc<dyn CommandExecutor> = Arc::new(MockCommandExecutor::new());
        let sink: Arc<dyn EventSink> = Arc::new(NoOpEventSink);
        BootstrapContext {
            config: Arc::new(StartupConfig::default()),
            privilege: PrivilegeGate::new(
                Arc::new(AllowList::default_for("linotp")),
                executor.clone(),
                sink.clone(),
            ),
            executor,
            identities: Arc::new(identities),
            event_sink: sink,
            cancel: Arc::new(CancellationToken::new()),
            current,
        }
    }

    #[test]
    fn test_root_runs_server_cli_as_service_user() {
        let mut identities = MockIdentityResolver::new();
        identities
            .expect_lookup()
            .withf(|name| name == "linotp")
            .returning(|_| Ok(ServiceIdentity::new("linotp", 1000, 1000)));
        let ctx = context(ServiceIdentity::root(), identities);

        let request = ctx.server_cli(["init", "enc-key"]).unwrap();
        assert_eq!(request.to_string(), "linotp init enc-key");
        assert_eq!(request.uid, Some(1000));
        assert_eq!(request.gid, Some(1000));
        assert_eq!(request.cwd, Some(PathBuf::from("/var/lib/linotp")));
    }

    #[test]
    fn test_unprivileged_keeps_current_identity() {
        let mut identities = MockIdentityResolver::new();
        identities.expect_lookup().times(0);
        let ctx = context(ServiceIdentity::new("app", 1500, 1500), identities);

        assert_eq!(ctx.service_identity().unwrap().name, "app");
        assert_eq!(ctx.server_cli(["init", "database"]).unwrap().uid, None);
    }

    #[test]
    fn test_unknown_service_user() {
        let mut identities = MockIdentityResolver::new();
        identities
            .expect_lookup()
            .returning(|name| Err(BootstrapError::UnknownUser(name.to_string())));
        let ctx = context(ServiceIdentity::root(), identities);
        assert!(matches!(ctx.service_identity(), Err(BootstrapError::UnknownUser(u)) if u == "linotp"));
    }

    #[test]
    fn test_system_lookup_of_root() {
        let root = SystemIdentities.lookup("root").unwrap();
        assert!(root.is_root());
        assert!(matches!(
            SystemIdentities.lookup("no-such-user-startgate"),
            Err(BootstrapError::UnknownUser(_))
        ));
    }
}
