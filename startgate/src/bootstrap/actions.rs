//! Idempotent bootstrap actions.
//!
//! Every action can tell whether its work is already done. Running an
//! action whose predicate holds is a no-op, so the whole sequence is safe to
//! repeat on every container start against the same volumes.

use super::context::BootstrapContext;
use crate::config::StartupConfig;
use crate::core::PrivilegeLevel;
use crate::errors::BootstrapError;
use crate::privilege::PrivilegedCommand;
use crate::process::ExecRequest;
use async_trait::async_trait;
use nix::unistd::{chown, Gid, Uid};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// What running an action did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The action changed something.
    Applied,
    /// Nothing to do.
    AlreadySatisfied,
}

impl ActionOutcome {
    /// Stable name for events.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::AlreadySatisfied => "already_satisfied",
        }
    }
}

/// One provisioning step.
#[async_trait]
pub trait BootstrapAction: Send + Sync + Debug {
    /// Action name, e.g. `install-ca-certificates`.
    fn name(&self) -> &str;

    /// Privilege the action needs.
    fn privilege(&self) -> PrivilegeLevel;

    /// Returns true if the action's effect is already in place.
    async fn is_satisfied(&self, ctx: &BootstrapContext) -> Result<bool, BootstrapError>;

    /// Performs the action.
    async fn apply(&self, ctx: &BootstrapContext) -> Result<(), BootstrapError>;

    /// Applies the action unless it is already satisfied.
    async fn run(&self, ctx: &BootstrapContext) -> Result<ActionOutcome, BootstrapError> {
        if self.is_satisfied(ctx).await? {
            debug!(action = self.name(), "Already satisfied");
            return Ok(ActionOutcome::AlreadySatisfied);
        }
        self.apply(ctx).await?;
        info!(action = self.name(), privilege = %self.privilege(), "Applied");
        Ok(ActionOutcome::Applied)
    }
}

/// Copies mounted `.crt`/`.pem` files into the system trust store and
/// refreshes it through the privilege gate.
///
/// Store entries without a mounted source are removed. `update-ca-certificates`
/// only runs when the store actually changed. A missing source directory
/// means there is nothing to install.
#[derive(Debug, Clone)]
pub struct InstallCaCertificates {
    source: PathBuf,
    store: PathBuf,
}

#[derive(Debug, Default)]
struct CertificatePlan {
    copy: Vec<(PathBuf, PathBuf)>,
    stale: Vec<PathBuf>,
}

impl CertificatePlan {
    fn is_empty(&self) -> bool {
        self.copy.is_empty() && self.stale.is_empty()
    }
}

impl InstallCaCertificates {
    const NAME: &'static str = "install-ca-certificates";

    /// Creates the action.
    #[must_use]
    pub fn new(source: impl Into<PathBuf>, store: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            store: store.into(),
        }
    }

    fn plan(&self) -> Result<CertificatePlan, BootstrapError> {
        if !self.source.is_dir() {
            debug!(source = %self.source.display(), "No mounted CA certificates");
            return Ok(CertificatePlan::default());
        }

        let mut wanted: BTreeMap<String, PathBuf> = BTreeMap::new();
        for entry in WalkDir::new(&self.source)
            .min_depth(1)
            .max_depth(1)
            .follow_links(true)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| BootstrapError::action(Self::NAME, e.to_string()))?;
            let path = entry.path();
            let is_cert = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("crt") || e.eq_ignore_ascii_case("pem"));
            if !entry.file_type().is_file() || !is_cert {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some(previous) = wanted.insert(format!("{stem}.crt"), path.to_path_buf()) {
                warn!(
                    kept = %path.display(),
                    ignored = %previous.display(),
                    "Two mounted certificates map to the same store name"
                );
            }
        }

        let mut plan = CertificatePlan::default();
        for (name, src) in &wanted {
            let dest = self.store.join(name);
            let source_bytes = fs::read(src).map_err(|e| BootstrapError::io(Self::NAME, src, e))?;
            match fs::read(&dest) {
                Ok(existing) if existing == source_bytes => {}
                Ok(_) => plan.copy.push((src.clone(), dest)),
                Err(e) if e.kind() == ErrorKind::NotFound => plan.copy.push((src.clone(), dest)),
                Err(e) => return Err(BootstrapError::io(Self::NAME, dest, e)),
            }
        }

        match fs::read_dir(&self.store) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry.map_err(|e| BootstrapError::io(Self::NAME, &self.store, e))?;
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if !wanted.contains_key(&name) {
                        plan.stale.push(entry.path());
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(BootstrapError::io(Self::NAME, &self.store, e)),
        }
        plan.stale.sort();
        Ok(plan)
    }
}

#[async_trait]
impl BootstrapAction for InstallCaCertificates {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn privilege(&self) -> PrivilegeLevel {
        PrivilegeLevel::Root
    }

    async fn is_satisfied(&self, _ctx: &BootstrapContext) -> Result<bool, BootstrapError> {
        Ok(self.plan()?.is_empty())
    }

    async fn apply(&self, ctx: &BootstrapContext) -> Result<(), BootstrapError> {
        let plan = self.plan()?;
        if plan.is_empty() {
            return Ok(());
        }

        fs::create_dir_all(&self.store).map_err(|e| BootstrapError::io(Self::NAME, &self.store, e))?;
        for (src, dest) in &plan.copy {
            fs::copy(src, dest).map_err(|e| BootstrapError::io(Self::NAME, dest, e))?;
            fs::set_permissions(dest, fs::Permissions::from_mode(0o644))
                .map_err(|e| BootstrapError::io(Self::NAME, dest, e))?;
            debug!(certificate = %dest.display(), "Installed certificate");
        }
        for stale in &plan.stale {
            fs::remove_file(stale).map_err(|e| BootstrapError::io(Self::NAME, stale, e))?;
            debug!(certificate = %stale.display(), "Removed stale certificate");
        }
        info!(
            added = plan.copy.len(),
            removed = plan.stale.len(),
            "Refreshing CA trust store"
        );

        let refresh = PrivilegedCommand::new("update-ca-certificates", Vec::<String>::new());
        ctx.privilege.run_as_root(&ctx.current.name, &refresh).await?;
        Ok(())
    }
}

/// Creates the persisted directories. When running as root they are also
/// handed to the service identity.
#[derive(Debug, Clone)]
pub struct EnsureDirectories {
    dirs: Vec<PathBuf>,
}

impl EnsureDirectories {
    const NAME: &'static str = "ensure-directories";

    /// Creates the action.
    #[must_use]
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }
}

#[async_trait]
impl BootstrapAction for EnsureDirectories {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn privilege(&self) -> PrivilegeLevel {
        PrivilegeLevel::Root
    }

    async fn is_satisfied(&self, ctx: &BootstrapContext) -> Result<bool, BootstrapError> {
        let owner = if ctx.is_root() {
            Some(ctx.service_identity()?.uid)
        } else {
            None
        };

        for dir in &self.dirs {
            match fs::metadata(dir) {
                Ok(meta) if !meta.is_dir() => {
                    return Err(BootstrapError::action(
                        Self::NAME,
                        format!("{} exists and is not a directory", dir.display()),
                    ))
                }
                Ok(meta) => {
                    if owner.is_some_and(|uid| meta.uid() != uid) {
                        return Ok(false);
                    }
                }
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
                Err(e) => return Err(BootstrapError::io(Self::NAME, dir, e)),
            }
        }
        Ok(true)
    }

    async fn apply(&self, ctx: &BootstrapContext) -> Result<(), BootstrapError> {
        let owner = if ctx.is_root() {
            Some(ctx.service_identity()?)
        } else {
            None
        };

        for dir in &self.dirs {
            fs::create_dir_all(dir).map_err(|e| BootstrapError::io(Self::NAME, dir, e))?;
            if let Some(owner) = &owner {
                chown(
                    dir.as_path(),
                    Some(Uid::from_raw(owner.uid)),
                    Some(Gid::from_raw(owner.gid)),
                )
                .map_err(|e| BootstrapError::io(Self::NAME, dir, e.into()))?;
            }
        }
        Ok(())
    }
}

/// Links an operator-provided directory into the application tree.
///
/// An existing path at the link location is never replaced, whatever it is.
/// If the custom directory itself is absent there is nothing to link.
#[derive(Debug, Clone)]
pub struct LinkCustomDirectory {
    link: PathBuf,
    target: PathBuf,
}

impl LinkCustomDirectory {
    const NAME: &'static str = "link-custom-directory";

    /// Creates the action: `link` will point at `target`.
    #[must_use]
    pub fn new(link: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            link: link.into(),
            target: target.into(),
        }
    }
}

#[async_trait]
impl BootstrapAction for LinkCustomDirectory {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn privilege(&self) -> PrivilegeLevel {
        PrivilegeLevel::Root
    }

    async fn is_satisfied(&self, _ctx: &BootstrapContext) -> Result<bool, BootstrapError> {
        match fs::symlink_metadata(&self.link) {
            Ok(meta) if meta.file_type().is_symlink() => {
                let current = fs::read_link(&self.link)
                    .map_err(|e| BootstrapError::io(Self::NAME, &self.link, e))?;
                if current != self.target {
                    warn!(
                        link = %self.link.display(),
                        points_to = %current.display(),
                        expected = %self.target.display(),
                        "Existing link points elsewhere, leaving it"
                    );
                }
                Ok(true)
            }
            Ok(_) => {
                warn!(link = %self.link.display(), "Path exists and is not a link, leaving it");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if self.target.is_dir() {
                    Ok(false)
                } else {
                    debug!(target = %self.target.display(), "No custom directory to link");
                    Ok(true)
                }
            }
            Err(e) => Err(BootstrapError::io(Self::NAME, &self.link, e)),
        }
    }

    async fn apply(&self, _ctx: &BootstrapContext) -> Result<(), BootstrapError> {
        if let Some(parent) = self.link.parent() {
            fs::create_dir_all(parent).map_err(|e| BootstrapError::io(Self::NAME, parent, e))?;
        }
        match std::os::unix::fs::symlink(&self.target, &self.link) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(BootstrapError::io(Self::NAME, &self.link, e)),
        }
    }
}

async fn run_server_cli(
    ctx: &BootstrapContext,
    action: &str,
    request: &ExecRequest,
) -> Result<String, BootstrapError> {
    let output = ctx
        .executor
        .run(request)
        .await
        .map_err(|e| BootstrapError::action(action, format!("{request}: {e}")))?;
    if !output.success() {
        let status = output
            .code
            .map_or_else(|| "signal".to_string(), |c| c.to_string());
        return Err(BootstrapError::action(
            action,
            format!("{request} exited with {status}: {}", output.stderr.trim()),
        ));
    }
    Ok(output.stdout)
}

/// A server CLI command run as the service identity, skipped when its
/// marker file exists.
#[derive(Debug, Clone)]
pub struct ProvisioningCommand {
    name: String,
    args: Vec<String>,
    marker: Option<PathBuf>,
}

impl ProvisioningCommand {
    /// Creates the action.
    #[must_use]
    pub fn new(name: impl Into<String>, args: &[&str], marker: Option<PathBuf>) -> Self {
        Self {
            name: name.into(),
            args: args.iter().map(|a| (*a).to_string()).collect(),
            marker,
        }
    }

    /// `init database`. Creating missing tables is idempotent in the server.
    #[must_use]
    pub fn init_database() -> Self {
        Self::new("init-database", &["init", "database"], None)
    }

    /// `init enc-key`, skipped if the key file exists.
    #[must_use]
    pub fn init_enc_key(root_dir: &Path) -> Self {
        Self::new("init-enc-key", &["init", "enc-key"], Some(root_dir.join("encKey")))
    }

    /// `init audit-keys`, skipped if the private key exists.
    #[must_use]
    pub fn init_audit_keys(root_dir: &Path) -> Self {
        Self::new(
            "init-audit-keys",
            &["init", "audit-keys"],
            Some(root_dir.join("audit-private.pem")),
        )
    }
}

#[async_trait]
impl BootstrapAction for ProvisioningCommand {
    fn name(&self) -> &str {
        &self.name
    }

    fn privilege(&self) -> PrivilegeLevel {
        PrivilegeLevel::Service
    }

    async fn is_satisfied(&self, _ctx: &BootstrapContext) -> Result<bool, BootstrapError> {
        Ok(self.marker.as_ref().is_some_and(|m| m.exists()))
    }

    async fn apply(&self, ctx: &BootstrapContext) -> Result<(), BootstrapError> {
        let request = ctx.server_cli(self.args.iter().cloned())?;
        run_server_cli(ctx, &self.name, &request).await?;
        Ok(())
    }
}

/// Creates the initial administrator, unless one with that name exists.
///
/// The password reaches the server CLI through its environment only.
#[derive(Debug, Clone)]
pub struct CreateAdminUser {
    user: String,
}

impl CreateAdminUser {
    const NAME: &'static str = "create-admin-user";

    /// Creates the action.
    #[must_use]
    pub fn new(user: impl Into<String>) -> Self {
        Self { user: user.into() }
    }
}

#[async_trait]
impl BootstrapAction for CreateAdminUser {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn privilege(&self) -> PrivilegeLevel {
        PrivilegeLevel::Service
    }

    async fn is_satisfied(&self, ctx: &BootstrapContext) -> Result<bool, BootstrapError> {
        let list = ctx.server_cli(["local-admins", "list"])?;
        let stdout = run_server_cli(ctx, Self::NAME, &list).await?;
        Ok(stdout
            .lines()
            .any(|line| line.split_whitespace().next() == Some(self.user.as_str())))
    }

    async fn apply(&self, ctx: &BootstrapContext) -> Result<(), BootstrapError> {
        if ctx.config.admin_password.is_none() {
            return Err(BootstrapError::action(
                Self::NAME,
                format!("{} is not set", ctx.config.key("ADMIN_PASSWORD")),
            ));
        }
        let add = ctx.server_cli(["local-admins", "add", self.user.as_str()])?;
        run_server_cli(ctx, Self::NAME, &add).await?;
        let password = ctx.server_cli(["local-admins", "password", self.user.as_str()])?;
        run_server_cli(ctx, Self::NAME, &password).await?;
        Ok(())
    }
}

/// The actions of the CA certificate step.
#[must_use]
pub fn certificate_actions(config: &StartupConfig) -> Vec<Box<dyn BootstrapAction>> {
    vec![Box::new(InstallCaCertificates::new(
        config.ca_certificates_dir.clone(),
        config.ca_store_dir.clone(),
    ))]
}

/// The actions of the layout step.
#[must_use]
pub fn layout_actions(config: &StartupConfig) -> Vec<Box<dyn BootstrapAction>> {
    let dirs = config.persisted_dirs().into_iter().map(Path::to_path_buf).collect();
    vec![Box::new(EnsureDirectories::new(dirs))]
}

/// The actions of the symlink step.
#[must_use]
pub fn symlink_actions(config: &StartupConfig) -> Vec<Box<dyn BootstrapAction>> {
    config
        .custom_links()
        .into_iter()
        .map(|(link, target)| Box::new(LinkCustomDirectory::new(link, target)) as Box<dyn BootstrapAction>)
        .collect()
}

/// The one-time provisioning actions, in order.
#[must_use]
pub fn provisioning_actions(config: &StartupConfig) -> Vec<Box<dyn BootstrapAction>> {
    vec![
        Box::new(ProvisioningCommand::init_database()),
        Box::new(ProvisioningCommand::init_enc_key(&config.root_dir)),
        Box::new(ProvisioningCommand::init_audit_keys(&config.root_dir)),
        Box::new(CreateAdminUser::new(config.admin_user.clone())),
    ]
}
