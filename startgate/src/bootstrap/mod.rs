//! Bootstrap orchestrator.
//!
//! The fixed startup sequence of the container: CA trust material, the
//! persisted layout, custom directory links, the readiness gate, optional
//! one-time provisioning, the privilege drop and finally the handoff to the
//! server process.

mod actions;
mod context;
mod orchestrator;

pub use actions::{
    certificate_actions, layout_actions, provisioning_actions, symlink_actions, ActionOutcome,
    BootstrapAction, CreateAdminUser, EnsureDirectories, InstallCaCertificates,
    LinkCustomDirectory, ProvisioningCommand,
};
pub use context::{BootstrapContext, IdentityResolver, ServiceIdentity, SystemIdentities};
pub use orchestrator::{BootstrapOrchestrator, StartupFlags};
