//! The fixed startup sequence.

use super::actions::{
    certificate_actions, layout_actions, provisioning_actions, symlink_actions, ActionOutcome,
    BootstrapAction,
};
use super::context::{BootstrapContext, IdentityResolver, ServiceIdentity, SystemIdentities};
use crate::cancellation::CancellationToken;
use crate::config::StartupConfig;
use crate::core::StartupStep;
use crate::errors::{ConfigError, StartgateError, StartupFailure};
use crate::events::{EventSink, LoggingEventSink};
use crate::observability::SpanTimer;
use crate::privilege::{AllowList, PrivilegeGate};
use crate::process::{
    CommandExecutor, LaunchOutcome, LaunchSpec, ProcessExecutor, ProcessLauncher, SystemLauncher,
};
use crate::readiness::{ConnectivityProbe, ReadinessCheck, ReadinessGate, TcpProbe};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Command-line switches of a startup run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartupFlags {
    /// Run one-time provisioning before handing off.
    pub with_bootstrap: bool,
}

/// Runs the startup steps in their fixed order and hands off to the server.
///
/// Each step blocks until done. The first failure aborts the sequence
/// before the server is started, and the returned [`StartupFailure`] names
/// the step so the caller can exit with that step's code.
pub struct BootstrapOrchestrator {
    config: Arc<StartupConfig>,
    executor: Arc<dyn CommandExecutor>,
    launcher: Arc<dyn ProcessLauncher>,
    probe: Arc<dyn ConnectivityProbe>,
    identities: Arc<dyn IdentityResolver>,
    allow_list: Arc<AllowList>,
    event_sink: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
}

impl std::fmt::Debug for BootstrapOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapOrchestrator")
            .field("config", &self.config)
            .field("allow_list", &self.allow_list.len())
            .finish_non_exhaustive()
    }
}

impl BootstrapOrchestrator {
    /// Creates an orchestrator with the system implementations of every seam.
    ///
    /// # Errors
    ///
    /// Returns the configuration error if the settings are inconsistent or
    /// no database is configured.
    pub fn for_config(config: Arc<StartupConfig>) -> Result<Self, ConfigError> {
        config.validate()?;
        config.require_database()?;
        let allow_list = Arc::new(AllowList::default_for(&config.service_user));
        Ok(Self {
            config,
            executor: Arc::new(ProcessExecutor),
            launcher: Arc::new(SystemLauncher),
            probe: Arc::new(TcpProbe),
            identities: Arc::new(SystemIdentities),
            allow_list,
            event_sink: Arc::new(LoggingEventSink::default()),
            cancel: Arc::new(CancellationToken::new()),
        })
    }

    /// Sets the command executor.
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Sets the server launcher.
    #[must_use]
    pub fn with_launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Sets the readiness probe.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Sets the identity resolver.
    #[must_use]
    pub fn with_identities(mut self, identities: Arc<dyn IdentityResolver>) -> Self {
        self.identities = identities;
        self
    }

    /// Replaces the privilege allow-list.
    #[must_use]
    pub fn with_allow_list(mut self, allow_list: Arc<AllowList>) -> Self {
        self.allow_list = allow_list;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Sets the token that aborts startup.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: Arc<CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    /// The settings this orchestrator runs with.
    #[must_use]
    pub fn config(&self) -> &StartupConfig {
        &self.config
    }

    /// Runs the whole sequence and launches the server.
    ///
    /// In exec mode a successful handoff never returns. In supervise mode
    /// this returns once the server has exited.
    ///
    /// # Errors
    ///
    /// The first failing step, wrapped with the step it happened in.
    pub async fn run_startup_sequence(&self, flags: StartupFlags) -> Result<LaunchOutcome, StartupFailure> {
        info!(with_bootstrap = flags.with_bootstrap, "Starting up");

        let current = self
            .identities
            .current()
            .map_err(|e| self.fail(StartupStep::PrivilegeDrop, e.into()))?;

        if flags.with_bootstrap && self.config.admin_password.is_none() {
            let missing = ConfigError::Missing(self.config.key("ADMIN_PASSWORD"));
            return Err(self.fail(StartupStep::Provisioning, missing.into()));
        }

        let ctx = self.context(current);
        let mut launch = self.config.launch_spec();
        let mut timer = SpanTimer::start(StartupStep::Handoff.as_str());

        for step in StartupStep::ALL {
            self.check_cancelled(step)?;

            if step == StartupStep::Provisioning && !flags.with_bootstrap {
                self.event_sink.try_emit(
                    "startup.step.skipped",
                    Some(json!({"step": step.as_str(), "reason": "bootstrap not requested"})),
                );
                continue;
            }

            self.event_sink
                .try_emit("startup.step.started", Some(json!({"step": step.as_str()})));
            timer = SpanTimer::start(step.as_str());

            let detail = match step {
                StartupStep::CaCertificates => self.run_actions(&ctx, certificate_actions(&self.config)).await,
                StartupStep::Layout => self.run_actions(&ctx, layout_actions(&self.config)).await,
                StartupStep::Symlinks => self.run_actions(&ctx, symlink_actions(&self.config)).await,
                StartupStep::Readiness => self.await_dependency().await,
                StartupStep::Provisioning => self.run_actions(&ctx, provisioning_actions(&self.config)).await,
                StartupStep::PrivilegeDrop => Self::drop_privileges(&ctx, &mut launch),
                StartupStep::Handoff => break,
            };

            let detail = detail.map_err(|e| self.fail(step, e))?;
            self.event_sink.try_emit(
                "startup.step.completed",
                Some(json!({
                    "step": step.as_str(),
                    "duration_ms": timer.elapsed_ms(),
                    "detail": detail,
                })),
            );
        }

        self.hand_off(launch, timer).await
    }

    /// Starts the server. In exec mode this only returns on failure.
    async fn hand_off(&self, launch: LaunchSpec, timer: SpanTimer) -> Result<LaunchOutcome, StartupFailure> {
        let step = StartupStep::Handoff;
        info!(command = %launch.command_line(), uid = ?launch.uid, mode = ?launch.mode, "Handing off to server");

        let outcome = self
            .launcher
            .launch(launch)
            .await
            .map_err(|e| self.fail(step, e.into()))?;
        self.event_sink.try_emit(
            "startup.step.completed",
            Some(json!({
                "step": step.as_str(),
                "duration_ms": timer.finish(),
                "outcome": format!("{outcome:?}"),
            })),
        );
        Ok(outcome)
    }

    fn check_cancelled(&self, step: StartupStep) -> Result<(), StartupFailure> {
        if !self.cancel.is_cancelled() {
            return Ok(());
        }
        let reason = self.cancel.reason_or_default();
        Err(self.fail(step, StartgateError::Cancelled(reason)))
    }

    fn context(&self, current: ServiceIdentity) -> BootstrapContext {
        BootstrapContext {
            config: self.config.clone(),
            executor: self.executor.clone(),
            privilege: PrivilegeGate::new(
                self.allow_list.clone(),
                self.executor.clone(),
                self.event_sink.clone(),
            ),
            identities: self.identities.clone(),
            event_sink: self.event_sink.clone(),
            cancel: self.cancel.clone(),
            current,
        }
    }

    async fn run_actions(
        &self,
        ctx: &BootstrapContext,
        actions: Vec<Box<dyn BootstrapAction>>,
    ) -> Result<serde_json::Value, StartgateError> {
        let mut applied = Vec::new();
        let mut satisfied = Vec::new();
        for action in actions {
            if self.cancel.is_cancelled() {
                return Err(StartgateError::Cancelled(
                    self.cancel.reason_or_default(),
                ));
            }
            match action.run(ctx).await? {
                ActionOutcome::Applied => applied.push(action.name().to_string()),
                ActionOutcome::AlreadySatisfied => satisfied.push(action.name().to_string()),
            }
        }
        Ok(json!({"applied": applied, "already_satisfied": satisfied}))
    }

    async fn await_dependency(&self) -> Result<serde_json::Value, StartgateError> {
        let target = self.config.require_database()?;
        let gate = ReadinessGate::new(self.probe.clone()).with_cancellation(self.cancel.clone());
        let mut check = ReadinessCheck::new(target.clone(), self.config.poll_policy());
        gate.run(&mut check).await?;
        Ok(json!({
            "target": target.to_string(),
            "attempts": check.attempts(),
            "elapsed_ms": u64::try_from(check.elapsed().as_millis()).unwrap_or(u64::MAX),
        }))
    }

    /// Points the launch at the service identity.
    ///
    /// Only root can switch identities; otherwise the server keeps running
    /// as the current user.
    fn drop_privileges(ctx: &BootstrapContext, launch: &mut LaunchSpec) -> Result<serde_json::Value, StartgateError> {
        if !ctx.is_root() {
            warn!(
                current = %ctx.current,
                service_user = %ctx.config.service_user,
                "Not running as root, server keeps the current identity"
            );
            return Ok(json!({"identity": ctx.current.name, "dropped": false}));
        }

        let service = ctx.service_identity()?;
        if service.is_root() {
            warn!(service_user = %ctx.config.service_user, "Service identity is root");
        }
        launch.uid = Some(service.uid);
        launch.gid = Some(service.gid);
        launch.env.insert("USER".to_string(), service.name.clone());
        launch.env.insert("LOGNAME".to_string(), service.name.clone());
        if let Some(home) = &service.home {
            launch.env.insert("HOME".to_string(), home.display().to_string());
        }
        info!(identity = %service, "Server will run as service identity");
        Ok(json!({"identity": service.name, "dropped": true}))
    }

    fn fail(&self, step: StartupStep, source: StartgateError) -> StartupFailure {
        let failure = StartupFailure::new(step, source);
        error!(step = %step, exit_code = failure.exit_code(), error = %failure.source, "Startup failed");
        self.event_sink.try_emit(
            "startup.step.failed",
            Some(json!({
                "step": step.as_str(),
                "error": failure.source.to_string(),
                "exit_code": failure.exit_code(),
            })),
        );
        failure
    }
}
