//! The privilege transition gate.

use super::rules::{AllowList, PrivilegedCommand, ROOT};
use crate::errors::PrivilegeError;
use crate::events::EventSink;
use crate::process::{CommandExecutor, ExecOutput, ExecRequest};
use std::sync::Arc;
use tracing::{info, warn};

/// Runs allow-listed commands as root on behalf of a less privileged caller.
///
/// The table is checked on every call. Denied calls never reach the
/// executor.
#[derive(Clone)]
pub struct PrivilegeGate {
    allow_list: Arc<AllowList>,
    executor: Arc<dyn CommandExecutor>,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for PrivilegeGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivilegeGate")
            .field("rules", &self.allow_list.len())
            .finish_non_exhaustive()
    }
}

impl PrivilegeGate {
    /// Creates a gate.
    #[must_use]
    pub fn new(
        allow_list: Arc<AllowList>,
        executor: Arc<dyn CommandExecutor>,
        event_sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            allow_list,
            executor,
            event_sink,
        }
    }

    /// Returns the allow-list.
    #[must_use]
    pub fn allow_list(&self) -> &AllowList {
        &self.allow_list
    }

    /// Runs `command` as root if `invoker` is permitted to.
    ///
    /// The command runs without a shell and with a scrubbed environment.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` if no rule matches, `Execution` if the command
    /// cannot be started, `NonZeroExit` if it fails.
    pub async fn run_as_root(
        &self,
        invoker: &str,
        command: &PrivilegedCommand,
    ) -> Result<ExecOutput, PrivilegeError> {
        let rendered = command.to_string();

        if self.allow_list.permits(invoker, ROOT, command).is_none() {
            warn!(invoker = %invoker, command = %rendered, "Privileged command denied");
            self.event_sink.try_emit(
                "privilege.denied",
                Some(serde_json::json!({
                    "invoker": invoker,
                    "target": ROOT,
                    "command": &rendered,
                })),
            );
            return Err(PrivilegeError::PermissionDenied {
                invoker: invoker.to_string(),
                target: ROOT.to_string(),
                command: rendered,
            });
        }

        info!(invoker = %invoker, command = %rendered, "Running privileged command");
        self.event_sink.try_emit(
            "privilege.invoked",
            Some(serde_json::json!({"invoker": invoker, "command": &rendered})),
        );

        let request = ExecRequest::new(&command.program)
            .with_args(command.args.iter().cloned())
            .with_env("LANG", "C.UTF-8")
            .as_identity(0, 0);

        let output = self
            .executor
            .run(&request)
            .await
            .map_err(|e| PrivilegeError::Execution {
                command: rendered.clone(),
                reason: e.to_string(),
            })?;

        if !output.success() {
            self.event_sink.try_emit(
                "privilege.failed",
                Some(serde_json::json!({"command": &rendered, "code": output.code})),
            );
            return Err(PrivilegeError::NonZeroExit {
                command: rendered,
                code: output.code,
                stderr: output.stderr,
            });
        }

        self.event_sink.try_emit(
            "privilege.completed",
            Some(serde_json::json!({"command": &rendered})),
        );
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::privilege::rules::{ArgPattern, PrivilegeRule};
    use crate::process::MockCommandExecutor;

    fn gate(executor: MockCommandExecutor, sink: Arc<CollectingEventSink>) -> PrivilegeGate {
        PrivilegeGate::new(Arc::new(AllowList::default_for("linotp")), Arc::new(executor), sink)
    }

    #[tokio::test]
    async fn test_denied_commands_never_execute() {
        let mut executor = MockCommandExecutor::new();
        executor.expect_run().times(0);
        let sink = Arc::new(CollectingEventSink::new());
        let gate = gate(executor, sink.clone());

        let denied = [
            PrivilegedCommand::new("rm", ["-rf", "/"]),
            PrivilegedCommand::new("update-ca-certificates", ["--fresh"]),
            PrivilegedCommand::new("sudo", ["update-ca-certificates"]),
            PrivilegedCommand::new("sh", ["-c", "update-ca-certificates"]),
        ];
        for command in &denied {
            let err = gate.run_as_root("linotp", command).await.unwrap_err();
            assert!(err.is_denial(), "{command}");
        }
        assert_eq!(sink.events_of_type("privilege.denied").len(), denied.len());
    }

    #[tokio::test]
    async fn test_permitted_command_runs_as_root_with_scrubbed_env() {
        let mut executor = MockCommandExecutor::new();
        executor
            .expect_run()
            .withf(|req| {
                req.program == "update-ca-certificates"
                    && req.args.is_empty()
                    && req.uid == Some(0)
                    && req.env.keys().eq(["LANG"])
            })
            .times(1)
            .returning(|_| Ok(ExecOutput::ok("1 added, 0 removed")));
        let sink = Arc::new(CollectingEventSink::new());
        let gate = gate(executor, sink.clone());

        let out = gate
            .run_as_root("linotp", &PrivilegedCommand::new("update-ca-certificates", Vec::<String>::new()))
            .await
            .unwrap();
        assert_eq!(out.stdout, "1 added, 0 removed");
        assert_eq!(
            sink.event_types(),
            vec!["privilege.invoked", "privilege.completed"]
        );
    }

    #[tokio::test]
    async fn test_failing_command_reports_exit() {
        let mut executor = MockCommandExecutor::new();
        executor
            .expect_run()
            .returning(|_| Ok(ExecOutput::failed(2, "bad certificate")));
        let list = AllowList::new(vec![PrivilegeRule::new(
            "linotp",
            ROOT,
            "update-ca-certificates",
            vec![ArgPattern::literal("--fresh")],
        )])
        .unwrap();
        let gate = PrivilegeGate::new(
            Arc::new(list),
            Arc::new(executor),
            Arc::new(CollectingEventSink::new()),
        );

        let err = gate
            .run_as_root("linotp", &PrivilegedCommand::new("update-ca-certificates", ["--fresh"]))
            .await
            .unwrap_err();
        assert!(matches!(err, PrivilegeError::NonZeroExit { code: Some(2), .. }));
        assert!(!err.is_denial());
    }
}
