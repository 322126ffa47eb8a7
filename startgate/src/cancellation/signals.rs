//! Termination signals during startup.

use super::CancellationToken;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Cancels `token` on the first SIGTERM or SIGINT.
///
/// The token is only consulted up to the server handoff. After an exec the
/// handlers are gone; a supervised server gets its signals forwarded by the
/// launcher, whatever this task does.
pub fn cancel_on_termination(token: Arc<CancellationToken>) -> std::io::Result<JoinHandle<()>> {
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;

    Ok(tokio::spawn(async move {
        let reason = tokio::select! {
            _ = term.recv() => "SIGTERM",
            _ = int.recv() => "SIGINT",
        };
        if token.cancel(reason) {
            info!(signal = reason, "Termination requested during startup");
        } else {
            warn!(signal = reason, "Received signal after cancellation");
        }
    }))
}
