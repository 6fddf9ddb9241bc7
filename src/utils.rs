//! Process signal handling for graceful shutdown.

use std::future::Future;

use tokio::signal;
use tracing::{error, warn};

use crate::state::AppState;

/// Signal that ended the serve loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownTrigger {
    CtrlC,
    Terminate,
}

impl std::fmt::Display for ShutdownTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownTrigger::CtrlC => write!(f, "Ctrl+C"),
            ShutdownTrigger::Terminate => write!(f, "SIGTERM"),
        }
    }
}

/// Wait for Ctrl+C or SIGTERM.
///
/// A handler that cannot be installed never fires; the other one still does.
pub async fn wait_for_signal() -> ShutdownTrigger {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => ShutdownTrigger::CtrlC,
        _ = terminate => ShutdownTrigger::Terminate,
    }
}

/// Graceful-shutdown future for `axum::serve`.
///
/// Once `trigger` fires the state is marked as shutting down, so `/ready`
/// answers 503 while in-flight requests drain and background tasks stop.
pub async fn shutdown_on<F>(trigger: F, state: AppState)
where
    F: Future<Output = ShutdownTrigger>,
{
    let trigger = trigger.await;
    warn!(signal = %trigger, "Shutdown requested, draining connections");
    state.begin_shutdown();
}

/// [`shutdown_on`] driven by process signals.
pub async fn shutdown_signal(state: AppState) {
    shutdown_on(wait_for_signal(), state).await;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn test_trigger_marks_state_unready() {
        let state = AppState::new(Config::default()).await.unwrap();
        assert!(!state.is_shutting_down());

        shutdown_on(async { ShutdownTrigger::Terminate }, state.clone()).await;
        assert!(state.is_shutting_down());
        state.shutdown().await;
    }

    #[test]
    fn test_trigger_display() {
        assert_eq!(ShutdownTrigger::CtrlC.to_string(), "Ctrl+C");
        assert_eq!(ShutdownTrigger::Terminate.to_string(), "SIGTERM");
    }
}
