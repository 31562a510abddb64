//! Signal handling for the relay process.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::{info, warn};

/// Global shutdown flag
pub static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

#[inline]
pub fn is_shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

fn request_shutdown(shutdown_tx: &watch::Sender<bool>) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    shutdown_tx.send_replace(true);
}

/// Resolve once SIGTERM or SIGINT arrives, flagging shutdown for every
/// receiver of `shutdown_tx`.
#[cfg(unix)]
pub async fn wait_for_signal(shutdown_tx: watch::Sender<bool>) -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!(target: "relay::shutdown", "SIGTERM received, initiating graceful shutdown");
        }
        _ = sigint.recv() => {
            info!(target: "relay::shutdown", "SIGINT received, initiating graceful shutdown");
        }
    }

    request_shutdown(&shutdown_tx);
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_signal(shutdown_tx: watch::Sender<bool>) -> std::io::Result<()> {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(target: "relay::shutdown", error = %e, "Failed to listen for Ctrl+C");
        return Err(e);
    }

    info!(target: "relay::shutdown", "Ctrl+C received, initiating graceful shutdown");
    request_shutdown(&shutdown_tx);
    Ok(())
}

/// Log how long the consumer took to stop.
pub fn log_stopped(elapsed: std::time::Duration, budget: std::time::Duration) {
    if elapsed > budget {
        warn!(
            target: "relay::shutdown",
            elapsed_ms = elapsed.as_millis(),
            budget_ms = budget.as_millis(),
            "Consumer shutdown exceeded its budget, in-flight work was dropped"
        );
    } else {
        info!(
            target: "relay::shutdown",
            elapsed_ms = elapsed.as_millis(),
            "Consumer stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shutdown() {
        let (tx, rx) = watch::channel(false);
        SHUTDOWN_REQUESTED.store(false, Ordering::SeqCst);
        assert!(!is_shutdown_requested());

        request_shutdown(&tx);
        assert!(is_shutdown_requested());
        assert!(*rx.borrow());

        SHUTDOWN_REQUESTED.store(false, Ordering::SeqCst);
    }
}
