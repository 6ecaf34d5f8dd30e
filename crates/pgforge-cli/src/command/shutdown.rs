//! Signal-driven cancellation.

use tokio_util::sync::CancellationToken;

use crate::TRACING_TARGET_SHUTDOWN;

/// Cancels `token` on SIGINT or SIGTERM.
///
/// The orchestrator observes the token between steps, so a step that is
/// already running completes before the command returns. The watcher exits
/// on its own once the token is cancelled.
pub fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            signal = wait_for_signal() => {
                tracing::warn!(
                    target: TRACING_TARGET_SHUTDOWN,
                    signal,
                    "Stopping after the step in progress"
                );
                token.cancel();
            }
            () = token.cancelled() => {}
        }
    });
}

/// Resolves with the name of the first termination signal received.
#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    let mut streams = match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
        (Ok(interrupt), Ok(terminate)) => (interrupt, terminate),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!(
                target: TRACING_TARGET_SHUTDOWN,
                error = %e,
                "Could not install signal handlers, cancellation is disabled"
            );
            return std::future::pending().await;
        }
    };

    tokio::select! {
        _ = streams.0.recv() => "SIGINT",
        _ = streams.1.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(
            target: TRACING_TARGET_SHUTDOWN,
            error = %e,
            "Could not install Ctrl+C handler, cancellation is disabled"
        );
        return std::future::pending().await;
    }
    "Ctrl+C"
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn watcher_stops_with_token() {
        let token = CancellationToken::new();
        cancel_on_signal(token.clone());
        token.cancel();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(token.is_cancelled());
    }
}
