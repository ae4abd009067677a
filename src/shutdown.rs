use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Resolve with the name of the first SIGTERM or SIGINT. Falls back to
/// Ctrl-C when the unix handlers cannot be installed.
async fn next_signal() -> &'static str {
    match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(mut term), Ok(mut int)) => tokio::select! {
            _ = term.recv() => "SIGTERM",
            _ = int.recv() => "SIGINT",
        },
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!(error = %e, "Signal handlers unavailable, listening for Ctrl-C only");
            match tokio::signal::ctrl_c().await {
                Ok(()) => "Ctrl-C",
                Err(e) => {
                    tracing::error!(error = %e, "Failed to listen for Ctrl-C");
                    std::future::pending().await
                }
            }
        }
    }
}

/// Token cancelled on the first termination signal, which starts the orderly
/// stop of `role` (an agent drains its workers and purges its units first).
/// A second signal while that is in progress exits immediately.
pub fn cancel_on_signal(role: &'static str) -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();

    tokio::spawn(async move {
        let first = next_signal().await;
        tracing::info!(signal = first, role, "Stopping, send again to exit immediately");
        cancel.cancel();

        let second = next_signal().await;
        tracing::warn!(signal = second, role, "Second signal, exiting without cleanup");
        std::process::exit(130);
    });

    token
}

/// Wait for `tasks` to finish, aborting whatever is still running after
/// `grace`.
pub async fn drain(tasks: Vec<(&'static str, JoinHandle<()>)>, grace: Duration) {
    let deadline = tokio::time::Instant::now() + grace;
    for (name, mut handle) in tasks {
        match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(Ok(())) => tracing::debug!(task = name, "Task stopped"),
            Ok(Err(e)) => tracing::error!(task = name, error = %e, "Task failed"),
            Err(_) => {
                tracing::warn!(task = name, "Task did not stop in time, aborting");
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn drain_aborts_stragglers() {
        let quick = tokio::spawn(async {});
        let stuck = tokio::spawn(std::future::pending::<()>());
        let probe = stuck.abort_handle();

        drain(vec![("quick", quick), ("stuck", stuck)], Duration::from_secs(1)).await;
        for _ in 0..10 {
            if probe.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(probe.is_finished());
    }
}
