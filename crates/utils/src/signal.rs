use tokio::signal::unix::{signal, SignalKind};

/// Resolves once the process receives SIGINT or SIGTERM.
///
/// If the handlers cannot be installed this never resolves, so callers
/// racing it against real work are unaffected.
pub async fn wait_for_interrupt() {
    let (Ok(mut int), Ok(mut term)) = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) else {
        tracing::debug!("Failed to install signal handlers");
        return std::future::pending().await;
    };
    tokio::select! {
        _ = int.recv() => tracing::debug!("Got SIGINT"),
        _ = term.recv() => tracing::debug!("Got SIGTERM"),
    }
}
