//! Process termination signals.
//!
//! [`wait_for_shutdown_signal`] completes on the first of SIGINT, SIGTERM or
//! SIGQUIT (Unix), or Ctrl-C everywhere else. [`shutdown_signal`] wraps it in
//! the `()` future [`crate::Supervisor::run`] expects.

#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Resolve once a termination signal arrives.
///
/// If the handlers cannot be installed the error is logged and the future
/// never resolves, leaving [`crate::Supervisor::stop`] as the only way out.
pub async fn shutdown_signal() {
    match wait_for_shutdown_signal().await {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(e) => {
            tracing::error!(error = %e, "Failed to install signal handlers");
            std::future::pending::<()>().await;
        }
    }
}
