use tokio::signal;
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Cancels `token` on the first SIGINT/SIGTERM and exits the process on the
/// second, for operators who do not want to wait out an in-flight upload.
pub fn spawn_signal_listener(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            error!(error = %e, "Failed to install signal handlers");
            return;
        }
        info!("Shutdown signal received, finishing current work");
        token.cancel();

        if wait_for_signal().await.is_ok() {
            warn!("Second shutdown signal received, exiting immediately");
            std::process::exit(130);
        }
    })
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    let mut terminate = unix_signal(SignalKind::terminate())?;
    tokio::select! {
        result = signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    signal::ctrl_c().await
}
