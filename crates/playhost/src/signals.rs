//! Signal handling for graceful shutdown.

use tokio::signal;
use tracing::{error, info};

/// Resolves once a termination signal arrives (SIGINT or SIGTERM on Unix,
/// Ctrl+C on Windows).
///
/// Failure to install a handler is logged and treated as an immediate
/// shutdown request, so the host never runs without a way to stop it.
pub async fn shutdown_signal() {
    if let Err(err) = wait_for_signal().await {
        error!("❌ Failed to install signal handlers: {}", err);
    }
}

async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("📡 Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("📡 Received SIGTERM");
            }
        }
    }

    #[cfg(windows)]
    {
        signal::ctrl_c().await?;
        info!("📡 Received Ctrl+C");
    }

    Ok(())
}
