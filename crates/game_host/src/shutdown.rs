//! Graceful shutdown handling
//!
//! The HTTP server stops accepting first; afterwards every project is closed
//! so plugins see `on_deactivate` in reverse activation order.

use std::future::Future;
use std::time::Duration;

use plugin_runtime::{ProjectRegistry, SYSTEM_ACTOR};
use tokio::sync::oneshot;
use tracing::{info, warn};

/// Upper bound on closing all projects during shutdown.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Fires the returned receiver once `signal` completes.
///
/// The receiver also resolves (with an error) if the watcher task is dropped,
/// which callers treat as a shutdown request too.
pub fn on_signal<F>(signal: F) -> oneshot::Receiver<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        signal.await;
        let _ = tx.send(());
    });
    rx
}

/// Closes every open project. Returns `false` if `timeout` elapsed first.
pub async fn close_projects(registry: &ProjectRegistry, timeout: Duration) -> bool {
    let open = registry.open_count().await;
    info!("🛑 Closing {} project(s)", open);
    match tokio::time::timeout(timeout, registry.close_all(SYSTEM_ACTOR)).await {
        Ok(()) => {
            info!("✅ All projects closed");
            true
        }
        Err(_) => {
            warn!(timeout_secs = timeout.as_secs(), "⚠️ Projects still closing when the drain timeout elapsed");
            false
        }
    }
}
