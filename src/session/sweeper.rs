//! Background tiered sweep task.
//!
//! Drives [`SessionManager::run_sweep`] on a fixed interval until the
//! cancellation token fires. Single-flight is guaranteed twice over: the
//! loop awaits each pass, and the manager refuses to re-enter a pass
//! already in flight.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::session::manager::SessionManager;

/// Spawn the periodic sweep task.
#[must_use]
pub fn spawn_sweeper(
    manager: Arc<SessionManager>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("session sweeper shutting down");
                    break;
                }
                () = tokio::time::sleep(interval) => {}
            }

            let _ = manager.run_sweep().await;
        }
    })
}
