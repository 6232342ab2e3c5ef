//! Background session expiry sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::session_registry::SessionRegistry;

/// Spawn a task that runs [`SessionRegistry::expire_sweep`] every
/// `interval` until `cancel` fires.
///
/// The first sweep runs immediately.
#[must_use]
pub fn spawn_expiry_task(
    registry: Arc<SessionRegistry>,
    interval: Duration,
    timeout_hours: u64,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("session expiry task shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = registry.expire_sweep(timeout_hours).await {
                        error!(%err, "session expiry sweep failed");
                    }
                }
            }
        }
    })
}
