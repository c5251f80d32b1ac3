//! Background tasks spawned by the server binary.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use greenops_store::JobStore;

/// Periodically drop expired jobs from stores without native TTL.
pub fn spawn_ttl_sweeper(
    store: Arc<dyn JobStore>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match store.purge_expired(Utc::now()).await {
                Ok(purged) => debug!(purged, backend = store.backend(), "TTL sweep done"),
                Err(e) => warn!(error = %e, "TTL sweep failed"),
            }
        }
    })
}
