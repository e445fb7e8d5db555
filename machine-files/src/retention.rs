//! Retention sweeper.
//!
//! When `storage.retention` is configured, a background task periodically deletes records whose
//! upload is older than the retention period.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::storage::{BlobStore, StorageError};

/// Delete every record uploaded more than `retention` ago. Returns how many were removed.
///
/// Each candidate is re-read right before deletion, so a record replaced since the listing is
/// kept.
pub async fn sweep_expired(store: &dyn BlobStore, retention: Duration) -> Result<usize, StorageError> {
    let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
    let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
        return Ok(0);
    };

    let mut removed = 0;
    for listed in store.list().await? {
        if listed.uploaded_at >= cutoff {
            continue;
        }

        match store.head(&listed.machine_id).await {
            Ok(current) if current.uploaded_at < cutoff => {}
            Ok(_) | Err(StorageError::NotFound) => continue,
            Err(e) => {
                warn!(machine_id = %listed.machine_id, error = %e, "Skipping unreadable record during retention sweep");
                continue;
            }
        }

        if store.delete(&listed.machine_id).await? {
            debug!(machine_id = %listed.machine_id, uploaded_at = %listed.uploaded_at, "Evicted expired file");
            removed += 1;
        }
    }

    Ok(removed)
}

/// Run [`sweep_expired`] every `interval` until `shutdown` is cancelled.
pub async fn run_retention_sweeper(
    store: Arc<dyn BlobStore>,
    retention: Duration,
    interval: Duration,
    shutdown: CancellationToken,
) {
    info!(?retention, ?interval, "Starting retention sweeper");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Retention sweeper shutting down");
                break;
            }
            _ = ticker.tick() => {
                match sweep_expired(store.as_ref(), retention).await {
                    Ok(0) => debug!("Retention sweep found nothing to evict"),
                    Ok(removed) => info!(removed, "Retention sweep evicted expired files"),
                    Err(e) => warn!(error = %e, "Retention sweep failed"),
                }
            }
        }
    }
}
