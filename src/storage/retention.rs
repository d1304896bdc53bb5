//! Telemetry retention
//!
//! Rows older than the configured retention are purged device by device on a
//! fixed interval.

use super::{DeviceRepository, StorageError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Delete every telemetry row stamped before `cutoff`
pub async fn purge_telemetry_before(
    repository: &dyn DeviceRepository,
    cutoff: DateTime<Utc>,
) -> Result<usize, StorageError> {
    let mut removed = 0;
    for device in repository.list_devices().await? {
        match repository.delete_telemetry_before(&device.id, cutoff).await {
            Ok(count) => removed += count,
            // Deleted since the listing; its rows went with it
            Err(StorageError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(removed)
}

/// Purge telemetry older than `retention` every `interval`, forever
///
/// The first sweep runs immediately. Abort the task to stop it.
pub async fn run_retention_sweep(
    repository: Arc<dyn DeviceRepository>,
    retention: Duration,
    interval: Duration,
) {
    let Some(retention) = chrono::Duration::from_std(retention).ok() else {
        warn!(?retention, "Retention period out of range, telemetry is kept");
        return;
    };
    info!(
        retention_hours = retention.num_hours(),
        interval_secs = interval.as_secs(),
        "Telemetry retention sweep started"
    );

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
            continue;
        };
        match purge_telemetry_before(repository.as_ref(), cutoff).await {
            Ok(0) => debug!("No expired telemetry"),
            Ok(removed) => info!(removed, cutoff = %cutoff.to_rfc3339(), "Purged expired telemetry"),
            Err(e) => warn!(error = %e, "Telemetry retention sweep failed"),
        }
    }
}
