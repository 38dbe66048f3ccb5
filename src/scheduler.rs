// Periodic refresh of the static GTFS dataset, independent of request
// traffic. One timer task at most; the refresh itself runs on the blocking
// pool since the acquirer uses blocking I/O throughout.

use log::{error, info};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

use crate::error::{Result, TrackerError};
use crate::gtfs::GtfsStore;

pub struct RefreshScheduler {
    store: Arc<GtfsStore>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RefreshScheduler {
    pub fn new(store: Arc<GtfsStore>) -> RefreshScheduler {
        RefreshScheduler {
            store,
            handle: Mutex::new(None),
        }
    }

    /// Arms the refresh timer, cancelling any previously armed one.
    pub fn start(&self) {
        let store = self.store.clone();
        let task = tokio::spawn(async move {
            let mut wait = store.time_until_refresh();
            loop {
                info!(
                    "Next scheduled GTFS update in {} hours",
                    wait.as_secs() / 3600
                );
                tokio::time::sleep(wait).await;

                // A manual refresh while we slept moves the deadline; go back
                // to sleep instead of spending an extra download.
                let remaining = store.time_until_refresh();
                if !remaining.is_zero() {
                    wait = remaining;
                    continue;
                }

                info!("🔄 Running scheduled GTFS update");
                wait = match run_refresh(store.clone()).await {
                    Ok(()) => store.time_until_refresh(),
                    Err(e) => {
                        // Retried on the same cadence, no back-off.
                        error!("Scheduled GTFS update failed: {}", e);
                        store.refresh_interval()
                    }
                };
            }
        });

        let mut guard = self.lock_handle();
        if let Some(previous) = guard.replace(task) {
            previous.abort();
        }
    }

    pub fn stop(&self) {
        if let Some(task) = self.lock_handle().take() {
            task.abort();
        }
    }

    fn lock_handle(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.handle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Forced refresh + reindex, shared by the scheduler and the admin endpoint.
pub async fn run_refresh(store: Arc<GtfsStore>) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        store.ensure_fresh(true)?;
        store.reindex()
    })
    .await
    .map_err(|e| TrackerError::FileError(format!("Refresh task panicked: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gtfs::GtfsConfig;
    use std::time::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn run_refresh_populates_tables_offline() {
        let dir = tempdir().unwrap();
        let config = GtfsConfig::new(dir.path().to_path_buf(), None);
        let store = Arc::new(GtfsStore::new(config));

        // No credentials: the forced refresh lands on the synthetic dataset.
        run_refresh(store.clone()).await.unwrap();
        let tables = store.snapshot();
        assert_eq!(tables.routes.len(), 15);
        assert!(store.metadata().is_synthetic);
    }

    #[tokio::test]
    async fn scheduler_fires_when_refresh_is_due() {
        let dir = tempdir().unwrap();
        let mut config = GtfsConfig::new(dir.path().to_path_buf(), None);
        config.refresh_interval_secs = 0; // always due
        let store = Arc::new(GtfsStore::new(config));

        let scheduler = RefreshScheduler::new(store.clone());
        scheduler.start();

        let mut fired = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if !store.snapshot().routes.is_empty() {
                fired = true;
                break;
            }
        }
        scheduler.stop();
        assert!(fired, "scheduled refresh never populated the tables");
    }

    #[tokio::test]
    async fn manual_refresh_pushes_back_the_scheduled_deadline() {
        let dir = tempdir().unwrap();
        let mut config = GtfsConfig::new(dir.path().to_path_buf(), None);
        config.refresh_interval_secs = 3;
        let store = Arc::new(GtfsStore::new(config));

        // Seed the dataset so the timer arms for a full interval.
        run_refresh(store.clone()).await.unwrap();

        let scheduler = RefreshScheduler::new(store.clone());
        scheduler.start();

        // Manual refresh one second in: the deadline moves from t+3 to t+4.
        tokio::time::sleep(Duration::from_secs(1)).await;
        run_refresh(store.clone()).await.unwrap();
        let after_manual = store.metadata().last_update_time;

        // Past the original deadline but before the new one: the timer must
        // not have fired again.
        tokio::time::sleep(Duration::from_millis(2500)).await;
        scheduler.stop();
        assert_eq!(
            store.metadata().last_update_time,
            after_manual,
            "scheduled refresh fired at the pre-manual-refresh deadline"
        );
    }
}
