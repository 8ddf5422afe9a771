//! Background cleanup sweep.
//!
//! Expired lease rows are the only record that a worker died mid-flight;
//! deleting one re-enables the underlying unit of work for a future tick.
//! The sweep also hard-deletes instance rows past their retention window.
//! It is idempotent and safe to run on every replica.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info};

use crate::store::CleanupStore;

/// Configuration for the cleanup task.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// How often to run a sweep.
    pub interval: Duration,
    /// TTL for scheduler lease rows. Must exceed the realistic worst-case
    /// generator-plus-network time; there is no lease renewal.
    pub scheduler_lock_ttl: Duration,
    /// TTL for activator lease rows.
    pub activator_lock_ttl: Duration,
    /// Retention window for scheduled instance rows.
    pub instance_ttl: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            scheduler_lock_ttl: Duration::from_secs(60 * 60),
            activator_lock_ttl: Duration::from_secs(60 * 60),
            instance_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Background cleanup task.
pub struct CleanupTask {
    store: Arc<dyn CleanupStore>,
    config: CleanupConfig,
}

impl CleanupTask {
    pub fn new(store: Arc<dyn CleanupStore>, config: CleanupConfig) -> Self {
        Self { store, config }
    }

    /// Run the cleanup loop until shutdown.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_ms = self.config.interval.as_millis(),
            scheduler_lock_ttl_secs = self.config.scheduler_lock_ttl.as_secs(),
            activator_lock_ttl_secs = self.config.activator_lock_ttl.as_secs(),
            instance_ttl_secs = self.config.instance_ttl.as_secs(),
            "cleanup task started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("cleanup task shutting down");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.interval) => {
                    if let Err(err) = self.sweep().await {
                        error!(error = ?err, "cleanup sweep failed");
                    }
                }
            }
        }
    }

    /// Run one sweep: expired activator leases, expired scheduler leases,
    /// then aged-out instance rows.
    pub async fn sweep(&self) -> Result<()> {
        let now = Utc::now();

        let activator_horizon = now - chrono_duration(self.config.activator_lock_ttl)?;
        let activator_leases = self
            .store
            .purge_expired_activator_leases(activator_horizon)
            .await?;

        let scheduler_horizon = now - chrono_duration(self.config.scheduler_lock_ttl)?;
        let scheduler_leases = self
            .store
            .purge_expired_scheduler_leases(scheduler_horizon)
            .await?;

        let instance_horizon = now - chrono_duration(self.config.instance_ttl)?;
        let instances = self.store.purge_expired_instances(instance_horizon).await?;

        if activator_leases > 0 || scheduler_leases > 0 || instances > 0 {
            info!(
                activator_leases,
                scheduler_leases, instances, "cleanup sweep deleted expired rows"
            );
        }
        Ok(())
    }
}

fn chrono_duration(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|err| anyhow::anyhow!("invalid cleanup duration: {err}"))
}

/// Convenience function to spawn a cleanup task.
pub fn spawn_cleanup(
    store: Arc<dyn CleanupStore>,
    config: CleanupConfig,
) -> (tokio::task::JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = CleanupTask::new(store, config);
    let handle = tokio::spawn(task.run(shutdown_rx));
    (handle, shutdown_tx)
}
