//! Background maintenance of the EDR table.
//!
//! - Demotes entries stuck in `REFRESHING` past the refresh lease to `ERROR`
//! - Purges `EXPIRED` entries past the retention period

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::database::time::duration_ms;
use crate::store::EdrStore;

/// Detail recorded on entries demoted by lease expiry.
pub const LEASE_EXPIRED_DETAIL: &str = "refresh lease expired";

/// Configuration for [`EdrMaintenance`].
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// How often the sweep runs (default: 60s).
    pub interval: Duration,
    /// How long an entry may stay `REFRESHING` before it is considered
    /// abandoned (default: 60s).
    pub refresh_lease: Duration,
    /// How long `EXPIRED` entries are kept (default: 24h).
    pub expired_retention: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            refresh_lease: Duration::from_secs(60),
            expired_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub recovered: Vec<String>,
    pub purged: u64,
}

/// Periodic EDR maintenance.
pub struct EdrMaintenance {
    store: Arc<dyn EdrStore>,
    clock: Arc<dyn Clock>,
    config: MaintenanceConfig,
    cancel: CancellationToken,
}

impl EdrMaintenance {
    pub fn new(store: Arc<dyn EdrStore>, clock: Arc<dyn Clock>, config: MaintenanceConfig) -> Self {
        Self {
            store,
            clock,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Start the maintenance loop.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run_loop().await })
    }

    /// Stop the maintenance loop after the current sweep.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    async fn run_loop(&self) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        tracing::error!(error = %e, "EDR maintenance error");
                    }
                }
            }
        }
        tracing::debug!("EDR maintenance stopped");
    }

    /// Run one sweep.
    pub async fn run_once(&self) -> Result<MaintenanceReport, crate::Error> {
        let now = self.clock.now_ms();

        let lease_cutoff = now.saturating_sub(duration_ms(self.config.refresh_lease));
        let recovered = self
            .store
            .recover_stale_refreshes(lease_cutoff, LEASE_EXPIRED_DETAIL)
            .await?;
        if !recovered.is_empty() {
            tracing::warn!(
                count = recovered.len(),
                ids = ?recovered,
                "Recovered EDR entries stuck in REFRESHING"
            );
        }

        let retention_cutoff = now.saturating_sub(duration_ms(self.config.expired_retention));
        let purged = self.store.purge_expired(retention_cutoff).await?;
        if purged > 0 {
            tracing::info!(purged, "Purged expired EDR entries");
        }

        Ok(MaintenanceReport { recovered, purged })
    }
}
