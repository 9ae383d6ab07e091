//! Runtime configuration from the environment.

use std::time::Duration;

use crate::database::MaintenanceConfig;
use crate::lifecycle::negotiation::LOCAL_CALLBACK_URI;
use crate::logging::DEFAULT_LOG_FILTER;
use crate::refresh::DEFAULT_REFRESH_LEEWAY;
use crate::{Error, Result};

/// Default SQLite location.
pub const DEFAULT_DATABASE_URL: &str = "sqlite:edr-cache.db?mode=rwc";

/// Top-level configuration of the EDR cache service.
#[derive(Debug, Clone)]
pub struct EdrConfig {
    pub database_url: String,
    pub bind_address: String,
    pub port: u16,
    /// Refresh this long before the token's `exp`.
    pub refresh_leeway: Duration,
    /// Timeout of one refresh HTTP exchange.
    pub refresh_timeout: Duration,
    pub maintenance: MaintenanceConfig,
    pub log_filter: String,
    /// Management API that starts contract negotiations. Unset disables
    /// `POST /api/v3/edrs`.
    pub negotiation_url: Option<String>,
    /// Where negotiation callbacks for the cache are sent.
    pub callback_url: String,
}

impl Default for EdrConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            bind_address: "0.0.0.0".to_string(),
            port: 8181,
            refresh_leeway: DEFAULT_REFRESH_LEEWAY,
            refresh_timeout: Duration::from_secs(30),
            maintenance: MaintenanceConfig::default(),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            negotiation_url: None,
            callback_url: LOCAL_CALLBACK_URI.to_string(),
        }
    }
}

impl EdrConfig {
    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// A `.env` file in the working directory is honoured. Supported env vars:
    /// - `DATABASE_URL`
    /// - `API_BIND_ADDRESS`, `API_PORT`
    /// - `EDR_REFRESH_LEEWAY_SECS`, `EDR_REFRESH_TIMEOUT_SECS`
    /// - `EDR_REFRESH_LEASE_SECS`, `EDR_EXPIRED_RETENTION_SECS`,
    ///   `EDR_MAINTENANCE_INTERVAL_SECS`
    /// - `EDR_LOG_FILTER`
    /// - `EDR_NEGOTIATION_URL`, `EDR_CALLBACK_URL`
    pub fn from_env_or_default() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(bind_address) = get("API_BIND_ADDRESS") {
            config.bind_address = bind_address;
        }
        if let Some(port) = get("API_PORT") {
            config.port = port
                .trim()
                .parse()
                .map_err(|_| Error::config(format!("API_PORT is not a valid port: {port}")))?;
        }
        if let Some(filter) = get("EDR_LOG_FILTER") {
            config.log_filter = filter;
        }
        config.negotiation_url = get("EDR_NEGOTIATION_URL");
        if let Some(callback) = get("EDR_CALLBACK_URL") {
            config.callback_url = callback;
        }

        let secs = |key: &str, target: &mut Duration| -> Result<()> {
            if let Some(raw) = get(key) {
                let value: u64 = raw
                    .trim()
                    .parse()
                    .map_err(|_| Error::config(format!("{key} must be whole seconds, got {raw}")))?;
                *target = Duration::from_secs(value);
            }
            Ok(())
        };
        secs("EDR_REFRESH_LEEWAY_SECS", &mut config.refresh_leeway)?;
        secs("EDR_REFRESH_TIMEOUT_SECS", &mut config.refresh_timeout)?;
        secs("EDR_REFRESH_LEASE_SECS", &mut config.maintenance.refresh_lease)?;
        secs(
            "EDR_EXPIRED_RETENTION_SECS",
            &mut config.maintenance.expired_retention,
        )?;
        secs(
            "EDR_MAINTENANCE_INTERVAL_SECS",
            &mut config.maintenance.interval,
        )?;

        if config.maintenance.interval.is_zero() {
            return Err(Error::config("EDR_MAINTENANCE_INTERVAL_SECS must be positive"));
        }
        // A lease that can run out mid-exchange demotes a live refresh and
        // discards its rotated token.
        if config.maintenance.refresh_lease <= config.refresh_timeout {
            return Err(Error::config(format!(
                "EDR_REFRESH_LEASE_SECS ({}s) must exceed EDR_REFRESH_TIMEOUT_SECS ({}s)",
                config.maintenance.refresh_lease.as_secs(),
                config.refresh_timeout.as_secs()
            )));
        }

        Ok(config)
    }
}
