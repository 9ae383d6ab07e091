//! Single-flight refresh of cached credentials.
//!
//! The store's compare-and-swap on `state` is the only gate. Exactly one
//! caller per expiry epoch moves an entry into `REFRESHING` and talks to the
//! provider; everyone else gets `Conflict` straight away.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::client::{RefreshError, TokenRefreshClient, TokenResponse, refresh_target};
use crate::clock::Clock;
use crate::database::time::duration_ms;
use crate::domain::{EdrEntry, EdrState, EndpointDataReference};
use crate::store::EdrStore;
use crate::{Error, Result};

/// Default safety leeway before the token's real expiry.
pub const DEFAULT_REFRESH_LEEWAY: Duration = Duration::from_secs(5);

/// Returns usable credentials, refreshing them when they are about to expire.
#[derive(Clone)]
pub struct RefreshCoordinator {
    store: Arc<dyn EdrStore>,
    client: Arc<dyn TokenRefreshClient>,
    clock: Arc<dyn Clock>,
    leeway_ms: i64,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<dyn EdrStore>,
        client: Arc<dyn TokenRefreshClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            client,
            clock,
            leeway_ms: duration_ms(DEFAULT_REFRESH_LEEWAY),
        }
    }

    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway_ms = duration_ms(leeway);
        self
    }

    /// Cached credential for `transfer_process_id`.
    ///
    /// With `auto_refresh` the credential is renewed first if it expires
    /// within the leeway. Without it the cached value is returned as is.
    #[instrument(skip(self), fields(transfer_process_id = %transfer_process_id))]
    pub async fn get(
        &self,
        transfer_process_id: &str,
        auto_refresh: bool,
    ) -> Result<EndpointDataReference> {
        let (entry, edr) = self.store.find_by_id(transfer_process_id).await?;
        if !auto_refresh {
            return Ok(edr);
        }

        let now = self.clock.now_ms();
        if !entry.is_expired_at(now, self.leeway_ms) {
            debug!(
                expires_at = entry.expiration_timestamp,
                "EDR still valid, serving from cache"
            );
            return Ok(edr);
        }

        debug!(
            expires_at = entry.expiration_timestamp,
            now, "EDR expired, attempting refresh"
        );
        self.refresh_observed(entry, edr).await
    }

    /// Refresh regardless of expiry.
    #[instrument(skip(self), fields(transfer_process_id = %transfer_process_id))]
    pub async fn refresh(&self, transfer_process_id: &str) -> Result<EndpointDataReference> {
        let (entry, edr) = self.store.find_by_id(transfer_process_id).await?;
        self.refresh_observed(entry, edr).await
    }

    async fn refresh_observed(
        &self,
        entry: EdrEntry,
        edr: EndpointDataReference,
    ) -> Result<EndpointDataReference> {
        let id = entry.transfer_process_id.clone();

        // Checked before the gate so an unusable credential leaves the entry as is.
        refresh_target(&edr)?;
        if !entry.state.can_start_refresh() {
            debug!(state = %entry.state, "Refresh not possible from current state");
            return Err(Error::conflict(format!(
                "EDR {id} is {}, cannot refresh",
                entry.state
            )));
        }

        // Single-flight gate: only one caller per expiry epoch wins this swap.
        if let Err(e) = self
            .store
            .start_refresh(&id, entry.state, entry.expiration_timestamp)
            .await
        {
            if e.is_conflict() {
                debug!(error = %e, "Lost refresh race");
            }
            return Err(e);
        }

        // The exchange runs detached so a dropped caller cannot strand the
        // entry in REFRESHING.
        let this = self.clone();
        tokio::spawn(async move { this.exchange(id, edr).await })
            .await
            .map_err(|e| Error::Other(format!("refresh task failed: {e}")))?
    }

    async fn exchange(
        &self,
        id: String,
        edr: EndpointDataReference,
    ) -> Result<EndpointDataReference> {
        match self.client.refresh(&edr).await {
            Ok(response) => {
                let refreshed = merge_response(&edr, response);
                let expiration = self.expiration_for(&refreshed);
                self.store
                    .complete_refresh(&id, &refreshed, expiration)
                    .await
                    .inspect_err(|e| {
                        warn!(transfer_process_id = %id, error = %e, "Discarding refreshed token")
                    })?;
                info!(
                    transfer_process_id = %id,
                    expires_at = expiration,
                    "EDR refreshed"
                );
                Ok(refreshed)
            }
            Err(err) => {
                warn!(transfer_process_id = %id, error = %err, "EDR refresh failed");
                self.mark_failed(&id, &err).await;
                Err(err.into())
            }
        }
    }

    async fn mark_failed(&self, id: &str, err: &RefreshError) {
        if let Err(e) = self
            .store
            .transition(
                id,
                EdrState::Refreshing,
                EdrState::Error,
                Some(err.to_string()),
            )
            .await
        {
            warn!(transfer_process_id = %id, error = %e, "Could not record refresh failure");
        }
    }

    /// Expiry of a refreshed credential. Providers may answer with opaque
    /// tokens, which only have `expires_in`.
    fn expiration_for(&self, edr: &EndpointDataReference) -> i64 {
        let now = self.clock.now_ms();
        edr.expiration_ms(now)
            .unwrap_or_else(|_| edr.expires_in_deadline(now))
    }
}

/// Apply a token response to the previous credential.
fn merge_response(previous: &EndpointDataReference, response: TokenResponse) -> EndpointDataReference {
    EndpointDataReference {
        authorization: response.access_token,
        refresh_token: response.refresh_token.or_else(|| previous.refresh_token.clone()),
        expires_in: response.expires_in.or(previous.expires_in),
        ..previous.clone()
    }
}
