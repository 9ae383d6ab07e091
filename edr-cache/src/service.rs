//! Inbound façade over the store and the refresh coordinator.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument};

use crate::domain::{EdrEntry, EdrFilter, EndpointDataReference};
use crate::lifecycle::{CallbackAddress, InitiatedNegotiation, NegotiateEdrRequest, NegotiationInitiator};
use crate::refresh::RefreshCoordinator;
use crate::store::EdrStore;
use crate::{Error, Result};

/// One page of query results.
#[derive(Debug, Clone, Serialize)]
pub struct EdrPage {
    pub items: Vec<EdrEntry>,
    pub total: u64,
    pub offset: u32,
    pub limit: u32,
}

/// Operations exposed to API callers.
#[derive(Clone)]
pub struct EdrService {
    store: Arc<dyn EdrStore>,
    coordinator: RefreshCoordinator,
    initiator: Option<Arc<dyn NegotiationInitiator>>,
    callback: CallbackAddress,
}

impl EdrService {
    pub fn new(store: Arc<dyn EdrStore>, coordinator: RefreshCoordinator) -> Self {
        Self {
            store,
            coordinator,
            initiator: None,
            callback: CallbackAddress::default(),
        }
    }

    /// Enable [`initiate_negotiation`](Self::initiate_negotiation). `callback`
    /// is appended to every request so the cache hears about the outcome.
    pub fn with_negotiation_initiator(
        mut self,
        initiator: Arc<dyn NegotiationInitiator>,
        callback: CallbackAddress,
    ) -> Self {
        self.initiator = Some(initiator);
        self.callback = callback;
        self
    }

    /// Start a contract negotiation whose transfer will populate the cache.
    #[instrument(skip(self, request), fields(asset_id = %request.offer.asset_id))]
    pub async fn initiate_negotiation(
        &self,
        request: NegotiateEdrRequest,
    ) -> Result<InitiatedNegotiation> {
        let initiator = self
            .initiator
            .as_ref()
            .ok_or_else(|| Error::config("contract negotiation is not configured"))?;
        request.validate()?;

        let negotiation = initiator
            .initiate(&request.with_callback(&self.callback))
            .await?;
        info!(contract_negotiation_id = %negotiation.id, "EDR negotiation initiated");
        Ok(negotiation)
    }

    /// Credential for a transfer, refreshed first when `auto_refresh` is set
    /// and it is about to expire.
    pub async fn get(
        &self,
        transfer_process_id: &str,
        auto_refresh: bool,
    ) -> Result<EndpointDataReference> {
        self.coordinator.get(transfer_process_id, auto_refresh).await
    }

    /// Refresh unconditionally.
    pub async fn refresh(&self, transfer_process_id: &str) -> Result<EndpointDataReference> {
        self.coordinator.refresh(transfer_process_id).await
    }

    /// Metadata without the credential.
    pub async fn entry(&self, transfer_process_id: &str) -> Result<EdrEntry> {
        Ok(self.store.find_by_id(transfer_process_id).await?.0)
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, transfer_process_id: &str) -> Result<()> {
        self.store.delete(transfer_process_id).await?;
        info!("EDR entry removed");
        Ok(())
    }

    pub async fn query(&self, filter: &EdrFilter, offset: u32, limit: u32) -> Result<EdrPage> {
        let items = self.store.query(filter, offset, limit).await?;
        let total = self.store.count(filter).await?;
        Ok(EdrPage {
            items,
            total,
            offset,
            limit,
        })
    }

    /// Live credentials for an asset.
    pub async fn references_for_asset(
        &self,
        asset_id: &str,
        provider_id: Option<&str>,
    ) -> Result<Vec<EndpointDataReference>> {
        Ok(self
            .store
            .references_for_asset(asset_id, provider_id)
            .await?
            .into_iter()
            .map(|(_, edr)| edr)
            .collect())
    }
}
