//! Turns transfer lifecycle events into cache mutations.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

use super::collaborators::{NegotiationResolver, TransferProcess, TransferProcessStore};
use super::events::LifecycleEvent;
use super::registry::LifecycleEventHandler;
use crate::clock::Clock;
use crate::domain::{DataAddress, EdrEntry, EdrFilter, EdrState};
use crate::store::EdrStore;
use crate::{Error, Result};

/// Reason attached to termination requests for superseded transfers.
const TERMINATION_REASON: &str = "EDR invalidated by transfer termination";

/// Creates, supersedes and invalidates cache entries on lifecycle events.
pub struct EdrLifecycleController {
    store: Arc<dyn EdrStore>,
    transfers: Arc<dyn TransferProcessStore>,
    negotiations: Arc<dyn NegotiationResolver>,
    clock: Arc<dyn Clock>,
}

impl EdrLifecycleController {
    pub fn new(
        store: Arc<dyn EdrStore>,
        transfers: Arc<dyn TransferProcessStore>,
        negotiations: Arc<dyn NegotiationResolver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            transfers,
            negotiations,
            clock,
        }
    }

    /// Cache the EDR carried by a started transfer.
    #[instrument(skip(self, data_address))]
    pub async fn on_transfer_started(
        &self,
        transfer_process_id: &str,
        data_address: &DataAddress,
    ) -> Result<EdrEntry> {
        let edr = data_address.to_endpoint_data_reference()?;

        // Resolution and the write share one unit of work; an early return
        // drops it uncommitted.
        let mut uow = self.store.begin().await?;

        let transfer = self.resolve_transfer(transfer_process_id, &edr.id).await?;
        let negotiation = self
            .negotiations
            .find_for_agreement(&transfer.contract_id)
            .await?
            .ok_or_else(|| Error::not_found("ContractNegotiation", &transfer.contract_id))?;

        let now = self.clock.now_ms();
        let expiration = edr.expiration_ms(now).map_err(|e| {
            Error::validation(format!("EDR {} carries a malformed token: {e}", edr.id))
        })?;

        let entry = EdrEntry::negotiated(
            &transfer.id,
            &transfer.asset_id,
            &transfer.contract_id,
            &negotiation.counter_party_id,
            &negotiation.id,
            expiration,
            now,
        );

        let superseded = uow.save(&entry, &edr).await?;
        uow.commit().await?;

        info!(
            asset_id = %entry.asset_id,
            agreement_id = %entry.agreement_id,
            expires_at = expiration,
            superseded = superseded.len(),
            "EDR cached"
        );
        Ok(entry)
    }

    /// Invalidate the live entries of a terminated transfer's asset/agreement.
    ///
    /// Entries mid-refresh go to `ERROR` with `reason`; the rest are expired
    /// and their transfers asked to terminate once the writes are committed.
    #[instrument(skip(self))]
    pub async fn on_transfer_terminated(
        &self,
        transfer_process_id: &str,
        reason: &str,
    ) -> Result<()> {
        let transfer = self
            .transfers
            .find_by_id(transfer_process_id)
            .await?
            .ok_or_else(|| Error::not_found("TransferProcess", transfer_process_id))?;

        let mut uow = self.store.begin().await?;
        let live = uow
            .query(&EdrFilter::for_pair(&transfer.asset_id, &transfer.contract_id))
            .await?
            .into_iter()
            .filter(|e| e.state.is_live());

        let mut errored = Vec::new();
        let mut expired = Vec::new();
        for entry in live {
            let id = entry.transfer_process_id;
            match entry.state {
                EdrState::Refreshing => {
                    uow.transition(
                        &id,
                        EdrState::Refreshing,
                        EdrState::Error,
                        Some(reason.to_string()),
                    )
                    .await?;
                    errored.push(id);
                }
                state => {
                    uow.transition(&id, state, EdrState::Expired, None).await?;
                    expired.push(id);
                }
            }
        }
        uow.commit().await?;

        info!(
            errored = errored.len(),
            expired = expired.len(),
            "EDR entries invalidated after transfer termination"
        );

        join_all(
            expired
                .iter()
                .filter(|id| id.as_str() != transfer_process_id)
                .map(|id| self.terminate_if_possible(id)),
        )
        .await;
        Ok(())
    }

    async fn resolve_transfer(&self, transfer_process_id: &str, edr_id: &str) -> Result<TransferProcess> {
        if let Some(transfer) = self.transfers.find_by_id(transfer_process_id).await? {
            return Ok(transfer);
        }
        self.transfers
            .find_for_correlation_id(edr_id)
            .await?
            .ok_or_else(|| Error::not_found("TransferProcess", transfer_process_id))
    }

    async fn terminate_if_possible(&self, id: &str) {
        let transfer = match self.transfers.find_by_id(id).await {
            Ok(Some(t)) => t,
            Ok(None) => return,
            Err(e) => {
                warn!(transfer_process_id = %id, error = %e, "Could not load transfer for cleanup");
                return;
            }
        };
        if !transfer.state.is_terminable() {
            debug!(transfer_process_id = %id, state = ?transfer.state, "Transfer already finished");
            return;
        }
        if let Err(e) = self.transfers.terminate(id, TERMINATION_REASON).await {
            warn!(transfer_process_id = %id, error = %e, "Transfer termination request failed");
        }
    }
}

#[async_trait]
impl LifecycleEventHandler for EdrLifecycleController {
    fn name(&self) -> &str {
        "edr-lifecycle"
    }

    async fn on_event(&self, event: &LifecycleEvent) -> Result<()> {
        match event {
            LifecycleEvent::TransferStarted {
                transfer_process_id,
                data_address: Some(address),
                ..
            } => self
                .on_transfer_started(transfer_process_id, address)
                .await
                .map(|_| ()),
            LifecycleEvent::TransferTerminated {
                transfer_process_id,
                reason: Some(reason),
                ..
            } => self.on_transfer_terminated(transfer_process_id, reason).await,
            LifecycleEvent::TransferStarted {
                data_address: None, ..
            }
            | LifecycleEvent::TransferTerminated { reason: None, .. }
            | LifecycleEvent::NegotiationFinalized { .. } => Ok(()),
        }
    }
}
