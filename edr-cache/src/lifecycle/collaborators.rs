//! Interfaces to the negotiation and transfer subsystem.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::events::LifecycleEvent;
use super::registry::LifecycleEventHandler;
use crate::{Error, Result};

/// Transfer process states, as far as the cache needs to know them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferProcessState {
    Requested,
    Started,
    Suspended,
    Completed,
    Terminating,
    Terminated,
}

impl TransferProcessState {
    /// Whether a termination request still makes sense.
    pub fn is_terminable(&self) -> bool {
        matches!(self, Self::Requested | Self::Started | Self::Suspended)
    }
}

/// Snapshot of a transfer process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProcess {
    pub id: String,
    /// Id the counter-party uses for the same transfer; the EDR id.
    pub correlation_id: Option<String>,
    pub asset_id: String,
    /// Contract agreement id.
    pub contract_id: String,
    pub state: TransferProcessState,
}

/// Snapshot of a finalized contract negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractNegotiation {
    pub id: String,
    pub agreement_id: String,
    pub counter_party_id: String,
}

/// Read and terminate transfer processes.
#[async_trait]
pub trait TransferProcessStore: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<TransferProcess>>;

    async fn find_for_correlation_id(&self, correlation_id: &str)
    -> Result<Option<TransferProcess>>;

    /// Ask the transfer subsystem to terminate `id`. Asynchronous; the
    /// process may still be running when this returns.
    async fn terminate(&self, id: &str, reason: &str) -> Result<()>;
}

/// Resolve the negotiation that produced an agreement.
#[async_trait]
pub trait NegotiationResolver: Send + Sync {
    async fn find_for_agreement(&self, agreement_id: &str) -> Result<Option<ContractNegotiation>>;
}

/// Process-local collaborator registry, used when the cache runs embedded
/// next to a transfer subsystem that pushes its records in.
#[derive(Default)]
pub struct InMemoryTransferRegistry {
    transfers: RwLock<HashMap<String, TransferProcess>>,
    negotiations: RwLock<HashMap<String, ContractNegotiation>>,
    terminations: RwLock<Vec<(String, String)>>,
}

impl InMemoryTransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_transfer(&self, transfer: TransferProcess) {
        self.transfers.write().insert(transfer.id.clone(), transfer);
    }

    pub fn upsert_negotiation(&self, negotiation: ContractNegotiation) {
        self.negotiations
            .write()
            .insert(negotiation.agreement_id.clone(), negotiation);
    }

    /// Termination requests received so far, as `(id, reason)`.
    pub fn terminations(&self) -> Vec<(String, String)> {
        self.terminations.read().clone()
    }
}

#[async_trait]
impl TransferProcessStore for InMemoryTransferRegistry {
    async fn find_by_id(&self, id: &str) -> Result<Option<TransferProcess>> {
        Ok(self.transfers.read().get(id).cloned())
    }

    async fn find_for_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Option<TransferProcess>> {
        Ok(self
            .transfers
            .read()
            .values()
            .find(|t| t.correlation_id.as_deref() == Some(correlation_id))
            .cloned())
    }

    async fn terminate(&self, id: &str, reason: &str) -> Result<()> {
        let mut transfers = self.transfers.write();
        let transfer = transfers
            .get_mut(id)
            .ok_or_else(|| Error::not_found("TransferProcess", id))?;
        if !transfer.state.is_terminable() {
            return Err(Error::InvalidStateTransition {
                from: format!("{:?}", transfer.state),
                to: "Terminating".to_string(),
            });
        }
        transfer.state = TransferProcessState::Terminating;
        self.terminations
            .write()
            .push((id.to_string(), reason.to_string()));
        Ok(())
    }
}

#[async_trait]
impl NegotiationResolver for InMemoryTransferRegistry {
    async fn find_for_agreement(&self, agreement_id: &str) -> Result<Option<ContractNegotiation>> {
        Ok(self.negotiations.read().get(agreement_id).cloned())
    }
}

/// Keeps the registry in step with snapshots carried by incoming events.
/// Register it ahead of the consumers that resolve transfers.
#[async_trait]
impl LifecycleEventHandler for InMemoryTransferRegistry {
    fn name(&self) -> &str {
        "transfer-registry"
    }

    async fn on_event(&self, event: &LifecycleEvent) -> Result<()> {
        match event {
            LifecycleEvent::TransferStarted {
                transfer: Some(transfer),
                ..
            }
            | LifecycleEvent::TransferTerminated {
                transfer: Some(transfer),
                ..
            } => self.upsert_transfer(transfer.clone()),
            LifecycleEvent::NegotiationFinalized {
                contract_negotiation_id,
                agreement_id,
                counter_party_id,
            } => self.upsert_negotiation(ContractNegotiation {
                id: contract_negotiation_id.clone(),
                agreement_id: agreement_id.clone(),
                counter_party_id: counter_party_id.clone(),
            }),
            _ => {}
        }
        Ok(())
    }
}
