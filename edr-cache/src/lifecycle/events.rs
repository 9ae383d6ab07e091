//! Lifecycle events of the negotiation and transfer subsystem.

use serde::{Deserialize, Serialize};

use super::collaborators::TransferProcess;
use crate::domain::DataAddress;

/// Events the EDR cache reacts to.
///
/// Callbacks from a remote transfer subsystem attach a `transfer` snapshot
/// so the process can be resolved without a lookup back into that system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// A transfer reached its started state. Pull transfers carry the EDR
    /// as `data_address`.
    TransferStarted {
        transfer_process_id: String,
        #[serde(default)]
        data_address: Option<DataAddress>,
        #[serde(default)]
        transfer: Option<TransferProcess>,
    },
    /// A transfer was terminated, optionally with a reason.
    TransferTerminated {
        transfer_process_id: String,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        transfer: Option<TransferProcess>,
    },
    /// A contract negotiation reached an agreement.
    NegotiationFinalized {
        contract_negotiation_id: String,
        agreement_id: String,
        counter_party_id: String,
    },
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TransferStarted { .. } => "transfer.started",
            Self::TransferTerminated { .. } => "transfer.terminated",
            Self::NegotiationFinalized { .. } => "negotiation.finalized",
        }
    }

    /// Id of the transfer or negotiation the event is about.
    pub fn subject_id(&self) -> &str {
        match self {
            Self::TransferStarted {
                transfer_process_id,
                ..
            }
            | Self::TransferTerminated {
                transfer_process_id,
                ..
            } => transfer_process_id,
            Self::NegotiationFinalized {
                contract_negotiation_id,
                ..
            } => contract_negotiation_id,
        }
    }
}
