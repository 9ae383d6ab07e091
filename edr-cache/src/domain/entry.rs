//! Cache metadata for one transfer process.

use serde::{Deserialize, Serialize};

use super::state::EdrState;
use crate::Result;

/// One cached EDR entry, keyed by transfer process id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdrEntry {
    pub transfer_process_id: String,
    pub agreement_id: String,
    pub asset_id: String,
    pub provider_id: String,
    pub contract_negotiation_id: String,
    pub state: EdrState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    /// Access token expiry in epoch millis. `0` means no known expiry.
    pub expiration_timestamp: i64,
    pub created_at: i64,
    pub last_modified: i64,
}

impl EdrEntry {
    /// Build a fresh `NEGOTIATED` entry.
    pub fn negotiated(
        transfer_process_id: impl Into<String>,
        asset_id: impl Into<String>,
        agreement_id: impl Into<String>,
        provider_id: impl Into<String>,
        contract_negotiation_id: impl Into<String>,
        expiration_timestamp: i64,
        now_ms: i64,
    ) -> Self {
        Self {
            transfer_process_id: transfer_process_id.into(),
            agreement_id: agreement_id.into(),
            asset_id: asset_id.into(),
            provider_id: provider_id.into(),
            contract_negotiation_id: contract_negotiation_id.into(),
            state: EdrState::Negotiated,
            error_detail: None,
            expiration_timestamp,
            created_at: now_ms,
            last_modified: now_ms,
        }
    }

    /// Whether the credential must be refreshed at `now_ms`.
    pub fn is_expired_at(&self, now_ms: i64, leeway_ms: i64) -> bool {
        self.expiration_timestamp != 0
            && now_ms.saturating_add(leeway_ms) >= self.expiration_timestamp
    }

    /// Apply a validated state change in place.
    ///
    /// `error_detail` is kept only when the target is `ERROR`.
    pub fn apply_transition(
        &mut self,
        target: EdrState,
        detail: Option<String>,
        now_ms: i64,
    ) -> Result<()> {
        self.state = self.state.transition_to(target)?;
        self.error_detail = if target == EdrState::Error {
            detail
        } else {
            None
        };
        self.last_modified = now_ms;
        Ok(())
    }

    pub fn same_pair(&self, other: &EdrEntry) -> bool {
        self.asset_id == other.asset_id && self.agreement_id == other.agreement_id
    }
}

/// Filter for [`crate::store::EdrStore::query`]. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdrFilter {
    pub asset_id: Option<String>,
    pub agreement_id: Option<String>,
    pub provider_id: Option<String>,
    pub contract_negotiation_id: Option<String>,
    pub state: Option<EdrState>,
}

impl EdrFilter {
    pub fn for_pair(asset_id: impl Into<String>, agreement_id: impl Into<String>) -> Self {
        Self {
            asset_id: Some(asset_id.into()),
            agreement_id: Some(agreement_id.into()),
            ..Default::default()
        }
    }

    pub fn with_state(mut self, state: EdrState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_provider(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = Some(provider_id.into());
        self
    }

    pub fn matches(&self, entry: &EdrEntry) -> bool {
        fn eq(want: &Option<String>, have: &str) -> bool {
            want.as_deref().is_none_or(|w| w == have)
        }

        eq(&self.asset_id, &entry.asset_id)
            && eq(&self.agreement_id, &entry.agreement_id)
            && eq(&self.provider_id, &entry.provider_id)
            && eq(&self.contract_negotiation_id, &entry.contract_negotiation_id)
            && self.state.is_none_or(|s| s == entry.state)
    }
}
