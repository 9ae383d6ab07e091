//! EDR entry database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::domain::{EdrEntry, EdrState, EndpointDataReference};
use crate::{Error, Result};

/// Row of the `edr_entries` table.
///
/// The credential is kept as JSON in `edr_json` so that it shares the row
/// (and therefore every write) with its metadata.
#[derive(Clone, FromRow, Serialize, Deserialize)]
pub struct EdrEntryDbModel {
    pub transfer_process_id: String,
    pub agreement_id: String,
    pub asset_id: String,
    pub provider_id: String,
    pub contract_negotiation_id: String,
    /// One of NEGOTIATED, REFRESHING, ERROR, EXPIRED.
    pub state: String,
    pub error_detail: Option<String>,
    /// Unix epoch milliseconds (UTC), 0 when the token has no expiry.
    pub expiration_timestamp: i64,
    /// Unix epoch milliseconds (UTC).
    pub created_at: i64,
    /// Unix epoch milliseconds (UTC).
    pub last_modified: i64,
    pub edr_json: String,
}

// `edr_json` carries the tokens and stays out of logs.
impl std::fmt::Debug for EdrEntryDbModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdrEntryDbModel")
            .field("transfer_process_id", &self.transfer_process_id)
            .field("agreement_id", &self.agreement_id)
            .field("asset_id", &self.asset_id)
            .field("provider_id", &self.provider_id)
            .field("contract_negotiation_id", &self.contract_negotiation_id)
            .field("state", &self.state)
            .field("error_detail", &self.error_detail)
            .field("expiration_timestamp", &self.expiration_timestamp)
            .field("created_at", &self.created_at)
            .field("last_modified", &self.last_modified)
            .finish_non_exhaustive()
    }
}

impl EdrEntryDbModel {
    pub fn from_domain(entry: &EdrEntry, edr: &EndpointDataReference) -> Result<Self> {
        Ok(Self {
            transfer_process_id: entry.transfer_process_id.clone(),
            agreement_id: entry.agreement_id.clone(),
            asset_id: entry.asset_id.clone(),
            provider_id: entry.provider_id.clone(),
            contract_negotiation_id: entry.contract_negotiation_id.clone(),
            state: entry.state.as_str().to_string(),
            error_detail: entry.error_detail.clone(),
            expiration_timestamp: entry.expiration_timestamp,
            created_at: entry.created_at,
            last_modified: entry.last_modified,
            edr_json: serde_json::to_string(edr)?,
        })
    }

    pub fn parsed_state(&self) -> Result<EdrState> {
        EdrState::parse(&self.state).ok_or_else(|| {
            Error::Database(format!(
                "edr_entries.state has unknown value '{}' for {}",
                self.state, self.transfer_process_id
            ))
        })
    }

    /// Metadata only, without decoding the credential.
    pub fn to_entry(&self) -> Result<EdrEntry> {
        Ok(EdrEntry {
            transfer_process_id: self.transfer_process_id.clone(),
            agreement_id: self.agreement_id.clone(),
            asset_id: self.asset_id.clone(),
            provider_id: self.provider_id.clone(),
            contract_negotiation_id: self.contract_negotiation_id.clone(),
            state: self.parsed_state()?,
            error_detail: self.error_detail.clone(),
            expiration_timestamp: self.expiration_timestamp,
            created_at: self.created_at,
            last_modified: self.last_modified,
        })
    }

    pub fn to_edr(&self) -> Result<EndpointDataReference> {
        Ok(serde_json::from_str(&self.edr_json)?)
    }

    pub fn into_domain(self) -> Result<(EdrEntry, EndpointDataReference)> {
        Ok((self.to_entry()?, self.to_edr()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_roundtrip() {
        let entry = EdrEntry::negotiated("tp-1", "asset", "agreement", "provider", "neg", 42, 7);
        let edr = EndpointDataReference {
            id: "edr-1".into(),
            endpoint: "http://provider/public".into(),
            auth_type: "bearer".into(),
            authorization: "token".into(),
            refresh_token: None,
            refresh_endpoint: None,
            refresh_audience: None,
            expires_in: Some(300),
        };

        let model = EdrEntryDbModel::from_domain(&entry, &edr).unwrap();
        assert_eq!(model.state, "NEGOTIATED");
        assert_eq!(model.into_domain().unwrap(), (entry, edr));
    }

    #[test]
    fn test_unknown_state_is_reported() {
        let entry = EdrEntry::negotiated("tp-1", "a", "b", "c", "d", 0, 0);
        let edr = EndpointDataReference {
            id: "x".into(),
            endpoint: "http://x".into(),
            auth_type: "bearer".into(),
            authorization: "t".into(),
            refresh_token: None,
            refresh_endpoint: None,
            refresh_audience: None,
            expires_in: None,
        };
        let mut model = EdrEntryDbModel::from_domain(&entry, &edr).unwrap();
        model.state = "DELETING".into();
        assert!(matches!(model.to_entry(), Err(Error::Database(_))));
    }

    #[test]
    fn test_debug_omits_credential_json() {
        let entry = EdrEntry::negotiated("tp-1", "a", "b", "c", "d", 0, 0);
        let edr = EndpointDataReference {
            id: "x".into(),
            endpoint: "http://x".into(),
            auth_type: "bearer".into(),
            authorization: "secret-access".into(),
            refresh_token: Some("secret-refresh".into()),
            refresh_endpoint: Some("http://x/token".into()),
            refresh_audience: None,
            expires_in: None,
        };
        let model = EdrEntryDbModel::from_domain(&entry, &edr).unwrap();
        let rendered = format!("{model:?}");
        assert!(rendered.contains("tp-1"));
        assert!(!rendered.contains("secret-access"));
        assert!(!rendered.contains("secret-refresh"));
    }
}
