//! Starting a contract negotiation whose transfer will deliver an EDR.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, header};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;

use crate::refresh::client::install_rustls_provider;
use crate::{Error, Result};

/// Callback the cache registers on every negotiation it starts.
pub const LOCAL_CALLBACK_URI: &str = "local://adapter";

/// Event families the cache subscribes to.
pub const LOCAL_CALLBACK_EVENTS: [&str; 2] = ["contract.negotiation", "transfer.process"];

/// Where the negotiation and transfer subsystem reports progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackAddress {
    pub uri: String,
    #[serde(default)]
    pub events: Vec<String>,
    /// Whether delivery happens inside the state transition.
    #[serde(default)]
    pub transactional: bool,
}

impl CallbackAddress {
    /// Transactional subscription of the cache at `uri`.
    pub fn local(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            events: LOCAL_CALLBACK_EVENTS.iter().map(|e| e.to_string()).collect(),
            transactional: true,
        }
    }
}

impl Default for CallbackAddress {
    fn default() -> Self {
        Self::local(LOCAL_CALLBACK_URI)
    }
}

/// The offer to negotiate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractOffer {
    pub id: String,
    pub asset_id: String,
    /// Policy as published in the provider's catalog; passed through as is.
    pub policy: serde_json::Value,
}

/// Request to negotiate a contract and cache the resulting EDR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiateEdrRequest {
    pub counter_party_address: String,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counter_party_id: Option<String>,
    pub offer: ContractOffer,
    #[serde(default)]
    pub callback_addresses: Vec<CallbackAddress>,
}

impl NegotiateEdrRequest {
    /// Reject requests missing a mandatory property, naming every one.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.counter_party_address.trim().is_empty() {
            missing.push("counterPartyAddress");
        }
        if self.protocol.trim().is_empty() {
            missing.push("protocol");
        }
        if self.offer.id.trim().is_empty() {
            missing.push("offer.id");
        }
        if self.offer.asset_id.trim().is_empty() {
            missing.push("offer.assetId");
        }
        if self.offer.policy.is_null() {
            missing.push("offer.policy");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::validation(format!(
                "negotiation request is missing {}",
                missing.join(", ")
            )))
        }
    }

    /// Add `callback` unless an identical one is already registered.
    pub fn with_callback(mut self, callback: &CallbackAddress) -> Self {
        if !self.callback_addresses.contains(callback) {
            self.callback_addresses.push(callback.clone());
        }
        self
    }
}

/// Handle on a negotiation that was started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiatedNegotiation {
    pub id: String,
    /// Epoch millis, `0` when the subsystem did not say.
    #[serde(default)]
    pub created_at: i64,
}

/// Starts contract negotiations.
#[async_trait]
pub trait NegotiationInitiator: Send + Sync {
    async fn initiate(&self, request: &NegotiateEdrRequest) -> Result<InitiatedNegotiation>;
}

/// Body of a management-API contract request.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ContractRequestBody<'a> {
    #[serde(rename = "@context")]
    context: serde_json::Value,
    #[serde(rename = "@type")]
    kind: &'static str,
    counter_party_address: &'a str,
    protocol: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider_id: Option<&'a str>,
    offer: OfferBody<'a>,
    callback_addresses: &'a [CallbackAddress],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OfferBody<'a> {
    offer_id: &'a str,
    asset_id: &'a str,
    policy: &'a serde_json::Value,
}

#[derive(Deserialize)]
struct IdResponse {
    #[serde(rename = "@id")]
    id: String,
    #[serde(rename = "createdAt", default)]
    created_at: i64,
}

/// [`NegotiationInitiator`] against a connector's management API.
pub struct HttpNegotiationInitiator {
    client: Client,
    negotiations_url: Url,
}

impl HttpNegotiationInitiator {
    /// `management_url` is the management API base, e.g.
    /// `http://connector:8181/management`.
    pub fn new(management_url: &str, timeout: Duration) -> Result<Self> {
        install_rustls_provider();
        let client = Client::builder().timeout(timeout).build()?;
        Self::with_client(client, management_url)
    }

    pub fn with_client(client: Client, management_url: &str) -> Result<Self> {
        let base = Url::parse(management_url)
            .map_err(|e| Error::config(format!("invalid negotiation URL {management_url}: {e}")))?;
        let path = format!("{}/v2/contractnegotiations", base.path().trim_end_matches('/'));
        let mut negotiations_url = base;
        negotiations_url.set_path(&path);
        Ok(Self {
            client,
            negotiations_url,
        })
    }

    pub fn negotiations_url(&self) -> &Url {
        &self.negotiations_url
    }
}

#[async_trait]
impl NegotiationInitiator for HttpNegotiationInitiator {
    #[instrument(skip(self, request), fields(asset_id = %request.offer.asset_id))]
    async fn initiate(&self, request: &NegotiateEdrRequest) -> Result<InitiatedNegotiation> {
        let body = ContractRequestBody {
            context: serde_json::json!({ "@vocab": "https://w3id.org/edc/v0.0.1/ns/" }),
            kind: "ContractRequest",
            counter_party_address: &request.counter_party_address,
            protocol: &request.protocol,
            provider_id: request.counter_party_id.as_deref(),
            offer: OfferBody {
                offer_id: &request.offer.id,
                asset_id: &request.offer.asset_id,
                policy: &request.offer.policy,
            },
            callback_addresses: &request.callback_addresses,
        };

        let response = self
            .client
            .post(self.negotiations_url.clone())
            .header(header::ACCEPT, "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        debug!(url = %self.negotiations_url, %status, "Negotiation request answered");
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Other(format!(
                "negotiation request rejected ({status}): {text}"
            )));
        }

        let created: IdResponse = serde_json::from_slice(&response.bytes().await?)?;
        Ok(InitiatedNegotiation {
            id: created.id,
            created_at: created.created_at,
        })
    }
}
