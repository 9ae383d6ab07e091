//! Endpoint Data Reference and its conversion from a data address.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::token::{self, TokenParseError};
use crate::{Error, Result};

/// Namespace prefix for core connector properties.
pub const EDC_NAMESPACE: &str = "https://w3id.org/edc/v0.0.1/ns/";

/// Namespace prefix for the token-refresh extension properties.
pub const TX_AUTH_NAMESPACE: &str = "https://w3id.org/tractusx/auth/";

/// Data address type carrying an EDR.
pub const EDR_SIMPLE_TYPE: &str = "EDR";

/// The cached credential: endpoint plus bearer token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointDataReference {
    pub id: String,
    pub endpoint: String,
    #[serde(default = "default_auth_type")]
    pub auth_type: String,
    pub authorization: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_audience: Option<String>,
    /// Lifetime in seconds as announced by the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
}

fn default_auth_type() -> String {
    "bearer".to_string()
}

impl EndpointDataReference {
    /// Expiry of this credential in epoch millis: the token's `exp` claim,
    /// else `expires_in` counted from `now_ms`, else `0` (no known expiry).
    ///
    /// Fails only when `authorization` is not a JWT.
    pub fn expiration_ms(&self, now_ms: i64) -> std::result::Result<i64, TokenParseError> {
        let from_claims = token::expiration_ms(&self.authorization)?;
        if from_claims != 0 {
            return Ok(from_claims);
        }
        Ok(self.expires_in_deadline(now_ms))
    }

    /// `now_ms + expires_in`, or `0` when no lifetime was announced.
    pub fn expires_in_deadline(&self, now_ms: i64) -> i64 {
        self.expires_in
            .map(|secs| now_ms.saturating_add(secs.saturating_mul(1000)))
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for EndpointDataReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointDataReference")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("auth_type", &self.auth_type)
            .field("authorization", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("refresh_endpoint", &self.refresh_endpoint)
            .field("refresh_audience", &self.refresh_audience)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// An untyped data address as delivered by the transfer subsystem.
///
/// Property keys may be bare (`endpoint`) or namespaced
/// (`https://w3id.org/edc/v0.0.1/ns/endpoint`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataAddress {
    pub properties: HashMap<String, String>,
}

impl DataAddress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Look up a property by its bare name, accepting either namespace.
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .get(name)
            .or_else(|| self.properties.get(&format!("{EDC_NAMESPACE}{name}")))
            .or_else(|| self.properties.get(&format!("{TX_AUTH_NAMESPACE}{name}")))
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn address_type(&self) -> Option<&str> {
        self.property("type")
    }

    fn required(&self, name: &str) -> Result<String> {
        self.property(name)
            .map(str::to_string)
            .ok_or_else(|| Error::validation(format!("data address is missing '{name}'")))
    }

    /// Convert into an EDR, failing on missing mandatory properties.
    pub fn to_endpoint_data_reference(&self) -> Result<EndpointDataReference> {
        if let Some(kind) = self.address_type()
            && kind != EDR_SIMPLE_TYPE
            && !kind.ends_with("HTTP")
        {
            return Err(Error::validation(format!(
                "data address type '{kind}' does not carry an EDR"
            )));
        }

        let expires_in = match self.property("expiresIn") {
            Some(raw) => Some(raw.parse::<i64>().map_err(|_| {
                Error::validation(format!("data address 'expiresIn' is not a number: {raw}"))
            })?),
            None => None,
        };

        Ok(EndpointDataReference {
            id: self.required("id")?,
            endpoint: self.required("endpoint")?,
            auth_type: self
                .property("authType")
                .map(str::to_string)
                .unwrap_or_else(default_auth_type),
            authorization: self.required("authorization")?,
            refresh_token: self.property("refreshToken").map(str::to_string),
            refresh_endpoint: self.property("refreshEndpoint").map(str::to_string),
            refresh_audience: self.property("refreshAudience").map(str::to_string),
            expires_in,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> DataAddress {
        DataAddress::new()
            .with_property("type", EDR_SIMPLE_TYPE)
            .with_property(format!("{EDC_NAMESPACE}id"), "edr-1")
            .with_property("endpoint", "http://provider/public")
            .with_property(format!("{EDC_NAMESPACE}authorization"), "token")
            .with_property(format!("{TX_AUTH_NAMESPACE}refreshToken"), "refresh")
            .with_property(format!("{TX_AUTH_NAMESPACE}refreshEndpoint"), "http://provider/token")
            .with_property(format!("{TX_AUTH_NAMESPACE}expiresIn"), "300")
    }

    #[test]
    fn test_namespaced_properties_are_resolved() {
        let edr = address().to_endpoint_data_reference().unwrap();
        assert_eq!(edr.id, "edr-1");
        assert_eq!(edr.endpoint, "http://provider/public");
        assert_eq!(edr.authorization, "token");
        assert_eq!(edr.auth_type, "bearer");
        assert_eq!(edr.refresh_token.as_deref(), Some("refresh"));
        assert_eq!(edr.expires_in, Some(300));
        assert_eq!(edr.refresh_endpoint.as_deref(), Some("http://provider/token"));
    }

    #[test]
    fn test_missing_endpoint_is_validation_failure() {
        let mut addr = address();
        addr.properties.remove("endpoint");
        let err = addr.to_endpoint_data_reference().unwrap_err();
        assert!(matches!(err, Error::Validation(msg) if msg.contains("endpoint")));
    }

    #[test]
    fn test_wrong_type_is_rejected() {
        let addr = address().with_property("type", "AmazonS3");
        assert!(matches!(
            addr.to_endpoint_data_reference(),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_bad_expires_in_is_rejected() {
        let addr = address().with_property("expiresIn", "soon");
        assert!(addr.to_endpoint_data_reference().is_err());
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let edr = address().to_endpoint_data_reference().unwrap();
        let rendered = format!("{edr:?}");
        assert!(!rendered.contains("\"token\""));
        assert!(!rendered.contains("\"refresh\""));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_json_shape() {
        let edr = address().to_endpoint_data_reference().unwrap();
        let json = serde_json::to_value(&edr).unwrap();
        assert_eq!(json["authType"], "bearer");
        assert_eq!(json["refreshEndpoint"], "http://provider/token");
        let back: EndpointDataReference = serde_json::from_value(json).unwrap();
        assert_eq!(back, edr);
    }

    fn unsigned_jwt(payload: &str) -> String {
        use base64::Engine;
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        format!(
            "{}.{}.sig",
            URL_SAFE_NO_PAD.encode(r#"{"alg":"none"}"#),
            URL_SAFE_NO_PAD.encode(payload)
        )
    }

    #[test]
    fn test_expiration_prefers_exp_claim() {
        let mut edr = address().to_endpoint_data_reference().unwrap();
        edr.authorization = unsigned_jwt(r#"{"exp":2000}"#);
        assert_eq!(edr.expiration_ms(1_000).unwrap(), 2_000_000);
    }

    #[test]
    fn test_expiration_falls_back_to_expires_in() {
        let mut edr = address().to_endpoint_data_reference().unwrap();
        edr.authorization = unsigned_jwt(r#"{"sub":"consumer"}"#);
        assert_eq!(edr.expiration_ms(1_000).unwrap(), 1_000 + 300_000);

        edr.expires_in = None;
        assert_eq!(edr.expiration_ms(1_000).unwrap(), 0);
    }

    #[test]
    fn test_expiration_of_opaque_token_is_an_error() {
        let edr = address().to_endpoint_data_reference().unwrap();
        assert!(edr.expiration_ms(1_000).is_err());
        assert_eq!(edr.expires_in_deadline(1_000), 301_000);
    }
}
