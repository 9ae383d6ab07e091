//! OAuth2-style refresh exchange against a provider's token endpoint.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

use crate::Error;
use crate::domain::EndpointDataReference;

/// Path segment the refresh endpoint is expected to end with.
const TOKEN_PATH: &str = "/token";

/// Successful refresh response body.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime of `access_token` in seconds.
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("expires_in", &self.expires_in)
            .field("token_type", &self.token_type)
            .finish_non_exhaustive()
    }
}

/// Errors that can occur during a refresh exchange.
#[derive(Debug, Error)]
pub enum RefreshError {
    /// The provider rejected the refresh token.
    #[error("refresh rejected by provider ({status})")]
    Unauthorized { status: StatusCode },

    /// The provider answered with another non-success status.
    #[error("refresh endpoint returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("refresh transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed refresh response: {0}")]
    Parse(String),

    /// The credential carries no refresh token or endpoint.
    #[error("credential is not refreshable: {0}")]
    NotRefreshable(String),
}

impl From<RefreshError> for Error {
    fn from(err: RefreshError) -> Self {
        match err {
            RefreshError::Unauthorized { .. } => Error::unauthorized(err.to_string()),
            RefreshError::NotRefreshable(msg) => Error::validation(msg),
            other => Error::refresh(other.to_string()),
        }
    }
}

/// Performs the network half of a refresh.
#[async_trait]
pub trait TokenRefreshClient: Send + Sync {
    async fn refresh(&self, edr: &EndpointDataReference) -> Result<TokenResponse, RefreshError>;
}

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Normalise a refresh endpoint so that it ends in `/token`.
pub fn token_url(refresh_endpoint: &str) -> Result<Url, RefreshError> {
    let mut url = Url::parse(refresh_endpoint)
        .map_err(|e| RefreshError::NotRefreshable(format!("invalid refresh endpoint: {e}")))?;
    if !url.path().ends_with(TOKEN_PATH) {
        let path = format!("{}{}", url.path().trim_end_matches('/'), TOKEN_PATH);
        url.set_path(&path);
    }
    Ok(url)
}

/// Refresh token and normalised token URL of `edr`.
///
/// Fails with [`RefreshError::NotRefreshable`] when either is missing or
/// the endpoint does not parse.
pub fn refresh_target(edr: &EndpointDataReference) -> Result<(&str, Url), RefreshError> {
    let (Some(refresh_token), Some(endpoint)) = (
        edr.refresh_token.as_deref().filter(|t| !t.is_empty()),
        edr.refresh_endpoint.as_deref().filter(|e| !e.is_empty()),
    ) else {
        return Err(RefreshError::NotRefreshable(format!(
            "EDR {} has no refresh token or refresh endpoint",
            edr.id
        )));
    };
    Ok((refresh_token, token_url(endpoint)?))
}

/// [`TokenRefreshClient`] over reqwest.
pub struct HttpTokenRefreshClient {
    client: Client,
}

impl HttpTokenRefreshClient {
    /// Build a client whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> crate::Result<Self> {
        install_rustls_provider();
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TokenRefreshClient for HttpTokenRefreshClient {
    #[instrument(skip(self, edr), fields(edr_id = %edr.id))]
    async fn refresh(&self, edr: &EndpointDataReference) -> Result<TokenResponse, RefreshError> {
        let (refresh_token, url) = refresh_target(edr)?;

        let response = self
            .client
            .post(url.clone())
            .header(header::AUTHORIZATION, format!("Bearer {}", edr.authorization))
            .header(header::ACCEPT, "application/json")
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await?;

        let status = response.status();
        debug!(%url, %status, "Refresh endpoint responded");

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(RefreshError::Unauthorized { status });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RefreshError::Status { status, body });
        }

        let body = response.bytes().await?;
        let token: TokenResponse =
            serde_json::from_slice(&body).map_err(|e| RefreshError::Parse(e.to_string()))?;
        if token.access_token.is_empty() {
            return Err(RefreshError::Parse("empty access_token".to_string()));
        }
        Ok(token)
    }
}
