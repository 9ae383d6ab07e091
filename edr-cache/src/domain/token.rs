//! Unverified JWT claim extraction.
//!
//! Signatures are not checked here. The token is only inspected for its
//! expiry so the cache knows when to refresh.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use thiserror::Error;

/// Errors that can occur while reading a token's claims.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenParseError {
    #[error("token is not a compact JWS (expected 3 segments, got {0})")]
    Segments(usize),

    #[error("token payload is not valid base64url: {0}")]
    Encoding(String),

    #[error("token payload is not a JSON object: {0}")]
    Payload(String),
}

/// The subset of registered claims the cache cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TokenClaims {
    /// Expiry, seconds since epoch.
    #[serde(default)]
    pub exp: Option<i64>,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default)]
    pub sub: Option<String>,
}

impl TokenClaims {
    /// Expiry in epoch millis, `0` when the token has none.
    pub fn expiration_ms(&self) -> i64 {
        self.exp.map(|s| s.saturating_mul(1000)).unwrap_or(0)
    }
}

/// Decode the payload segment of a compact JWT.
pub fn parse_claims(token: &str) -> Result<TokenClaims, TokenParseError> {
    let token = token
        .strip_prefix("Bearer ")
        .unwrap_or(token)
        .trim();

    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return Err(TokenParseError::Segments(segments.len()));
    }

    // Some issuers pad; the no-pad engine rejects trailing '='.
    let payload = segments[1].trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| TokenParseError::Encoding(e.to_string()))?;

    serde_json::from_slice(&bytes).map_err(|e| TokenParseError::Payload(e.to_string()))
}

/// Expiry in epoch millis for `token`, `0` if it has no `exp` claim.
pub fn expiration_ms(token: &str) -> Result<i64, TokenParseError> {
    parse_claims(token).map(|c| c.expiration_ms())
}
