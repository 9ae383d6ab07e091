//! Credential refresh: the HTTP exchange and the single-flight coordinator.

pub mod client;
pub mod coordinator;

pub use client::{HttpTokenRefreshClient, RefreshError, TokenRefreshClient, TokenResponse};
pub use coordinator::{DEFAULT_REFRESH_LEEWAY, RefreshCoordinator};
