//! API server setup and configuration.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::api::routes;
use crate::config::EdrConfig;
use crate::error::{Error, Result};
use crate::lifecycle::EventHandlerRegistry;
use crate::service::EdrService;

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub bind_address: String,
    pub port: u16,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        let config = EdrConfig::default();
        Self {
            bind_address: config.bind_address,
            port: config.port,
        }
    }
}

impl From<&EdrConfig> for ApiServerConfig {
    fn from(config: &EdrConfig) -> Self {
        Self {
            bind_address: config.bind_address.clone(),
            port: config.port,
        }
    }
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub service: EdrService,
    /// Receives lifecycle callbacks.
    pub events: Arc<EventHandlerRegistry>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(service: EdrService, events: Arc<EventHandlerRegistry>) -> Self {
        Self {
            service,
            events,
            start_time: Instant::now(),
        }
    }
}

/// Build the full router for `state`.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v3/edrs", routes::router())
        .nest("/api/v3/callbacks", routes::callbacks_router())
        .nest("/health", routes::health_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// HTTP front of the EDR cache.
pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
    cancel_token: CancellationToken,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: AppState) -> Self {
        Self {
            config,
            state,
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Serve until [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.port)
            .parse()
            .map_err(|e| Error::config(format!("invalid bind address: {e}")))?;
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "EDR API listening");

        let cancel = self.cancel_token.clone();
        axum::serve(listener, build_router(self.state.clone()))
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;

        tracing::info!("EDR API stopped");
        Ok(())
    }

    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}
