use std::sync::Arc;

use edr_cache::api::{ApiServer, ApiServerConfig, AppState};
use edr_cache::clock::{Clock, SystemClock};
use edr_cache::config::EdrConfig;
use edr_cache::database::{self, EdrMaintenance};
use edr_cache::lifecycle::{
    CallbackAddress, EdrLifecycleController, EventHandlerRegistry, HttpNegotiationInitiator,
    InMemoryTransferRegistry,
};
use edr_cache::logging::{self, LogFormat};
use edr_cache::refresh::{HttpTokenRefreshClient, RefreshCoordinator};
use edr_cache::service::EdrService;
use edr_cache::store::{EdrStore, SqlxEdrStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EdrConfig::from_env_or_default()?;
    logging::init_logging(&config.log_filter, LogFormat::from_env());

    let (pool, write_pool) = database::open(&config.database_url).await?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn EdrStore> = Arc::new(SqlxEdrStore::with_clock(
        pool,
        write_pool,
        clock.clone(),
    ));

    let client = Arc::new(HttpTokenRefreshClient::new(config.refresh_timeout)?);
    let coordinator = RefreshCoordinator::new(store.clone(), client, clock.clone())
        .with_leeway(config.refresh_leeway);

    let maintenance = Arc::new(EdrMaintenance::new(
        store.clone(),
        clock.clone(),
        config.maintenance.clone(),
    ));
    let maintenance_handle = maintenance.clone().start();

    // The registry records snapshots first so the controller can resolve them.
    let transfers = Arc::new(InMemoryTransferRegistry::new());
    let controller = Arc::new(EdrLifecycleController::new(
        store.clone(),
        transfers.clone(),
        transfers.clone(),
        clock.clone(),
    ));
    let events = Arc::new(EventHandlerRegistry::new());
    events.register(transfers);
    events.register(controller);

    let mut service = EdrService::new(store, coordinator);
    if let Some(url) = config.negotiation_url.as_deref() {
        let initiator = HttpNegotiationInitiator::new(url, config.refresh_timeout)?;
        tracing::info!(url = %initiator.negotiations_url(), "EDR negotiation enabled");
        service = service.with_negotiation_initiator(
            Arc::new(initiator),
            CallbackAddress::local(config.callback_url.clone()),
        );
    }

    let server = ApiServer::new(
        ApiServerConfig::from(&config),
        AppState::new(service, events),
    );

    let cancel = server.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            cancel.cancel();
        }
    });

    tracing::info!("edr-cache initialized successfully");
    server.run().await?;

    maintenance.stop();
    let _ = maintenance_handle.await;
    Ok(())
}
