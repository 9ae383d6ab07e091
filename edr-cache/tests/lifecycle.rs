mod common;

use std::sync::Arc;

use common::{mint_jwt, mint_jwt_without_exp, now_secs};
use edr_cache::Error;
use edr_cache::clock::ManualClock;
use edr_cache::domain::edr::{EDC_NAMESPACE, EDR_SIMPLE_TYPE, TX_AUTH_NAMESPACE};
use edr_cache::domain::{DataAddress, EdrState};
use edr_cache::lifecycle::{
    ContractNegotiation, EdrLifecycleController, EventHandlerRegistry, InMemoryTransferRegistry,
    LifecycleEvent, TransferProcess, TransferProcessState, TransferProcessStore,
};
use edr_cache::store::{EdrStore, InMemoryEdrStore};

struct Fixture {
    store: Arc<InMemoryEdrStore>,
    transfers: Arc<InMemoryTransferRegistry>,
    controller: Arc<EdrLifecycleController>,
}

fn fixture() -> Fixture {
    let clock = ManualClock::new(1_700_000_000_000);
    let store = Arc::new(InMemoryEdrStore::with_clock(Arc::new(clock.clone())));
    let transfers = Arc::new(InMemoryTransferRegistry::new());
    transfers.upsert_negotiation(ContractNegotiation {
        id: "negotiation-1".into(),
        agreement_id: "agreement-1".into(),
        counter_party_id: "BPNL000PROVIDER".into(),
    });
    let controller = Arc::new(EdrLifecycleController::new(
        store.clone(),
        transfers.clone(),
        transfers.clone(),
        Arc::new(clock),
    ));
    Fixture {
        store,
        transfers,
        controller,
    }
}

fn transfer(id: &str, asset_id: &str, agreement_id: &str) -> TransferProcess {
    TransferProcess {
        id: id.into(),
        correlation_id: Some(format!("edr-{id}")),
        asset_id: asset_id.into(),
        contract_id: agreement_id.into(),
        state: TransferProcessState::Started,
    }
}

fn address(edr_id: &str, token: &str) -> DataAddress {
    DataAddress::new()
        .with_property(format!("{EDC_NAMESPACE}type"), EDR_SIMPLE_TYPE)
        .with_property(format!("{EDC_NAMESPACE}id"), edr_id)
        .with_property(format!("{EDC_NAMESPACE}endpoint"), "http://provider/public")
        .with_property(format!("{EDC_NAMESPACE}authorization"), token)
        .with_property(format!("{TX_AUTH_NAMESPACE}refreshToken"), "refresh")
        .with_property(
            format!("{TX_AUTH_NAMESPACE}refreshEndpoint"),
            "http://provider/refresh",
        )
}

#[tokio::test]
async fn started_transfer_is_cached() {
    let f = fixture();
    f.transfers.upsert_transfer(transfer("tp-1", "asset-1", "agreement-1"));
    let exp = now_secs() + 300;

    let entry = f
        .controller
        .on_transfer_started("tp-1", &address("edr-tp-1", &mint_jwt(exp)))
        .await
        .unwrap();
    assert_eq!(entry.state, EdrState::Negotiated);
    assert_eq!(entry.expiration_timestamp, exp * 1000);
    assert_eq!(entry.provider_id, "BPNL000PROVIDER");
    assert_eq!(entry.contract_negotiation_id, "negotiation-1");

    let (stored, edr) = f.store.find_by_id("tp-1").await.unwrap();
    assert_eq!(stored, entry);
    assert_eq!(edr.id, "edr-tp-1");
    assert_eq!(edr.refresh_endpoint.as_deref(), Some("http://provider/refresh"));
}

#[tokio::test]
async fn transfer_is_resolved_by_correlation_id() {
    let f = fixture();
    f.transfers.upsert_transfer(transfer("tp-1", "asset-1", "agreement-1"));

    // Provider-side id; only the EDR id links it to our transfer.
    let entry = f
        .controller
        .on_transfer_started("provider-side", &address("edr-tp-1", &mint_jwt(now_secs() + 60)))
        .await
        .unwrap();
    assert_eq!(entry.transfer_process_id, "tp-1");
}

#[tokio::test]
async fn newer_transfer_supersedes_older_one() {
    let f = fixture();
    f.transfers.upsert_transfer(transfer("tp-1", "asset-1", "agreement-1"));
    f.transfers.upsert_transfer(transfer("tp-2", "asset-1", "agreement-1"));
    let token = mint_jwt(now_secs() + 300);

    f.controller
        .on_transfer_started("tp-1", &address("edr-tp-1", &token))
        .await
        .unwrap();
    f.controller
        .on_transfer_started("tp-2", &address("edr-tp-2", &token))
        .await
        .unwrap();

    let (first, _) = f.store.find_by_id("tp-1").await.unwrap();
    let (second, _) = f.store.find_by_id("tp-2").await.unwrap();
    assert_eq!(first.state, EdrState::Expired);
    assert_eq!(second.state, EdrState::Negotiated);
}

#[tokio::test]
async fn token_without_exp_uses_announced_lifetime() {
    let f = fixture();
    f.transfers.upsert_transfer(transfer("tp-1", "asset-1", "agreement-1"));
    let addr = address("edr-tp-1", &mint_jwt_without_exp())
        .with_property(format!("{TX_AUTH_NAMESPACE}expiresIn"), "300");

    let entry = f.controller.on_transfer_started("tp-1", &addr).await.unwrap();
    assert_eq!(entry.expiration_timestamp, 1_700_000_000_000 + 300_000);
}

#[tokio::test]
async fn token_without_exp_or_lifetime_never_expires() {
    let f = fixture();
    f.transfers.upsert_transfer(transfer("tp-1", "asset-1", "agreement-1"));

    let entry = f
        .controller
        .on_transfer_started("tp-1", &address("edr-tp-1", &mint_jwt_without_exp()))
        .await
        .unwrap();
    assert_eq!(entry.expiration_timestamp, 0);
}

#[tokio::test]
async fn malformed_token_is_rejected() {
    let f = fixture();
    f.transfers.upsert_transfer(transfer("tp-1", "asset-1", "agreement-1"));

    let err = f
        .controller
        .on_transfer_started("tp-1", &address("edr-tp-1", "not-a-jwt"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(f.store.find_by_id("tp-1").await.is_err());
}

#[tokio::test]
async fn missing_negotiation_is_not_found() {
    let f = fixture();
    f.transfers.upsert_transfer(transfer("tp-1", "asset-1", "unknown-agreement"));

    let err = f
        .controller
        .on_transfer_started("tp-1", &address("edr-tp-1", &mint_jwt(now_secs() + 60)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[tokio::test]
async fn termination_fails_in_flight_refresh() {
    let f = fixture();
    f.transfers.upsert_transfer(transfer("tp-1", "asset-1", "agreement-1"));
    f.transfers.upsert_transfer(transfer("tp-9", "asset-9", "agreement-1"));
    let token = mint_jwt(now_secs() + 300);
    f.controller
        .on_transfer_started("tp-1", &address("edr-tp-1", &token))
        .await
        .unwrap();
    f.controller
        .on_transfer_started("tp-9", &address("edr-tp-9", &token))
        .await
        .unwrap();
    f.store
        .transition("tp-1", EdrState::Negotiated, EdrState::Refreshing, None)
        .await
        .unwrap();

    f.controller
        .on_transfer_terminated("tp-1", "provider revoked")
        .await
        .unwrap();

    let (entry, _) = f.store.find_by_id("tp-1").await.unwrap();
    assert_eq!(entry.state, EdrState::Error);
    assert_eq!(entry.error_detail.as_deref(), Some("provider revoked"));

    // Different asset, same agreement: untouched.
    let (other, _) = f.store.find_by_id("tp-9").await.unwrap();
    assert_eq!(other.state, EdrState::Negotiated);
    assert!(f.transfers.terminations().is_empty());
}

#[tokio::test]
async fn termination_expires_sibling_and_terminates_its_transfer() {
    let f = fixture();
    f.transfers.upsert_transfer(transfer("tp-1", "asset-1", "agreement-1"));
    f.transfers.upsert_transfer(transfer("tp-2", "asset-1", "agreement-1"));
    f.controller
        .on_transfer_started("tp-1", &address("edr-tp-1", &mint_jwt(now_secs() + 300)))
        .await
        .unwrap();

    // tp-2 never delivered an EDR; its termination still invalidates the pair.
    f.controller
        .on_transfer_terminated("tp-2", "agreement revoked")
        .await
        .unwrap();

    let (entry, _) = f.store.find_by_id("tp-1").await.unwrap();
    assert_eq!(entry.state, EdrState::Expired);

    let terminated: Vec<String> = f.transfers.terminations().into_iter().map(|(id, _)| id).collect();
    assert_eq!(terminated, vec!["tp-1".to_string()]);
    let tp1 = f.transfers.find_by_id("tp-1").await.unwrap().unwrap();
    assert_eq!(tp1.state, TransferProcessState::Terminating);
}

#[tokio::test]
async fn unknown_transfer_termination_is_not_found() {
    let f = fixture();
    assert!(matches!(
        f.controller.on_transfer_terminated("ghost", "x").await,
        Err(Error::NotFound { .. })
    ));
}

#[tokio::test]
async fn registry_routes_events_to_controller() {
    let f = fixture();
    f.transfers.upsert_transfer(transfer("tp-1", "asset-1", "agreement-1"));
    let registry = EventHandlerRegistry::new();
    registry.register(f.controller.clone());

    registry
        .dispatch(&LifecycleEvent::TransferStarted {
            transfer_process_id: "tp-1".into(),
            data_address: Some(address("edr-tp-1", &mint_jwt(now_secs() + 300))),
            transfer: None,
        })
        .await
        .unwrap();
    assert!(f.store.find_by_id("tp-1").await.is_ok());

    // Terminations without a reason are ignored.
    registry
        .dispatch(&LifecycleEvent::TransferTerminated {
            transfer_process_id: "tp-1".into(),
            reason: None,
            transfer: None,
        })
        .await
        .unwrap();
    let (entry, _) = f.store.find_by_id("tp-1").await.unwrap();
    assert_eq!(entry.state, EdrState::Negotiated);

    registry
        .dispatch(&LifecycleEvent::NegotiationFinalized {
            contract_negotiation_id: "negotiation-1".into(),
            agreement_id: "agreement-1".into(),
            counter_party_id: "BPNL000PROVIDER".into(),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn snapshots_in_events_feed_the_controller() {
    let f = fixture();
    let registry = EventHandlerRegistry::new();
    registry.register(f.transfers.clone());
    registry.register(f.controller.clone());

    // Nothing upserted up front; the event carries the transfer.
    registry
        .dispatch(&LifecycleEvent::TransferStarted {
            transfer_process_id: "tp-7".into(),
            data_address: Some(address("edr-tp-7", &mint_jwt(now_secs() + 300))),
            transfer: Some(transfer("tp-7", "asset-7", "agreement-1")),
        })
        .await
        .unwrap();

    let (entry, _) = f.store.find_by_id("tp-7").await.unwrap();
    assert_eq!(entry.asset_id, "asset-7");
    assert_eq!(entry.contract_negotiation_id, "negotiation-1");
}
