mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use uuid::Uuid;

use common::{MockProvider, closed_endpoint, now_secs, seed, sqlite_store};
use edr_cache::clock::SystemClock;
use edr_cache::domain::EdrState;
use edr_cache::refresh::{HttpTokenRefreshClient, RefreshCoordinator};
use edr_cache::store::EdrStore;
use edr_cache::{Error, ErrorKind};

fn coordinator(store: Arc<dyn EdrStore>) -> RefreshCoordinator {
    let client = Arc::new(HttpTokenRefreshClient::new(Duration::from_secs(5)).unwrap());
    RefreshCoordinator::new(store, client, Arc::new(SystemClock))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_gets_refresh_each_entry_once() {
    let provider = MockProvider::start(Duration::from_millis(200)).await;
    let (_dir, store) = sqlite_store(Arc::new(SystemClock)).await;

    let keys: Vec<String> = (0..2).map(|_| Uuid::new_v4().to_string()).collect();
    for key in &keys {
        seed(store.as_ref(), key, &provider.refresh_endpoint(), now_secs() - 60).await;
    }

    let coordinator = coordinator(store.clone());
    let mut tasks = JoinSet::new();
    for i in 0..50 {
        let coordinator = coordinator.clone();
        let key = keys[i % keys.len()].clone();
        tasks.spawn(async move { (key.clone(), coordinator.get(&key, true).await) });
    }

    let mut refreshed = 0;
    let mut conflicts = 0;
    while let Some(joined) = tasks.join_next().await {
        let (key, result) = joined.unwrap();
        match result {
            Ok(edr) => {
                assert_ne!(edr.refresh_token.as_deref(), Some(format!("refresh-{key}").as_str()));
                refreshed += 1;
            }
            Err(e) => {
                assert_eq!(e.kind(), ErrorKind::Conflict, "unexpected error: {e}");
                conflicts += 1;
            }
        }
    }

    assert_eq!(provider.calls(), 2);
    assert!(refreshed >= 2);
    assert_eq!(refreshed + conflicts, 50);

    for key in &keys {
        let (entry, edr) = store.find_by_id(key).await.unwrap();
        assert_eq!(entry.state, EdrState::Negotiated);
        assert!(entry.expiration_timestamp > chrono::Utc::now().timestamp_millis());
        assert!(edr.refresh_token.unwrap().starts_with("rotated-"));
    }

    // The next epoch is served from cache.
    coordinator.get(&keys[0], true).await.unwrap();
    assert_eq!(provider.calls(), 2);
}

#[tokio::test]
async fn refresh_request_carries_credentials() {
    let provider = MockProvider::start(Duration::ZERO).await;
    let (_dir, store) = sqlite_store(Arc::new(SystemClock)).await;
    let old = seed(store.as_ref(), "tp-1", &provider.refresh_endpoint(), now_secs() - 1).await;

    coordinator(store.clone()).get("tp-1", true).await.unwrap();

    let requests = provider.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(
        request.authorization.as_deref(),
        Some(format!("Bearer {}", old.authorization).as_str())
    );
    assert_eq!(
        request.form.get("grant_type").map(String::as_str),
        Some("refresh_token")
    );
    assert_eq!(
        request.form.get("refresh_token").map(String::as_str),
        Some("refresh-tp-1")
    );
}

#[tokio::test]
async fn valid_token_skips_the_provider() {
    let provider = MockProvider::start(Duration::ZERO).await;
    let (_dir, store) = sqlite_store(Arc::new(SystemClock)).await;
    let seeded = seed(store.as_ref(), "tp-1", &provider.refresh_endpoint(), now_secs() + 600).await;

    let edr = coordinator(store.clone()).get("tp-1", true).await.unwrap();
    assert_eq!(edr, seeded);
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn opt_out_returns_expired_token() {
    let provider = MockProvider::start(Duration::ZERO).await;
    let (_dir, store) = sqlite_store(Arc::new(SystemClock)).await;
    let seeded = seed(store.as_ref(), "tp-1", &provider.refresh_endpoint(), now_secs() - 60).await;

    let edr = coordinator(store.clone()).get("tp-1", false).await.unwrap();
    assert_eq!(edr.authorization, seeded.authorization);
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn rejected_refresh_keeps_old_credential() {
    let provider = MockProvider::start(Duration::ZERO).await;
    provider.reject_with_unauthorized();
    let (_dir, store) = sqlite_store(Arc::new(SystemClock)).await;
    let seeded = seed(store.as_ref(), "tp-1", &provider.refresh_endpoint(), now_secs() - 60).await;

    let err = coordinator(store.clone()).get("tp-1", true).await.unwrap_err();
    assert!(matches!(err, Error::Unauthorized(_)));
    assert_eq!(provider.calls(), 1);

    let (entry, edr) = store.find_by_id("tp-1").await.unwrap();
    assert_eq!(entry.state, EdrState::Error);
    assert!(entry.error_detail.unwrap().contains("401"));
    assert_eq!(edr, seeded);
}

#[tokio::test]
async fn unreachable_provider_is_server_error() {
    let endpoint = closed_endpoint().await;
    let (_dir, store) = sqlite_store(Arc::new(SystemClock)).await;
    seed(store.as_ref(), "tp-1", &endpoint, now_secs() - 60).await;

    let err = coordinator(store.clone()).refresh("tp-1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ServerError);

    let (entry, _) = store.find_by_id("tp-1").await.unwrap();
    assert_eq!(entry.state, EdrState::Error);
}
