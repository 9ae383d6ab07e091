#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::{Form, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use jsonwebtoken::{EncodingKey, Header};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tempfile::TempDir;

use edr_cache::clock::Clock;
use edr_cache::database;
use edr_cache::domain::{EdrEntry, EndpointDataReference};
use edr_cache::store::{EdrStore, SqlxEdrStore};

pub const SIGNING_SECRET: &[u8] = b"edr-cache-test-secret";

#[derive(Serialize)]
struct Claims {
    exp: i64,
    iat: i64,
    sub: String,
}

pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// HS256 token expiring at `exp` (epoch seconds).
pub fn mint_jwt(exp: i64) -> String {
    let claims = Claims {
        exp,
        iat: now_secs(),
        sub: "consumer".to_string(),
    };
    jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SIGNING_SECRET),
    )
    .unwrap()
}

/// HS256 token without an `exp` claim.
pub fn mint_jwt_without_exp() -> String {
    jsonwebtoken::encode(
        &Header::default(),
        &json!({ "iat": now_secs(), "sub": "consumer" }),
        &EncodingKey::from_secret(SIGNING_SECRET),
    )
    .unwrap()
}

pub async fn sqlite_store(clock: Arc<dyn Clock>) -> (TempDir, Arc<SqlxEdrStore>) {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite:{}?mode=rwc", dir.path().join("edr.db").display());
    let (pool, write_pool) = database::open(&url).await.unwrap();
    (dir, Arc::new(SqlxEdrStore::with_clock(pool, write_pool, clock)))
}

/// Seed a `NEGOTIATED` entry whose token expires at `exp` (epoch seconds).
pub async fn seed(
    store: &dyn EdrStore,
    transfer_process_id: &str,
    refresh_endpoint: &str,
    exp: i64,
) -> EndpointDataReference {
    let edr = EndpointDataReference {
        id: format!("edr-{transfer_process_id}"),
        endpoint: "http://provider/public".to_string(),
        auth_type: "bearer".to_string(),
        authorization: mint_jwt(exp),
        refresh_token: Some(format!("refresh-{transfer_process_id}")),
        refresh_endpoint: Some(refresh_endpoint.to_string()),
        refresh_audience: Some("did:web:consumer".to_string()),
        expires_in: Some(300),
    };
    let entry = EdrEntry::negotiated(
        transfer_process_id,
        format!("asset-{transfer_process_id}"),
        format!("agreement-{transfer_process_id}"),
        "BPNL000PROVIDER",
        format!("negotiation-{transfer_process_id}"),
        exp.saturating_mul(1000),
        chrono::Utc::now().timestamp_millis(),
    );
    store.save(&entry, &edr).await.unwrap();
    edr
}

/// A refresh request as seen by the mock provider.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub authorization: Option<String>,
    pub form: HashMap<String, String>,
}

struct ProviderState {
    calls: AtomicUsize,
    reject: AtomicBool,
    delay: Duration,
    lifetime_secs: i64,
    requests: Mutex<Vec<RecordedRequest>>,
}

/// Mock provider token endpoint on an ephemeral port.
pub struct MockProvider {
    addr: std::net::SocketAddr,
    state: Arc<ProviderState>,
}

impl MockProvider {
    pub async fn start(delay: Duration) -> Self {
        let state = Arc::new(ProviderState {
            calls: AtomicUsize::new(0),
            reject: AtomicBool::new(false),
            delay,
            lifetime_secs: 300,
            requests: Mutex::new(Vec::new()),
        });
        let app = Router::new()
            .route("/refresh/token", post(token))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    /// Refresh endpoint as the provider advertises it, without `/token`.
    pub fn refresh_endpoint(&self) -> String {
        format!("http://{}/refresh", self.addr)
    }

    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub fn reject_with_unauthorized(&self) {
        self.state.reject.store(true, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().clone()
    }
}

async fn token(
    State(state): State<Arc<ProviderState>>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let n = state.calls.fetch_add(1, Ordering::SeqCst) + 1;
    state.requests.lock().push(RecordedRequest {
        authorization: headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        form,
    });
    tokio::time::sleep(state.delay).await;

    if state.reject.load(Ordering::SeqCst) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({
        "access_token": mint_jwt(now_secs() + state.lifetime_secs),
        "refresh_token": format!("rotated-{n}"),
        "expires_in": state.lifetime_secs,
        "token_type": "Bearer",
    }))
    .into_response()
}

/// An address nothing listens on.
pub async fn closed_endpoint() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}/refresh")
}
