//! EDR cache routes.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::{ApiError, ApiResult};
use super::server::AppState;
use crate::database::time::ms_to_datetime;
use crate::domain::{EdrEntry, EdrFilter, EdrState, EndpointDataReference};
use crate::lifecycle::{InitiatedNegotiation, LifecycleEvent, NegotiateEdrRequest};
use crate::store::DEFAULT_QUERY_LIMIT;

/// Largest page a caller may request.
const MAX_QUERY_LIMIT: u32 = 500;

/// Create the EDR router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_edrs).post(initiate_negotiation))
        .route("/{id}", get(get_entry).delete(delete_edr))
        .route("/{id}/dataaddress", get(get_data_address))
        .route("/{id}/refresh", post(refresh_edr))
        .route("/assets/{asset_id}", get(references_for_asset))
}

/// Create the router lifecycle callbacks are posted to.
pub fn callbacks_router() -> Router<AppState> {
    Router::new().route("/", post(receive_event))
}

/// Create the health router.
pub fn health_router() -> Router<AppState> {
    Router::new().route("/", get(health))
}

/// Query parameters for listing entries.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdrQueryParams {
    pub asset_id: Option<String>,
    pub agreement_id: Option<String>,
    pub provider_id: Option<String>,
    pub contract_negotiation_id: Option<String>,
    pub state: Option<String>,
    #[serde(default)]
    pub offset: u32,
    pub limit: Option<u32>,
}

impl EdrQueryParams {
    fn filter(&self) -> ApiResult<EdrFilter> {
        let state = match self.state.as_deref() {
            None | Some("") => None,
            Some(raw) => Some(EdrState::parse(&raw.to_ascii_uppercase()).ok_or_else(|| {
                ApiError::bad_request(format!("unknown state '{raw}'")).with_details(
                    serde_json::json!({
                        "allowed": EdrState::ALL.iter().map(EdrState::as_str).collect::<Vec<_>>()
                    }),
                )
            })?),
        };
        Ok(EdrFilter {
            asset_id: self.asset_id.clone(),
            agreement_id: self.agreement_id.clone(),
            provider_id: self.provider_id.clone(),
            contract_negotiation_id: self.contract_negotiation_id.clone(),
            state,
        })
    }

    fn limit(&self) -> u32 {
        self.limit
            .unwrap_or(DEFAULT_QUERY_LIMIT)
            .clamp(1, MAX_QUERY_LIMIT)
    }
}

#[derive(Debug, Deserialize)]
pub struct DataAddressParams {
    #[serde(default = "default_auto_refresh")]
    pub auto_refresh: bool,
}

fn default_auto_refresh() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetParams {
    pub provider_id: Option<String>,
}

/// Entry metadata as returned by the API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EdrEntryResponse {
    pub transfer_process_id: String,
    pub agreement_id: String,
    pub asset_id: String,
    pub provider_id: String,
    pub contract_negotiation_id: String,
    pub state: EdrState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub expiration_timestamp: i64,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl From<EdrEntry> for EdrEntryResponse {
    fn from(entry: EdrEntry) -> Self {
        Self {
            transfer_process_id: entry.transfer_process_id,
            agreement_id: entry.agreement_id,
            asset_id: entry.asset_id,
            provider_id: entry.provider_id,
            contract_negotiation_id: entry.contract_negotiation_id,
            state: entry.state,
            error_detail: entry.error_detail,
            expiration_timestamp: entry.expiration_timestamp,
            created_at: ms_to_datetime(entry.created_at),
            last_modified: ms_to_datetime(entry.last_modified),
        }
    }
}

/// Paginated list response.
#[derive(Debug, Serialize)]
pub struct PaginatedResponse<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

async fn list_edrs(
    State(state): State<AppState>,
    Query(params): Query<EdrQueryParams>,
) -> ApiResult<Json<PaginatedResponse<EdrEntryResponse>>> {
    let filter = params.filter()?;
    let page = state
        .service
        .query(&filter, params.offset, params.limit())
        .await?;

    Ok(Json(PaginatedResponse {
        items: page.items.into_iter().map(Into::into).collect(),
        total: page.total,
        limit: page.limit,
        offset: page.offset,
    }))
}

async fn initiate_negotiation(
    State(state): State<AppState>,
    Json(request): Json<NegotiateEdrRequest>,
) -> ApiResult<Json<InitiatedNegotiation>> {
    Ok(Json(state.service.initiate_negotiation(request).await?))
}

async fn get_entry(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<EdrEntryResponse>> {
    Ok(Json(state.service.entry(&id).await?.into()))
}

async fn get_data_address(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<DataAddressParams>,
) -> ApiResult<Json<EndpointDataReference>> {
    Ok(Json(state.service.get(&id, params.auto_refresh).await?))
}

async fn refresh_edr(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<EndpointDataReference>> {
    Ok(Json(state.service.refresh(&id).await?))
}

async fn delete_edr(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.service.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn references_for_asset(
    State(state): State<AppState>,
    Path(asset_id): Path<String>,
    Query(params): Query<AssetParams>,
) -> ApiResult<Json<Vec<EndpointDataReference>>> {
    Ok(Json(
        state
            .service
            .references_for_asset(&asset_id, params.provider_id.as_deref())
            .await?,
    ))
}

async fn receive_event(
    State(state): State<AppState>,
    Json(event): Json<LifecycleEvent>,
) -> ApiResult<StatusCode> {
    debug!(event = event.name(), subject = event.subject_id(), "Lifecycle callback received");
    state.events.dispatch(&event).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": state.start_time.elapsed().as_secs(),
        })),
    )
}
