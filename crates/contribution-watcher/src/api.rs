//! REST API module for the contribution watcher
//!
//! Every route except `/health` and `/ws` requires the shared secret in the
//! `Authorization` header. The websocket route authenticates through the
//! offered sub-protocol instead.

use axum::{
    extract::{rejection::JsonRejection, ws::WebSocketUpgrade, Query, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, warn};
use watcher_common::{ContributionId, Error};

use crate::auth::require_credential;
use crate::bootstrap::{BootstrapRequest, BootstrapResponse};
use crate::ledger::DisclosureReceipt;
use crate::notifier::websocket::offered_protocols;
use crate::notifier::WebSocketHub;
use crate::service::Watcher;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressesQuery {
    pub contribution_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressesResponse {
    pub transparent_address: String,
    pub shared_shielded_address: Option<String>,
    /// Hex memo to attach to a shielded payment
    pub memo: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisclosureRequest {
    pub contribution_id: i64,
    pub disclosure: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DisclosureResponse {
    pub receipt: DisclosureReceipt,
}

#[derive(Debug, Deserialize)]
pub struct ValidateAddressQuery {
    pub address: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ValidateAddressResponse {
    pub valid: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub scanner_height: Option<u64>,
    pub watched_contributions: usize,
    pub websocket_clients: usize,
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Maps service errors onto HTTP statuses
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(Error::InvalidInput(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            e if e.is_invalid_input() => StatusCode::BAD_REQUEST,
            Error::Unauthorized => StatusCode::FORBIDDEN,
            e if e.is_transient() => StatusCode::BAD_GATEWAY,
            Error::Custodial(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }

        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

/// Create the API router
pub fn create_router(watcher: Arc<Watcher>) -> Router {
    let protected = Router::new()
        .route("/bootstrap", post(bootstrap_handler))
        .route("/contribution/addresses", get(addresses_handler))
        .route("/contribution/disclosure", post(disclosure_handler))
        .route("/validate/address", get(validate_address_handler))
        .route_layer(middleware::from_fn_with_state(
            watcher.credential().clone(),
            require_credential,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(watcher)
}

/// Health check endpoint
async fn health_handler(State(watcher): State<Arc<Watcher>>) -> Response {
    if let Some(checkpoint) = watcher.checkpoint() {
        if let Err(e) = checkpoint.health_check().await {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("Redis connection failed: {}", e),
            )
                .into_response();
        }
    }

    let response = HealthResponse {
        status: "ok".to_string(),
        scanner_height: watcher.scanner_height().await,
        watched_contributions: watcher.store().watched_count().await,
        websocket_clients: watcher
            .notifier()
            .websocket()
            .map(WebSocketHub::connection_count)
            .unwrap_or(0),
    };
    (StatusCode::OK, Json(response)).into_response()
}

/// POST /bootstrap
async fn bootstrap_handler(
    State(watcher): State<Arc<Watcher>>,
    payload: Result<Json<BootstrapRequest>, JsonRejection>,
) -> Result<Json<BootstrapResponse>, ApiError> {
    let Json(request) = payload?;
    Ok(Json(watcher.bootstrap(&request).await?))
}

/// GET /contribution/addresses?contributionId=N
async fn addresses_handler(
    State(watcher): State<Arc<Watcher>>,
    Query(query): Query<AddressesQuery>,
) -> Result<Json<AddressesResponse>, ApiError> {
    let id: ContributionId = query.contribution_id.parse()?;
    let watched = watcher.assign(id).await?;

    Ok(Json(AddressesResponse {
        transparent_address: watched.transparent_address,
        shared_shielded_address: watched.shared_shielded_address,
        memo: watcher.memo_for(id),
    }))
}

/// POST /contribution/disclosure
async fn disclosure_handler(
    State(watcher): State<Arc<Watcher>>,
    payload: Result<Json<DisclosureRequest>, JsonRejection>,
) -> Result<Json<DisclosureResponse>, ApiError> {
    let Json(request) = payload?;
    let id = ContributionId::new(request.contribution_id)?;
    let receipt = watcher.submit_disclosure(id, &request.disclosure).await?;
    Ok(Json(DisclosureResponse { receipt }))
}

/// GET /validate/address?address=X
async fn validate_address_handler(
    State(watcher): State<Arc<Watcher>>,
    Query(query): Query<ValidateAddressQuery>,
) -> Result<Json<ValidateAddressResponse>, ApiError> {
    let valid = watcher.validate_address(query.address.trim()).await?;
    Ok(Json(ValidateAddressResponse { valid }))
}

/// GET /ws, secret offered as a sub-protocol
async fn ws_handler(
    State(watcher): State<Arc<Watcher>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(hub) = watcher.notifier().websocket().cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let offered = offered_protocols(&headers);
    let accepted = offered
        .iter()
        .find(|protocol| watcher.credential().verify(protocol))
        .cloned();

    match accepted {
        Some(protocol) => ws
            .protocols([protocol])
            .on_upgrade(move |socket| hub.serve(socket)),
        None => {
            warn!("Rejected websocket connection without a valid credential");
            // Clients abort a handshake that answers none of their offered
            // protocols, so echo one to get the rejection through
            ws.protocols(offered.into_iter().take(1))
                .on_upgrade(WebSocketHub::reject)
        }
    }
}
