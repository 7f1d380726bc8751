// Copyright (c) 2026 Joseph Verdicchio and EvidenceOS Contributors
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;

use axum::extract::{Path, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use nnn_mint_core::{ClaimantAddress, SettlementReference};
use serde::Serialize;
use serde_json::{Map, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::claim::{
    invalid_address_reason, AllocationOutcome, AllocationService, ClaimFailure, SettleOutcome,
    SupplySnapshot,
};
use crate::config::DaemonConfig;
use crate::public_error::{
    PublicErrorCode, MSG_ALREADY_MINTED, MSG_FID_INVALID, MSG_NOT_FOUND, MSG_NO_MINT,
    MSG_SETTLEMENT_CONFLICT, MSG_SOLD_OUT, MSG_TRANSIENT, MSG_TX_HASH_INVALID, MSG_UNAUTHORIZED,
    MSG_UNEXPECTED, PUBLIC_ERROR_HEADER,
};

pub const MINT_SUCCESS_MESSAGE: &str = "NFT minted successfully!";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MintResponse {
    pub success: bool,
    pub token_id: u32,
    pub wallet_address: String,
    pub message: &'static str,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ClaimStatusResponse {
    pub wallet_address: String,
    pub claimed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SettlementResponse {
    pub success: bool,
    pub token_id: u32,
    pub wallet_address: String,
    pub transaction_hash: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct ApiState {
    pub cfg: DaemonConfig,
    pub service: AllocationService,
}

pub fn build_state(cfg: DaemonConfig, service: AllocationService) -> ApiState {
    ApiState { cfg, service }
}

/// Every `OPTIONS` request is answered by the CORS layer before routing.
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            AUTHORIZATION,
            HeaderName::from_static("x-client-info"),
            HeaderName::from_static("apikey"),
            CONTENT_TYPE,
        ]);
    Router::new()
        .route("/v1/mint", post(mint))
        .route("/functions/v1/mint-nnn", post(mint))
        .route("/v1/supply", get(supply))
        .route("/v1/claims/:wallet_address", get(claim_status))
        .route("/v1/settlements", post(settle))
        .route("/healthz", get(health))
        .layer(RequestBodyLimitLayer::new(state.cfg.max_body_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(
    listener: tokio::net::TcpListener,
    state: ApiState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

pub async fn bind_listener(addr: &str) -> Result<tokio::net::TcpListener, std::io::Error> {
    let socket: SocketAddr = addr.parse().map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid listen address")
    })?;
    tokio::net::TcpListener::bind(socket).await
}

async fn mint(State(state): State<ApiState>, body: axum::body::Bytes) -> Response {
    match mint_impl(&state, &body).await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn supply(State(state): State<ApiState>) -> Response {
    match supply_impl(&state).await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn claim_status(
    State(state): State<ApiState>,
    Path(wallet_address): Path<String>,
) -> Response {
    match claim_status_impl(&state, &wallet_address).await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn settle(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    match settle_impl(&state, &headers, &body).await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn health(State(state): State<ApiState>) -> Response {
    let (status, body) = health_impl(&state).await;
    (status, Json(body)).into_response()
}

#[derive(Debug)]
pub struct HttpErr {
    pub(crate) status: StatusCode,
    pub(crate) code: PublicErrorCode,
    pub(crate) response: ErrorBody,
}

impl HttpErr {
    fn new(code: PublicErrorCode, message: &str) -> Self {
        Self {
            status: code.status(),
            code,
            response: ErrorBody {
                error: message.to_string(),
            },
        }
    }

    fn invalid(reason: &str) -> Self {
        Self::new(PublicErrorCode::InvalidInput, reason)
    }

    fn unauthorized() -> Self {
        Self::new(PublicErrorCode::Unauthorized, MSG_UNAUTHORIZED)
    }

    fn from_failure(failure: ClaimFailure) -> Self {
        match failure {
            ClaimFailure::TransientStorageFailure => {
                Self::new(PublicErrorCode::Unavailable, MSG_TRANSIENT)
            }
            ClaimFailure::UnexpectedFailure => Self::new(PublicErrorCode::Internal, MSG_UNEXPECTED),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.response.error
    }
}

impl IntoResponse for HttpErr {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.response)).into_response();
        response.headers_mut().insert(
            PUBLIC_ERROR_HEADER,
            HeaderValue::from_static(self.code.as_str()),
        );
        response
    }
}

#[allow(clippy::result_large_err)]
pub async fn mint_impl(state: &ApiState, body: &[u8]) -> Result<MintResponse, HttpErr> {
    let fields = decode_object(body);
    let wallet_address = string_field(&fields, "wallet_address");
    let social_id = match parse_social_id(fields.get("farcaster_fid")) {
        Ok(social_id) => social_id,
        Err(()) => {
            // Address problems take precedence over the FID.
            let reason = match ClaimantAddress::parse(&wallet_address) {
                Err(err) => invalid_address_reason(err),
                Ok(_) => MSG_FID_INVALID,
            };
            state.service.telemetry().record_claim("invalid_request");
            return Err(HttpErr::invalid(reason));
        }
    };

    let outcome = state
        .service
        .claim(&wallet_address, social_id)
        .await
        .map_err(HttpErr::from_failure)?;
    match outcome {
        AllocationOutcome::Allocated(record) => Ok(MintResponse {
            success: true,
            token_id: record.slot_number,
            wallet_address: record.claimant_address.into_string(),
            message: MINT_SUCCESS_MESSAGE,
        }),
        AllocationOutcome::AlreadyClaimed => Err(HttpErr::new(
            PublicErrorCode::AlreadyClaimed,
            MSG_ALREADY_MINTED,
        )),
        AllocationOutcome::SupplyExhausted => Err(HttpErr::new(
            PublicErrorCode::SupplyExhausted,
            MSG_SOLD_OUT,
        )),
        AllocationOutcome::InvalidRequest { reason } => Err(HttpErr::invalid(reason)),
    }
}

#[allow(clippy::result_large_err)]
pub async fn supply_impl(state: &ApiState) -> Result<SupplySnapshot, HttpErr> {
    state.service.supply().await.map_err(HttpErr::from_failure)
}

#[allow(clippy::result_large_err)]
pub async fn claim_status_impl(
    state: &ApiState,
    wallet_address: &str,
) -> Result<ClaimStatusResponse, HttpErr> {
    let claimant = ClaimantAddress::parse(wallet_address)
        .map_err(|err| HttpErr::invalid(invalid_address_reason(err)))?;
    let wallet = claimant.as_str().to_string();
    let record = state
        .service
        .status(claimant)
        .await
        .map_err(HttpErr::from_failure)?;
    Ok(match record {
        Some(record) => ClaimStatusResponse {
            wallet_address: wallet,
            claimed: true,
            token_id: Some(record.slot_number),
            transaction_hash: record.settlement_reference,
        },
        None => ClaimStatusResponse {
            wallet_address: wallet,
            claimed: false,
            token_id: None,
            transaction_hash: None,
        },
    })
}

#[allow(clippy::result_large_err)]
pub async fn settle_impl(
    state: &ApiState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<SettlementResponse, HttpErr> {
    validate_authorization(headers, &state.cfg)?;
    let fields = decode_object(body);
    let claimant = ClaimantAddress::parse(&string_field(&fields, "wallet_address"))
        .map_err(|err| HttpErr::invalid(invalid_address_reason(err)))?;
    let reference = SettlementReference::parse(&string_field(&fields, "transaction_hash"))
        .map_err(|_| HttpErr::invalid(MSG_TX_HASH_INVALID))?;

    match state
        .service
        .settle(claimant, reference)
        .await
        .map_err(HttpErr::from_failure)?
    {
        SettleOutcome::Settled(record) => Ok(SettlementResponse {
            success: true,
            token_id: record.slot_number,
            transaction_hash: record.settlement_reference.unwrap_or_default(),
            wallet_address: record.claimant_address.into_string(),
        }),
        SettleOutcome::NotFound => Err(HttpErr::new(PublicErrorCode::NotFound, MSG_NO_MINT)),
        SettleOutcome::Conflict => Err(HttpErr::new(
            PublicErrorCode::Conflict,
            MSG_SETTLEMENT_CONFLICT,
        )),
    }
}

pub async fn health_impl(state: &ApiState) -> (StatusCode, HealthResponse) {
    match state.service.supply().await {
        Ok(_) => (StatusCode::OK, HealthResponse { status: "ok" }),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            HealthResponse {
                status: "unavailable",
            },
        ),
    }
}

/// The settlement route does not exist unless a token is configured.
#[allow(clippy::result_large_err)]
fn validate_authorization(headers: &HeaderMap, cfg: &DaemonConfig) -> Result<(), HttpErr> {
    let Some(token) = cfg.settlement_token.as_ref() else {
        return Err(HttpErr::new(PublicErrorCode::NotFound, MSG_NOT_FOUND));
    };
    let Some(value) = headers.get(AUTHORIZATION) else {
        return Err(HttpErr::unauthorized());
    };
    let parsed = value.to_str().map_err(|_| HttpErr::unauthorized())?;
    let expected = format!("Bearer {token}");
    if parsed != expected {
        return Err(HttpErr::unauthorized());
    }
    Ok(())
}

/// Anything other than a JSON object decodes to no fields at all.
fn decode_object(body: &[u8]) -> Map<String, Value> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

/// Absent and `null` read as empty; other non-string values are kept as
/// their JSON text so they fail address validation as malformed.
fn string_field(fields: &Map<String, Value>, key: &str) -> String {
    match fields.get(key) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// FID `0` is treated as absent. Values must fit a signed 64-bit column.
fn parse_social_id(value: Option<&Value>) -> Result<Option<u64>, ()> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => match n.as_u64() {
            Some(0) => Ok(None),
            Some(id) if i64::try_from(id).is_ok() => Ok(Some(id)),
            _ => Err(()),
        },
        Some(_) => Err(()),
    }
}
