// Copyright 2026 Primev, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Read API over the participation ledger, plus the authenticated manual-entry endpoints.
//!
//! Every JSON body is terminated by a newline, so an empty listing is literally `[]\n`.

use std::sync::Arc;

use anyhow::{anyhow, Error as AnyhowErr};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
};

use crate::{
    cursor::BlockCursor,
    db::{DbError, DbObj, IntervalUpdate, NewInterval},
    events::{normalize_identity, EventKind, RegistryType},
    points,
    status::IngestionStatus,
};

/// Receiver kind answered by the per-receiver and listing endpoints.
pub const OPERATOR_RECEIVER: &str = "operator";

/// Registry whose operators are scored by the per-receiver, stats and listing endpoints.
const OPERATOR_REGISTRY: RegistryType = RegistryType::Symbiotic;

const MAX_ADMIN_BODY_SIZE: usize = 4 * 1024;

#[derive(Debug, Deserialize, Serialize)]
pub struct ErrMsg {
    pub r#type: String,
    pub msg: String,
}

impl ErrMsg {
    pub fn new(r#type: &str, msg: &str) -> Self {
        Self { r#type: r#type.into(), msg: msg.into() }
    }
}

impl std::fmt::Display for ErrMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "error_type: {} msg: {}", self.r#type, self.msg)
    }
}

/// Error type for the API
#[derive(Error, Debug)]
pub enum AppError {
    #[error("invalid request: {0}")]
    InvalidRequest(AnyhowErr),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("database error")]
    DbErr(#[from] DbError),
    #[error("internal error")]
    InternalErr(AnyhowErr),
}

impl AppError {
    fn type_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::Unauthorized(_) => "Unauthorized",
            Self::DbErr(_) => "DbErr",
            Self::InternalErr(_) => "InternalErr",
        }
    }

    fn invalid(msg: impl std::fmt::Display) -> Self {
        Self::InvalidRequest(anyhow!("{msg}"))
    }
}

impl From<AnyhowErr> for AppError {
    fn from(err: AnyhowErr) -> Self {
        Self::InternalErr(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::DbErr(_) | Self::InternalErr(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if code.is_server_error() {
            tracing::error!("api error, code {code}: {self:?}");
        } else {
            tracing::debug!("api error, code {code}: {self}");
        }

        json_response(code, &ErrMsg::new(self.type_str(), &self.to_string()))
    }
}

/// Serialize `body` as JSON followed by a newline.
fn json_response<T: Serialize>(code: StatusCode, body: &T) -> Response {
    match serde_json::to_string(body) {
        Ok(mut json) => {
            json.push('\n');
            (code, [(header::CONTENT_TYPE, "application/json")], json).into_response()
        }
        Err(err) => {
            tracing::error!("Failed to serialize response: {err}");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error\n").into_response()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApiConfig {
    /// Bearer token for the admin endpoints; admin requests are rejected when unset.
    pub auth_token: Option<String>,
    /// Network address echoed in every listing entry.
    pub network_address: String,
}

pub struct AppState {
    pub db: DbObj,
    pub cursor: BlockCursor,
    pub status: IngestionStatus,
    pub config: ApiConfig,
}

impl AppState {
    pub fn new(
        db: DbObj,
        cursor: BlockCursor,
        status: IngestionStatus,
        config: ApiConfig,
    ) -> Arc<Self> {
        Arc::new(Self { db, cursor, status, config })
    }
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct LastBlockResponse {
    pub last_block_number: u64,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ReceiverPoints {
    pub address: String,
    pub receiver: String,
    pub block_number: u64,
    pub points: u64,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ListingEntry {
    pub address: String,
    pub receiver: String,
    pub block_number: u64,
    pub network_address: String,
    pub vault_address: Option<String>,
    pub points: u64,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct AddressPoints {
    pub address: String,
    pub block_number: u64,
    pub total_points: u64,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct StatusResponse {
    pub status: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct BlockParams {
    pub block_number: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListingParams {
    pub offset: Option<String>,
    pub limit: Option<String>,
    pub block_number: Option<String>,
    pub receiver_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ManualEntryRequest {
    pub pubkey: Option<String>,
    pub adder: Option<String>,
    pub in_block: Option<u64>,
    pub registry_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ManualOptOutRequest {
    pub pubkey: Option<String>,
    pub adder: Option<String>,
    pub out_block: Option<u64>,
    pub registry_type: Option<String>,
}

fn required<'a>(name: &str, value: Option<&'a str>) -> Result<&'a str, AppError> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(AppError::invalid(format!("{name} query param is required"))),
    }
}

/// Parse a query parameter as an integer strictly greater than zero.
fn parse_positive(name: &str, value: Option<&str>) -> Result<u64, AppError> {
    match required(name, value)?.parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(AppError::invalid(format!("invalid {name} parameter"))),
    }
}

fn parse_non_negative(name: &str, value: Option<&str>) -> Result<u64, AppError> {
    required(name, value)?
        .parse::<u64>()
        .map_err(|_| AppError::invalid(format!("invalid {name} parameter")))
}

fn parse_registry(raw: Option<&str>) -> Result<RegistryType, AppError> {
    match raw {
        None | Some("") => Ok(RegistryType::Vanilla),
        Some(raw) => raw.parse().map_err(|e| AppError::InvalidRequest(anyhow!("{e}"))),
    }
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, AppError> {
    serde_json::from_slice(body).map_err(|_| AppError::invalid("Invalid request body"))
}

fn check_auth(config: &ApiConfig, headers: &HeaderMap) -> Result<(), AppError> {
    let Some(expected) = config.auth_token.as_deref().filter(|t| !t.is_empty()) else {
        return Err(AppError::Unauthorized("admin API disabled".into()));
    };
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Err(AppError::Unauthorized("authorization header missing".into()));
    };
    let token = value
        .to_str()
        .ok()
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| AppError::Unauthorized("invalid authorization header format".into()))?;
    if token != expected {
        return Err(AppError::Unauthorized("invalid token".into()));
    }
    Ok(())
}

/// Map ledger conflicts from manual writes onto client errors.
fn manual_write_error(err: DbError) -> AppError {
    if err.is_consistency_error() {
        AppError::InvalidRequest(err.into())
    } else {
        AppError::DbErr(err)
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    match state.status.health().await {
        Ok(()) => (StatusCode::OK, "OK\n").into_response(),
        Err(msg) => (StatusCode::SERVICE_UNAVAILABLE, format!("{msg}\n")).into_response(),
    }
}

async fn last_block(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let last_block_number = state.cursor.current_block().await?;
    Ok(json_response(StatusCode::OK, &LastBlockResponse { last_block_number }))
}

async fn receiver_points(
    State(state): State<Arc<AppState>>,
    Path((receiver_type, receiver_address)): Path<(String, String)>,
    Query(params): Query<BlockParams>,
) -> Result<Response, AppError> {
    let block_number = parse_positive("block_number", params.block_number.as_deref())?;

    if receiver_type != OPERATOR_RECEIVER {
        let body = ReceiverPoints {
            address: receiver_address,
            receiver: receiver_type,
            block_number,
            points: 0,
        };
        return Ok(json_response(StatusCode::OK, &body));
    }

    let key = normalize_identity(&receiver_address).map_err(|e| AppError::InvalidRequest(e.into()))?;
    let points =
        points::points_for_identity(state.db.as_ref(), OPERATOR_REGISTRY, &key, block_number)
            .await?;

    let code = if points == 0 { StatusCode::NOT_FOUND } else { StatusCode::OK };
    let body = ReceiverPoints { address: receiver_address, receiver: receiver_type, block_number, points };
    Ok(json_response(code, &body))
}

async fn stats(
    State(state): State<Arc<AppState>>,
    Query(params): Query<BlockParams>,
) -> Result<Response, AppError> {
    let block_number = parse_positive("block_number", params.block_number.as_deref())?;
    let stats = points::population_stats(state.db.as_ref(), OPERATOR_REGISTRY, block_number).await?;
    Ok(json_response(StatusCode::OK, &stats))
}

async fn all_points(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListingParams>,
) -> Result<Response, AppError> {
    let offset = parse_non_negative("offset", params.offset.as_deref())?;
    let limit = parse_positive("limit", params.limit.as_deref())?;
    let block_number = parse_positive("block_number", params.block_number.as_deref())?;

    match params.receiver_type.as_deref() {
        None | Some("") | Some(OPERATOR_RECEIVER) => {}
        Some(_) => return Ok(json_response(StatusCode::OK, &Vec::<ListingEntry>::new())),
    }

    let active =
        points::list_active_identities(state.db.as_ref(), OPERATOR_REGISTRY, block_number, limit, offset)
            .await?;
    let entries: Vec<ListingEntry> = active
        .into_iter()
        .map(|a| ListingEntry {
            address: a.delegate,
            receiver: OPERATOR_RECEIVER.to_string(),
            block_number,
            network_address: state.config.network_address.clone(),
            vault_address: a.vault,
            points: a.points,
        })
        .collect();

    Ok(json_response(StatusCode::OK, &entries))
}

async fn address_points(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
    Query(params): Query<BlockParams>,
) -> Result<Response, AppError> {
    let block_number = match params.block_number.as_deref() {
        None | Some("") => state.cursor.current_block().await?,
        raw => parse_positive("block_number", raw)?,
    };
    let key = normalize_identity(&address).map_err(|e| AppError::InvalidRequest(e.into()))?;
    let total_points = points::points_for_address(state.db.as_ref(), &key, block_number).await?;

    Ok(json_response(StatusCode::OK, &AddressPoints { address, block_number, total_points }))
}

async fn add_manual_entry(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    check_auth(&state.config, &headers)?;
    let req: ManualEntryRequest = parse_body(&body)?;

    let (Some(pubkey), Some(adder), Some(in_block)) = (req.pubkey, req.adder, req.in_block) else {
        return Err(AppError::invalid("missing or invalid required fields"));
    };
    if in_block == 0 {
        return Err(AppError::invalid("missing or invalid required fields"));
    }
    let registry = parse_registry(req.registry_type.as_deref())?;
    let identity = normalize_identity(&pubkey).map_err(|e| AppError::InvalidRequest(e.into()))?;
    let delegate = normalize_identity(&adder).map_err(|e| AppError::InvalidRequest(e.into()))?;

    let interval = NewInterval {
        registry,
        identity: identity.clone(),
        delegate: Some(delegate.clone()),
        vault: None,
        kind: EventKind::ManualEntry,
        opened_at: in_block,
    };
    let update = state.db.open_interval(&interval).await.map_err(manual_write_error)?;
    tracing::info!(
        "Manual entry for {registry} identity {identity} (adder {delegate}) at block {in_block}: {update:?}"
    );

    Ok(json_response(StatusCode::OK, &StatusResponse { status: "success".into() }))
}

async fn add_manual_opt_out(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    check_auth(&state.config, &headers)?;
    let req: ManualOptOutRequest = parse_body(&body)?;

    let (Some(pubkey), Some(adder), Some(out_block)) = (req.pubkey, req.adder, req.out_block) else {
        return Err(AppError::invalid("missing or invalid required fields"));
    };
    if out_block == 0 {
        return Err(AppError::invalid("missing or invalid required fields"));
    }
    let registry = parse_registry(req.registry_type.as_deref())?;
    let identity = normalize_identity(&pubkey).map_err(|e| AppError::InvalidRequest(e.into()))?;
    let adder = normalize_identity(&adder).map_err(|e| AppError::InvalidRequest(e.into()))?;

    let update = state
        .db
        .close_interval(registry, &identity, out_block)
        .await
        .map_err(manual_write_error)?;
    if update == IntervalUpdate::Replayed {
        tracing::debug!("Manual opt-out for {registry} identity {identity} was already applied");
    }
    tracing::info!(
        "Manual opt-out for {registry} identity {identity} (adder {adder}) at block {out_block}"
    );

    Ok(json_response(StatusCode::OK, &StatusResponse { status: "success".into() }))
}

/// Create the application router
pub fn app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    let body_size_limit = RequestBodyLimitLayer::new(MAX_ADMIN_BODY_SIZE);

    let admin = Router::new()
        .route("/admin/add_manual_entry", post(add_manual_entry))
        .route("/admin/add_manual_opt_out", post(add_manual_opt_out))
        .layer(body_size_limit);

    Router::new()
        .route("/health", get(health))
        .route("/last_block", get(last_block))
        .route("/stats", get(stats))
        .route("/all", get(all_points))
        .route("/:receiver_type/:receiver_address", get(receiver_points))
        .route("/:address", get(address_points))
        .merge(admin)
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_params() {
        assert_eq!(parse_positive("block_number", Some("10")).unwrap(), 10);
        assert!(matches!(parse_positive("block_number", None), Err(AppError::InvalidRequest(_))));
        assert!(parse_positive("block_number", Some("")).is_err());
        assert!(parse_positive("block_number", Some("0")).is_err());
        assert!(parse_positive("block_number", Some("-4")).is_err());
        assert!(parse_positive("block_number", Some("abc")).is_err());
        assert_eq!(parse_non_negative("offset", Some("0")).unwrap(), 0);
        assert!(parse_non_negative("offset", Some("-1")).is_err());
    }

    #[test]
    fn auth_header_checks() {
        let config = ApiConfig { auth_token: Some("secret".into()), ..Default::default() };
        let mut headers = HeaderMap::new();
        assert!(matches!(check_auth(&config, &headers), Err(AppError::Unauthorized(_))));

        headers.insert(header::AUTHORIZATION, "secret".parse().unwrap());
        assert!(check_auth(&config, &headers).is_err());

        headers.insert(header::AUTHORIZATION, "Bearer wrong".parse().unwrap());
        assert!(check_auth(&config, &headers).is_err());

        headers.insert(header::AUTHORIZATION, "Bearer secret".parse().unwrap());
        assert!(check_auth(&config, &headers).is_ok());

        let disabled = ApiConfig::default();
        assert!(check_auth(&disabled, &headers).is_err());
    }

    #[test]
    fn registry_defaults_to_vanilla() {
        assert_eq!(parse_registry(None).unwrap(), RegistryType::Vanilla);
        assert_eq!(parse_registry(Some("eigenlayer")).unwrap(), RegistryType::EigenLayer);
        assert!(parse_registry(Some("eigen")).is_err());
    }

    #[test]
    fn invalid_request_is_json_400() {
        let res = AppError::invalid("bad").into_response();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(res.headers()[header::CONTENT_TYPE], "application/json");
    }
}
