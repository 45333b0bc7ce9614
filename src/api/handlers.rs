//! REST handlers. Errors map onto status codes the way the registry types
//! them: unknown account 404, ambiguous master 409, bad input 400, venue
//! failures 502.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::api::state::AppState;
use crate::db::NewAccount;
use crate::error::RegistryError;
use crate::models::{
    Account, AccountConfiguration, ConflictPolicy, Connection, DailyStats, FeatureConfig,
    Platform, ReplicatedTrade,
};

type ApiResult<T> = std::result::Result<Json<T>, (StatusCode, String)>;

fn registry_error(e: RegistryError) -> (StatusCode, String) {
    let status = match &e {
        RegistryError::AccountNotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::AmbiguousMaster(_) => StatusCode::CONFLICT,
        RegistryError::InvalidRiskMultiplier(_) => StatusCode::BAD_REQUEST,
        RegistryError::ConfigIncomplete(_) => StatusCode::CONFLICT,
        RegistryError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

fn internal(e: impl std::fmt::Display) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

// ==== Accounts ====

#[derive(Debug, Deserialize)]
pub struct CreateAccountRequest {
    pub name: String,
    pub platform: String,
    #[serde(default)]
    pub is_master: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "default_multiplier")]
    pub risk_multiplier: Decimal,
    pub conflict_policy: Option<String>,
    #[serde(default = "default_true")]
    pub allow_manual_trading: bool,
}

fn default_true() -> bool {
    true
}

fn default_multiplier() -> Decimal {
    dec!(1)
}

/// GET /api/accounts
pub async fn list_accounts(State(state): State<AppState>) -> ApiResult<Vec<Account>> {
    state
        .engine
        .registry()
        .list_accounts()
        .await
        .map(Json)
        .map_err(registry_error)
}

/// POST /api/accounts
pub async fn create_account(
    State(state): State<AppState>,
    Json(request): Json<CreateAccountRequest>,
) -> std::result::Result<(StatusCode, Json<Account>), (StatusCode, String)> {
    let platform = Platform::parse(&request.platform).ok_or((
        StatusCode::BAD_REQUEST,
        format!("unknown platform: {}", request.platform),
    ))?;
    let conflict_policy = match &request.conflict_policy {
        Some(raw) => ConflictPolicy::parse(raw).ok_or((
            StatusCode::BAD_REQUEST,
            format!("unknown conflict policy: {raw}"),
        ))?,
        None => ConflictPolicy::PauseReplication,
    };

    let account = state
        .engine
        .registry()
        .create_account(NewAccount {
            name: request.name,
            platform,
            is_master: request.is_master,
            is_active: request.is_active,
            risk_multiplier: request.risk_multiplier,
            conflict_policy,
            allow_manual_trading: request.allow_manual_trading,
        })
        .await
        .map_err(registry_error)?;

    Ok((StatusCode::CREATED, Json(account)))
}

/// DELETE /api/accounts/:id
pub async fn delete_account(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<serde_json::Value> {
    state
        .engine
        .registry()
        .delete_account(id)
        .await
        .map_err(registry_error)?;
    state.engine.forget_account(id).await;
    Ok(Json(json!({ "deleted": id })))
}

// ==== Account configuration ====

#[derive(Debug, Deserialize)]
pub struct ConfigurationPatch {
    pub server: Option<String>,
    pub login: Option<String>,
    pub password: Option<String>,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
}

/// GET /api/accounts/:id/configuration
pub async fn get_account_configuration(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<AccountConfiguration> {
    state
        .engine
        .registry()
        .configuration(id)
        .await
        .map(Json)
        .map_err(registry_error)
}

/// PATCH /api/accounts/:id/configuration; absent fields keep their value.
pub async fn patch_account_configuration(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(patch): Json<ConfigurationPatch>,
) -> ApiResult<AccountConfiguration> {
    state
        .engine
        .registry()
        .update_configuration(&AccountConfiguration {
            account_id: id,
            server: patch.server,
            login: patch.login,
            password: patch.password,
            api_key: patch.api_key,
            api_secret: patch.api_secret,
        })
        .await
        .map(Json)
        .map_err(registry_error)
}

// ==== Connections ====

#[derive(Debug, Deserialize)]
pub struct ConnectionActionRequest {
    pub account_id: i64,
}

#[derive(Debug, Serialize)]
pub struct PingResponse {
    pub account_id: i64,
    pub latency_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct ReconnectResponse {
    pub account_id: i64,
    pub server: String,
    pub account_label: String,
}

/// GET /api/connections
pub async fn list_connections(State(state): State<AppState>) -> ApiResult<Vec<Connection>> {
    state
        .engine
        .db()
        .list_connections()
        .await
        .map(Json)
        .map_err(internal)
}

/// POST /api/connections/test: one-off liveness probe.
pub async fn test_connection(
    State(state): State<AppState>,
    Json(request): Json<ConnectionActionRequest>,
) -> ApiResult<PingResponse> {
    let latency_ms = state
        .engine
        .test_connection(request.account_id)
        .await
        .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?;
    Ok(Json(PingResponse {
        account_id: request.account_id,
        latency_ms,
    }))
}

/// POST /api/connections/reconnect: manual re-drive of a disconnected
/// account, subject to the reconnect ceiling.
pub async fn reconnect_connection(
    State(state): State<AppState>,
    Json(request): Json<ConnectionActionRequest>,
) -> ApiResult<ReconnectResponse> {
    let handle = state
        .engine
        .reconnect_account(request.account_id)
        .await
        .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?;
    Ok(Json(ReconnectResponse {
        account_id: request.account_id,
        server: handle.server,
        account_label: handle.account_label,
    }))
}

// ==== Feature configuration ====

/// GET /api/configuration
pub async fn get_configuration(State(state): State<AppState>) -> ApiResult<FeatureConfig> {
    Ok(Json(state.engine.feature_config().await))
}

/// POST /api/configuration: full replacement. Toggling `is_mirror_active`
/// off makes subsequent master trades no-ops.
pub async fn update_configuration(
    State(state): State<AppState>,
    Json(config): Json<FeatureConfig>,
) -> ApiResult<FeatureConfig> {
    state
        .engine
        .update_feature_config(config)
        .await
        .map(Json)
        .map_err(internal)
}

// ==== Trade log ====

#[derive(Debug, Deserialize)]
pub struct TradeQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// GET /api/trades?limit&offset, newest first.
pub async fn list_trades(
    State(state): State<AppState>,
    Query(query): Query<TradeQuery>,
) -> ApiResult<Vec<ReplicatedTrade>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let offset = query.offset.unwrap_or(0).max(0);
    state
        .engine
        .db()
        .list_trades(limit, offset)
        .await
        .map(Json)
        .map_err(internal)
}

/// DELETE /api/trades
pub async fn clear_trades(State(state): State<AppState>) -> ApiResult<serde_json::Value> {
    let cleared = state.engine.db().clear_trades().await.map_err(internal)?;
    state.engine.broadcaster().trades_cleared();
    Ok(Json(json!({ "cleared": cleared })))
}

// ==== Stats ====

/// GET /api/stats/today
pub async fn get_today_stats(State(state): State<AppState>) -> ApiResult<DailyStats> {
    state
        .engine
        .stats()
        .for_date(Utc::now().date_naive())
        .await
        .map(Json)
        .map_err(internal)
}

// ==== Replication lifecycle ====

/// POST /api/replication/start
pub async fn start_replication(State(state): State<AppState>) -> ApiResult<serde_json::Value> {
    state.engine.dispatcher().start();
    Ok(Json(json!({ "running": true })))
}

/// POST /api/replication/stop
pub async fn stop_replication(State(state): State<AppState>) -> ApiResult<serde_json::Value> {
    state.engine.dispatcher().stop();
    Ok(Json(json!({ "running": false })))
}
