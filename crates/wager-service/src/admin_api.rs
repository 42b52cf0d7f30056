//! Operator endpoints. Role checks and audit records live in `AdminTools`;
//! handlers only resolve the caller and shape the payloads.

use crate::{ApiError, ServiceState};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use wager_adapters::BackupReceipt;
use wager_core::{
    authorize, AuditRecord, BetSlip, Dispute, DisputeResolution, EscrowCheck, FlagRequest,
    IntegrityReport, LedgerEntry, Money, QueryWindow, RegulatoryFlag, Role, SelectionStatus,
    SettlementOutcome, SUPERADMIN_ONLY,
};

const DEFAULT_AUDIT_PAGE: usize = 100;

pub fn routes() -> Router<ServiceState> {
    Router::new()
        .route("/v1/admin/payouts", post(manual_payout))
        .route("/v1/admin/bonuses", post(retention_bonus))
        .route("/v1/admin/slips/:slip_id/void", post(void_slip))
        .route("/v1/admin/slips/:slip_id/settle", post(settle_slip))
        .route("/v1/admin/disputes/:dispute_id/resolve", post(resolve_dispute))
        .route("/v1/admin/roles", post(elevate_role))
        .route("/v1/admin/flags", get(list_flags).post(raise_flag))
        .route("/v1/admin/flags/:flag_id/lift", post(lift_flag))
        .route("/v1/admin/regulatory/check", post(regulatory_check))
        .route("/v1/admin/audit", get(audit_log))
        .route("/v1/admin/integrity/:user_id/verify", post(verify_integrity))
        .route("/v1/admin/integrity/:user_id/release", post(release_integrity_hold))
        .route("/v1/admin/backups", post(create_backup))
}

#[derive(Debug, Clone, Deserialize)]
struct CreditBody {
    user_id: String,
    amount: Money,
    reason: String,
}

async fn manual_payout(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(body): Json<CreditBody>,
) -> Result<Json<LedgerEntry>, ApiError> {
    let caller = state.caller(&headers).await?;
    let entry = state
        .engine
        .admin()
        .manual_payout(&caller, &body.user_id, body.amount, &body.reason)
        .await?;
    Ok(Json(entry))
}

async fn retention_bonus(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(body): Json<CreditBody>,
) -> Result<Json<LedgerEntry>, ApiError> {
    let caller = state.caller(&headers).await?;
    let entry = state
        .engine
        .admin()
        .retention_bonus(&caller, &body.user_id, body.amount, &body.reason)
        .await?;
    Ok(Json(entry))
}

#[derive(Debug, Clone, Deserialize)]
struct VoidBody {
    reason: String,
}

async fn void_slip(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(slip_id): Path<Uuid>,
    Json(body): Json<VoidBody>,
) -> Result<Json<BetSlip>, ApiError> {
    let caller = state.caller(&headers).await?;
    if body.reason.trim().is_empty() {
        return Err(ApiError::bad_request("a void reason is required"));
    }
    Ok(Json(state.engine.admin().void_slip(&caller, slip_id, &body.reason).await?))
}

#[derive(Debug, Clone, Deserialize)]
struct SettleBody {
    outcomes: Vec<SelectionStatus>,
}

async fn settle_slip(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(slip_id): Path<Uuid>,
    Json(body): Json<SettleBody>,
) -> Result<Json<SettlementOutcome>, ApiError> {
    let caller = state.caller(&headers).await?;
    let outcome = state
        .engine
        .admin()
        .settle_slip(&caller, slip_id, &body.outcomes)
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Clone, Deserialize)]
struct ResolveBody {
    resolution: DisputeResolution,
    note: Option<String>,
}

async fn resolve_dispute(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(dispute_id): Path<Uuid>,
    Json(body): Json<ResolveBody>,
) -> Result<Json<Dispute>, ApiError> {
    let caller = state.caller(&headers).await?;
    let dispute = state
        .engine
        .admin()
        .resolve_dispute(&caller, dispute_id, &body.resolution, body.note)
        .await?;
    Ok(Json(dispute))
}

#[derive(Debug, Clone, Deserialize)]
struct RoleBody {
    user_id: String,
    role: Role,
}

#[derive(Debug, Clone, Serialize)]
struct RoleResponse {
    user_id: String,
    role: Role,
}

async fn elevate_role(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(body): Json<RoleBody>,
) -> Result<Json<RoleResponse>, ApiError> {
    let caller = state.caller(&headers).await?;
    let role = state
        .engine
        .admin()
        .elevate_role(&caller, &body.user_id, body.role)
        .await?;
    Ok(Json(RoleResponse {
        user_id: body.user_id,
        role,
    }))
}

async fn list_flags(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<Vec<RegulatoryFlag>>, ApiError> {
    let caller = state.caller(&headers).await?;
    wager_core::require_role(&caller, wager_core::ADMIN_ROLES, "list regulatory flags")?;
    Ok(Json(state.engine.regulatory().flags().await?))
}

async fn raise_flag(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<FlagRequest>,
) -> Result<(StatusCode, Json<RegulatoryFlag>), ApiError> {
    let caller = state.caller(&headers).await?;
    let flag = state.engine.admin().raise_flag(&caller, request).await?;
    Ok((StatusCode::CREATED, Json(flag)))
}

async fn lift_flag(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(flag_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let caller = state.caller(&headers).await?;
    state.engine.admin().lift_flag(&caller, flag_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn regulatory_check(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<EscrowCheck>, ApiError> {
    let caller = state.caller(&headers).await?;
    Ok(Json(state.engine.admin().run_regulatory_check(&caller).await?))
}

#[derive(Debug, Clone, Deserialize)]
struct AuditQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn audit_log(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditRecord>>, ApiError> {
    let caller = state.caller(&headers).await?;
    let window = QueryWindow {
        limit: query.limit.unwrap_or(DEFAULT_AUDIT_PAGE),
        offset: query.offset.unwrap_or(0),
    };
    Ok(Json(state.engine.admin().audit_log(&caller, window).await?))
}

async fn verify_integrity(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Json<IntegrityReport>, ApiError> {
    let caller = state.caller(&headers).await?;
    Ok(Json(state.engine.admin().verify_integrity(&caller, &user_id).await?))
}

#[derive(Debug, Clone, Deserialize)]
struct ReleaseBody {
    note: String,
}

async fn release_integrity_hold(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Json(body): Json<ReleaseBody>,
) -> Result<StatusCode, ApiError> {
    let caller = state.caller(&headers).await?;
    state
        .engine
        .admin()
        .release_integrity_hold(&caller, &user_id, &body.note)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_backup(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<BackupReceipt>), ApiError> {
    let caller = state.caller(&headers).await?;
    authorize(
        state.engine.store().as_ref(),
        &caller,
        SUPERADMIN_ONLY,
        "create_backup",
        "backups",
    )
    .await?;
    let manager = state.backups.as_ref().ok_or_else(|| ApiError::Http {
        status: StatusCode::SERVICE_UNAVAILABLE,
        message: "backups are not configured".to_string(),
    })?;
    let receipt = manager.create_backup().await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}
