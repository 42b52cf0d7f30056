#![deny(unsafe_code)]

pub mod admin_api;
pub mod scheduler;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;
use wager_adapters::{
    AdapterError, BackupManager, DisabledSmsGateway, FixedOddsBook, HttpSmsGateway, HttpTicketDesk,
    InboxMessage, MemoryInbox, MemoryTicketDesk, NotificationDispatcher, NotifyingSink,
    SmsGateway, TicketDesk, TicketingSink,
};
use wager_core::{
    export_ledger, BetSlip, Caller, CashOutReceipt, Dispute, DisputeRequest, ExportFormat,
    LedgerEntry, LedgerQuery, MatchSettlementReport, Money, PlacementRequest, ResultEvent, Role,
    SelectionRequest, TransactionType, WagerEngine, WagerEngineConfig, WagerError, ADMIN_ROLES,
};

/// Header carrying the authenticated user id, set by the upstream gateway.
pub const CALLER_HEADER: &str = "x-user-id";

#[derive(Debug, Clone)]
pub struct BackupSettings {
    pub directory: PathBuf,
    pub passphrase: String,
}

#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub engine: WagerEngineConfig,
    pub sms_gateway_url: Option<String>,
    pub ticket_desk_url: Option<String>,
    pub backup: Option<BackupSettings>,
    /// Live price board consulted at placement; quotes are only age-checked without one.
    pub odds_book: Option<FixedOddsBook>,
}

#[derive(Clone)]
pub struct ServiceState {
    pub engine: Arc<WagerEngine>,
    pub inbox: MemoryInbox,
    pub backups: Option<Arc<BackupManager>>,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let ServiceConfig {
            engine: engine_config,
            sms_gateway_url,
            ticket_desk_url,
            backup,
            odds_book,
        } = config;

        let collaborator_timeout = Duration::from_secs(10);
        let sms: Arc<dyn SmsGateway> = match sms_gateway_url {
            Some(url) => Arc::new(HttpSmsGateway::new(url, collaborator_timeout)?),
            None => Arc::new(DisabledSmsGateway),
        };
        let desk: Arc<dyn TicketDesk> = match ticket_desk_url {
            Some(url) => Arc::new(HttpTicketDesk::new(url, collaborator_timeout)?),
            None => Arc::new(MemoryTicketDesk::new()),
        };
        let inbox = MemoryInbox::new();
        let dispatcher = NotificationDispatcher::new(sms, Arc::new(inbox.clone()));

        let mut builder = WagerEngine::builder(engine_config)
            .event_sink(Arc::new(NotifyingSink::new(dispatcher)))
            .event_sink(Arc::new(TicketingSink::new(desk)));
        if let Some(book) = odds_book {
            builder = builder.odds_source(Arc::new(book));
        }
        let engine = builder.build().await?;

        let backups = backup.map(|settings| {
            Arc::new(BackupManager::new(
                engine.store().clone(),
                settings.directory,
                &settings.passphrase,
            ))
        });

        Ok(Self {
            engine: Arc::new(engine),
            inbox,
            backups,
        })
    }

    /// Resolve the caller from the identity header and the stored role.
    pub async fn caller(&self, headers: &HeaderMap) -> Result<Caller, ApiError> {
        let user_id = headers
            .get(CALLER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ApiError::Http {
                status: StatusCode::UNAUTHORIZED,
                message: format!("missing {CALLER_HEADER} header"),
            })?;
        let role = self.engine.store().role_of(user_id).await?;
        Ok(Caller::new(user_id, role))
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/slips", post(place_slip))
        .route("/v1/slips/:slip_id", get(get_slip))
        .route("/v1/slips/:slip_id/cash-out", get(cash_out_quote).post(cash_out))
        .route("/v1/disputes", post(open_dispute))
        .route("/v1/disputes/:dispute_id", get(get_dispute))
        .route("/v1/balances/:user_id", get(get_balance))
        .route("/v1/wallet/deposit", post(deposit))
        .route("/v1/wallet/withdraw", post(withdraw))
        .route("/v1/inbox", get(inbox))
        .route("/v1/results", post(ingest_result))
        .route("/v1/ledger/export", get(export))
        .merge(admin_api::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("core engine error: {0}")]
    Core(#[from] WagerError),
    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Core(#[from] WagerError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

impl ApiError {
    pub(crate) fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            Self::Http { status, .. } => (*status, "http"),
            Self::Adapter(_) => (StatusCode::INTERNAL_SERVER_ERROR, "adapter"),
            Self::Core(err) => {
                let status = match err {
                    WagerError::Validation(_) | WagerError::Serialization(_) => StatusCode::BAD_REQUEST,
                    WagerError::Unauthorized { .. } => StatusCode::FORBIDDEN,
                    WagerError::NotFound(_) => StatusCode::NOT_FOUND,
                    WagerError::StateConflict(_) | WagerError::SequenceConflict { .. } => {
                        StatusCode::CONFLICT
                    }
                    WagerError::InsufficientFunds { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                    WagerError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                    WagerError::Integrity { .. } | WagerError::IntegrityHalt(_) => StatusCode::LOCKED,
                    WagerError::External { .. } | WagerError::Storage(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, err.kind())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        if status.is_server_error() {
            tracing::error!(error = %self, kind, "request failed");
        }
        (
            status,
            Json(serde_json::json!({ "error": self.to_string(), "kind": kind })),
        )
            .into_response()
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    backend: &'static str,
    event_sinks: Vec<String>,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "wager-service",
        backend: state.engine.store().backend_label(),
        event_sinks: state.engine.events().sink_names(),
    })
}

#[derive(Debug, Clone, Deserialize)]
struct PlaceSlipBody {
    stake: Money,
    currency: Option<String>,
    selections: Vec<SelectionRequest>,
}

async fn place_slip(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(body): Json<PlaceSlipBody>,
) -> Result<(StatusCode, Json<BetSlip>), ApiError> {
    let caller = state.caller(&headers).await?;
    let request = PlacementRequest {
        user_id: caller.user_id.clone(),
        stake: body.stake,
        currency: body
            .currency
            .unwrap_or_else(|| state.engine.config().currency.clone()),
        selections: body.selections,
    };
    let slip = state.engine.lifecycle().place(&caller, request).await?;
    Ok((StatusCode::CREATED, Json(slip)))
}

async fn get_slip(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(slip_id): Path<Uuid>,
) -> Result<Json<BetSlip>, ApiError> {
    let caller = state.caller(&headers).await?;
    Ok(Json(state.engine.lifecycle().owned_slip(&caller, slip_id).await?))
}

#[derive(Debug, Clone, Serialize)]
struct CashOutQuoteResponse {
    slip_id: Uuid,
    available: bool,
    amount: Option<Money>,
}

async fn cash_out_quote(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(slip_id): Path<Uuid>,
) -> Result<Json<CashOutQuoteResponse>, ApiError> {
    let caller = state.caller(&headers).await?;
    let amount = state.engine.lifecycle().cash_out_quote(&caller, slip_id).await?;
    Ok(Json(CashOutQuoteResponse {
        slip_id,
        available: amount.is_some(),
        amount,
    }))
}

async fn cash_out(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(slip_id): Path<Uuid>,
) -> Result<Json<CashOutReceipt>, ApiError> {
    let caller = state.caller(&headers).await?;
    Ok(Json(state.engine.lifecycle().cash_out(&caller, slip_id).await?))
}

async fn open_dispute(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<DisputeRequest>,
) -> Result<(StatusCode, Json<Dispute>), ApiError> {
    let caller = state.caller(&headers).await?;
    let dispute = state.engine.disputes().open(&caller, request).await?;
    Ok((StatusCode::CREATED, Json(dispute)))
}

async fn get_dispute(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(dispute_id): Path<Uuid>,
) -> Result<Json<Dispute>, ApiError> {
    let caller = state.caller(&headers).await?;
    let dispute = state.engine.disputes().dispute(dispute_id).await?;
    ensure_self_or_admin(&caller, &dispute.user_id, "view dispute")?;
    Ok(Json(dispute))
}

#[derive(Debug, Clone, Serialize)]
struct BalanceResponse {
    user_id: String,
    balance: Money,
    currency: String,
    entry_number: u64,
    halted: bool,
}

async fn get_balance(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let caller = state.caller(&headers).await?;
    ensure_self_or_admin(&caller, &user_id, "view balance")?;
    let head = state.engine.store().account(&user_id).await?;
    Ok(Json(BalanceResponse {
        user_id: head.user_id,
        balance: head.balance,
        currency: state.engine.balances().currency().to_string(),
        entry_number: head.entry_number,
        halted: head.halted,
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct WalletBody {
    amount: Money,
    reference: Option<String>,
}

async fn deposit(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(body): Json<WalletBody>,
) -> Result<Json<LedgerEntry>, ApiError> {
    let caller = state.caller(&headers).await?;
    let entry = state
        .engine
        .balances()
        .deposit(&caller.user_id, body.amount, body.reference)
        .await?;
    Ok(Json(entry))
}

async fn withdraw(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(body): Json<WalletBody>,
) -> Result<Json<LedgerEntry>, ApiError> {
    let caller = state.caller(&headers).await?;
    let entry = state
        .engine
        .balances()
        .withdraw(&caller.user_id, body.amount, body.reference)
        .await?;
    Ok(Json(entry))
}

async fn inbox(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<Vec<InboxMessage>>, ApiError> {
    let caller = state.caller(&headers).await?;
    Ok(Json(state.inbox.messages_for(&caller.user_id)))
}

/// Result feed intake; the feed authenticates as an admin identity.
async fn ingest_result(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(event): Json<ResultEvent>,
) -> Result<Json<MatchSettlementReport>, ApiError> {
    let caller = state.caller(&headers).await?;
    wager_core::require_role(&caller, ADMIN_ROLES, "ingest results")?;
    if event.match_id.trim().is_empty() {
        return Err(ApiError::bad_request("match_id is required"));
    }
    let report = state.engine.lifecycle().settle_match(&event).await?;
    info!(
        match_id = %report.match_id,
        examined = report.examined,
        failed = report.failed.len(),
        feed = %caller.user_id,
        "result ingested"
    );
    Ok(Json(report))
}

#[derive(Debug, Clone, Deserialize)]
struct ExportQuery {
    format: Option<String>,
    user_id: Option<String>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    transaction_type: Option<String>,
}

async fn export(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Query(query): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    let caller = state.caller(&headers).await?;
    match query.user_id.as_deref() {
        Some(user_id) => ensure_self_or_admin(&caller, user_id, "export ledger")?,
        None => wager_core::require_role(&caller, ADMIN_ROLES, "export ledger")?,
    }
    let format: ExportFormat = query.format.as_deref().unwrap_or("json").parse()?;
    let transaction_type = query
        .transaction_type
        .as_deref()
        .map(TransactionType::parse)
        .transpose()?;
    let ledger_query = LedgerQuery {
        user_id: query.user_id,
        from: query.from,
        to: query.to,
        transaction_type,
    };

    let export = export_ledger(state.engine.store().as_ref(), &ledger_query, format).await?;
    info!(caller = %caller.user_id, rows = export.rows, format = ?format, "ledger exported");
    Ok((
        [(header::CONTENT_TYPE, format.content_type())],
        export.body,
    )
        .into_response())
}

fn ensure_self_or_admin(caller: &Caller, user_id: &str, action: &str) -> Result<(), ApiError> {
    if caller.user_id == user_id || caller.role != Role::User {
        Ok(())
    } else {
        Err(WagerError::Unauthorized {
            caller: caller.user_id.clone(),
            action: action.to_string(),
        }
        .into())
    }
}
