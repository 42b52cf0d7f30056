//! Transactional store contract.
//!
//! Handlers share no memory, so every read-modify-write goes through a single
//! [`WriteSet`] applied all-or-nothing by [`WagerStore::commit`]. Status writes are
//! compare-and-swap on the expected status (slips also on their revision);
//! postings are sealed against the chain head read inside the same commit.

pub mod memory;
pub mod postgres;

use crate::audit::{AuditAppend, AuditRecord};
use crate::error::WagerError;
use crate::ledger::{AccountHead, LedgerEntry, LedgerQuery, PostingDraft};
use crate::types::{
    BetSlip, BetStatus, Dispute, DisputeStatus, EscrowTransfer, Money, RegulatoryFlag, Role,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub use memory::InMemoryWagerStore;
pub use postgres::PostgresWagerStore;

pub type WagerResult<T> = Result<T, WagerError>;

/// Table names understood by export/restore, in restore order.
pub const TABLES: [&str; 9] = [
    "roles",
    "platform",
    "balances",
    "ledger_entries",
    "slips",
    "disputes",
    "regulatory_flags",
    "escrow_transfers",
    "audit_log",
];

/// Generic query window for paged reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryWindow {
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone)]
pub enum SlipWrite {
    Insert(BetSlip),
    /// Replace the slip only if its stored status still equals `expected` and
    /// `slip.version` is exactly one past the stored version.
    Transition { expected: BetStatus, slip: BetSlip },
}

#[derive(Debug, Clone)]
pub enum DisputeWrite {
    /// Rejected when the slip already has an open dispute.
    Insert(Dispute),
    Transition {
        expected: DisputeStatus,
        dispute: Dispute,
    },
}

#[derive(Debug, Clone)]
pub enum FlagWrite {
    Insert(RegulatoryFlag),
    Lift {
        flag_id: Uuid,
        lifted_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
pub struct EscrowWrite {
    pub transfer: EscrowTransfer,
    /// One transfer per flag ever, instead of one per flag per day.
    pub once_per_flag: bool,
}

/// One atomic unit of work.
#[derive(Debug, Clone, Default)]
pub struct WriteSet {
    pub slip: Option<SlipWrite>,
    pub postings: Vec<PostingDraft>,
    pub dispute: Option<DisputeWrite>,
    pub flag: Option<FlagWrite>,
    pub escrow: Option<EscrowWrite>,
    pub role: Option<(String, Role)>,
    pub audit: Vec<AuditAppend>,
}

impl WriteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slip(mut self, write: SlipWrite) -> Self {
        self.slip = Some(write);
        self
    }

    pub fn posting(mut self, draft: PostingDraft) -> Self {
        self.postings.push(draft);
        self
    }

    pub fn dispute(mut self, write: DisputeWrite) -> Self {
        self.dispute = Some(write);
        self
    }

    pub fn flag(mut self, write: FlagWrite) -> Self {
        self.flag = Some(write);
        self
    }

    pub fn escrow(mut self, write: EscrowWrite) -> Self {
        self.escrow = Some(write);
        self
    }

    pub fn role(mut self, user_id: impl Into<String>, role: Role) -> Self {
        self.role = Some((user_id.into(), role));
        self
    }

    pub fn audit(mut self, event: AuditAppend) -> Self {
        self.audit.push(event);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommitReceipt {
    pub entries: Vec<LedgerEntry>,
    pub audit: Vec<AuditRecord>,
}

#[derive(Debug, Clone)]
pub enum CommitOutcome {
    Committed(CommitReceipt),
    /// A compare-and-swap precondition no longer held; nothing was written.
    Superseded(String),
}

impl CommitOutcome {
    pub fn committed(self) -> Option<CommitReceipt> {
        match self {
            Self::Committed(receipt) => Some(receipt),
            Self::Superseded(_) => None,
        }
    }
}

/// Row shape used for the `roles` table in exports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleRow {
    pub user_id: String,
    pub role: Role,
}

/// Row shape used for the `platform` table in exports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformRow {
    pub float: Money,
}

/// ACID store used by every engine component.
#[async_trait]
pub trait WagerStore: Send + Sync {
    fn backend_label(&self) -> &'static str;

    /// Apply a unit of work atomically.
    async fn commit(&self, writes: WriteSet) -> WagerResult<CommitOutcome>;

    async fn account(&self, user_id: &str) -> WagerResult<AccountHead>;

    async fn set_halted(&self, user_id: &str, halted: bool) -> WagerResult<()>;

    /// Full chain for one user ordered by entry number.
    async fn chain(&self, user_id: &str) -> WagerResult<Vec<LedgerEntry>>;

    /// Entries matching `query`, ordered by creation time then entry number.
    async fn ledger_entries(&self, query: &LedgerQuery) -> WagerResult<Vec<LedgerEntry>>;

    async fn slip(&self, slip_id: Uuid) -> WagerResult<Option<BetSlip>>;

    /// Non-terminal slips with at least one selection on `match_id`.
    async fn open_slips_for_match(&self, match_id: &str) -> WagerResult<Vec<BetSlip>>;

    async fn slips_for_user(&self, user_id: &str) -> WagerResult<Vec<BetSlip>>;

    async fn dispute(&self, dispute_id: Uuid) -> WagerResult<Option<Dispute>>;

    async fn disputes_for_slip(&self, slip_id: Uuid) -> WagerResult<Vec<Dispute>>;

    async fn flags(&self) -> WagerResult<Vec<RegulatoryFlag>>;

    async fn escrow_transfers(&self, flag_id: Option<Uuid>) -> WagerResult<Vec<EscrowTransfer>>;

    /// Seed the platform float once; returns the current value.
    async fn ensure_platform_float(&self, initial: Money) -> WagerResult<Money>;

    async fn platform_float(&self) -> WagerResult<Money>;

    async fn role_of(&self, user_id: &str) -> WagerResult<Role>;

    /// Append a standalone audit record (e.g. a denied privileged attempt).
    async fn append_audit(&self, event: AuditAppend) -> WagerResult<AuditRecord>;

    /// Audit records newest-first.
    async fn audit_log(&self, window: QueryWindow) -> WagerResult<Vec<AuditRecord>>;

    /// Dump one table as JSON rows for backups.
    async fn export_table(&self, table: &str) -> WagerResult<Vec<serde_json::Value>>;

    /// Every table in [`TABLES`], read from one consistent point in time.
    async fn export_snapshot(&self) -> WagerResult<BTreeMap<String, Vec<serde_json::Value>>>;

    /// Insert previously exported rows; rows already present are skipped.
    async fn restore_rows(&self, table: &str, rows: Vec<serde_json::Value>) -> WagerResult<usize>;
}

/// Storage backend configuration.
#[derive(Debug, Clone, Default)]
pub enum StorageConfig {
    /// Keep all state in process memory only.
    #[default]
    Memory,
    /// Persist in PostgreSQL; schema is created on connect.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

pub async fn connect_store(config: &StorageConfig) -> WagerResult<Arc<dyn WagerStore>> {
    match config {
        StorageConfig::Memory => Ok(Arc::new(InMemoryWagerStore::new())),
        StorageConfig::Postgres {
            database_url,
            max_connections,
        } => Ok(Arc::new(
            PostgresWagerStore::connect(database_url, *max_connections).await?,
        )),
    }
}

/// Run a read-then-commit unit of work, re-running it on optimistic chain conflicts.
pub async fn with_retry<T, F, Fut>(max_attempts: u32, mut unit_of_work: F) -> WagerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = WagerResult<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match unit_of_work().await {
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                debug!(attempt, error = %err, "unit of work conflicted; retrying");
                attempt += 1;
            }
            result => return result,
        }
    }
}

pub(crate) fn apply_window<T>(values: Vec<T>, window: QueryWindow) -> Vec<T> {
    let iter = values.into_iter().skip(window.offset);
    if window.limit == 0 {
        iter.collect()
    } else {
        iter.take(window.limit).collect()
    }
}

pub(crate) fn unknown_table(table: &str) -> WagerError {
    WagerError::validation(format!("unknown table '{table}'"))
}
