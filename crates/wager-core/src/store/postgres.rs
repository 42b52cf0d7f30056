//! PostgreSQL implementation of [`WagerStore`].
//!
//! Every [`WriteSet`] runs in one transaction. Account rows are locked with
//! `FOR UPDATE` in user order before postings are sealed, slip transitions are
//! conditioned on the expected status and revision, and uniqueness (open dispute per slip,
//! escrow per flag and day) is enforced by indexes.

use super::{
    unknown_table, CommitOutcome, CommitReceipt, DisputeWrite, FlagWrite, PlatformRow,
    QueryWindow, RoleRow, SlipWrite, WagerResult, WagerStore, WriteSet, TABLES,
};
use crate::audit::{seal_audit, AuditAppend, AuditRecord};
use crate::error::WagerError;
use crate::ledger::{seal, verify_tail, AccountHead, LedgerEntry, LedgerQuery};
use crate::types::{
    BetSlip, Dispute, EscrowTransfer, Money, RegulatoryFlag, Role, TransactionType,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{PgConnection, Postgres, Row, Transaction};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::warn;
use uuid::Uuid;

/// PostgreSQL-backed wager store.
#[derive(Clone)]
pub struct PostgresWagerStore {
    pool: PgPool,
}

impl PostgresWagerStore {
    /// Connect and initialize the schema.
    pub async fn connect(database_url: &str, max_connections: u32) -> WagerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| WagerError::Storage(format!("failed to connect postgres: {e}")))?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: PgPool) -> WagerResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn init_schema(&self) -> WagerResult<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS wager_accounts (
                user_id TEXT PRIMARY KEY,
                balance BIGINT NOT NULL,
                entry_number BIGINT NOT NULL,
                entry_hash TEXT,
                halted BOOLEAN NOT NULL DEFAULT FALSE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS wager_ledger_entries (
                entry_id UUID PRIMARY KEY,
                user_id TEXT NOT NULL,
                entry_number BIGINT NOT NULL,
                transaction_type TEXT NOT NULL,
                amount BIGINT NOT NULL,
                currency TEXT NOT NULL,
                balance_before BIGINT NOT NULL,
                balance_after BIGINT NOT NULL,
                description TEXT NOT NULL,
                reference_type TEXT,
                reference_id TEXT,
                previous_hash TEXT,
                entry_hash TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                UNIQUE (user_id, entry_number)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS wager_slips (
                slip_id UUID PRIMARY KEY,
                user_id TEXT NOT NULL,
                status TEXT NOT NULL,
                slip JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                version BIGINT NOT NULL DEFAULT 0
            )
            "#,
            r#"
            ALTER TABLE wager_slips ADD COLUMN IF NOT EXISTS version BIGINT NOT NULL DEFAULT 0
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS wager_disputes (
                dispute_id UUID PRIMARY KEY,
                slip_id UUID NOT NULL,
                status TEXT NOT NULL,
                dispute JSONB NOT NULL,
                opened_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS wager_disputes_one_open_per_slip
                ON wager_disputes (slip_id) WHERE status = 'open'
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS wager_flags (
                flag_id UUID PRIMARY KEY,
                flag JSONB NOT NULL,
                effective_from TIMESTAMPTZ NOT NULL,
                lifted_at TIMESTAMPTZ
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS wager_escrow_transfers (
                transfer_id UUID PRIMARY KEY,
                flag_id UUID NOT NULL,
                transfer_day DATE NOT NULL,
                transfer JSONB NOT NULL,
                completed_at TIMESTAMPTZ NOT NULL,
                UNIQUE (flag_id, transfer_day)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS wager_audit_log (
                sequence BIGINT PRIMARY KEY,
                record JSONB NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS wager_roles (
                user_id TEXT PRIMARY KEY,
                role TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS wager_platform (
                id SMALLINT PRIMARY KEY CHECK (id = 1),
                float BIGINT NOT NULL
            )
            "#,
        ];

        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| WagerError::Storage(format!("schema init failed: {e}")))?;
        }
        Ok(())
    }

    async fn begin(&self) -> WagerResult<Transaction<'static, Postgres>> {
        self.pool.begin().await.map_err(backend)
    }
}

#[async_trait]
impl WagerStore for PostgresWagerStore {
    fn backend_label(&self) -> &'static str {
        "postgres"
    }

    async fn commit(&self, writes: WriteSet) -> WagerResult<CommitOutcome> {
        let mut tx = self.begin().await?;

        if let Some(write) = &writes.slip {
            if let Some(reason) = write_slip(&mut *tx, write).await? {
                tx.rollback().await.map_err(backend)?;
                return Ok(CommitOutcome::Superseded(reason));
            }
        }
        if let Some(write) = &writes.dispute {
            if let Some(reason) = write_dispute(&mut *tx, write).await? {
                tx.rollback().await.map_err(backend)?;
                return Ok(CommitOutcome::Superseded(reason));
            }
        }
        if let Some(write) = &writes.flag {
            if let Some(reason) = write_flag(&mut *tx, write).await? {
                tx.rollback().await.map_err(backend)?;
                return Ok(CommitOutcome::Superseded(reason));
            }
        }
        if let Some(write) = &writes.escrow {
            if let Some(reason) = write_escrow(&mut *tx, &write.transfer, write.once_per_flag).await? {
                tx.rollback().await.map_err(backend)?;
                return Ok(CommitOutcome::Superseded(reason));
            }
        }
        if let Some((user_id, role)) = &writes.role {
            sqlx::query(
                r#"
                INSERT INTO wager_roles (user_id, role) VALUES ($1, $2)
                ON CONFLICT (user_id) DO UPDATE SET role = EXCLUDED.role
                "#,
            )
            .bind(user_id)
            .bind(role.as_str())
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        }

        // Lock every touched account in a stable order before sealing.
        let users: BTreeSet<&str> = writes
            .postings
            .iter()
            .map(|draft| draft.user_id.as_str())
            .collect();
        let mut heads: HashMap<String, AccountHead> = HashMap::new();
        for user_id in users {
            let head = lock_account(&mut *tx, user_id).await?;
            if !head.halted {
                let tail = chain_tail(&mut *tx, user_id).await?;
                if let Err(err) = verify_tail(&head, tail.as_ref()) {
                    tx.rollback().await.map_err(backend)?;
                    warn!(user_id, error = %err, "account head diverged from ledger; halting writes");
                    self.set_halted(user_id, true).await?;
                    return Err(err);
                }
            }
            heads.insert(user_id.to_string(), head);
        }

        let now = Utc::now();
        let mut sealed = Vec::with_capacity(writes.postings.len());
        for draft in &writes.postings {
            let head = heads
                .get(&draft.user_id)
                .cloned()
                .unwrap_or_else(|| AccountHead::empty(&draft.user_id));
            let entry = seal(draft, &head, now)?;
            insert_entry(&mut *tx, &entry).await.map_err(map_sqlx_conflict)?;
            heads.insert(draft.user_id.clone(), head.advanced(&entry));
            sealed.push(entry);
        }
        for head in heads.values() {
            sqlx::query(
                r#"
                UPDATE wager_accounts
                   SET balance = $2, entry_number = $3, entry_hash = $4
                 WHERE user_id = $1
                "#,
            )
            .bind(&head.user_id)
            .bind(head.balance)
            .bind(to_i64(head.entry_number)?)
            .bind(&head.entry_hash)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        }

        let mut audit = Vec::with_capacity(writes.audit.len());
        if !writes.audit.is_empty() {
            let mut previous = lock_audit_tail(&mut *tx).await?;
            for event in writes.audit {
                let record = seal_audit(event, previous.as_ref());
                insert_audit(&mut *tx, &record).await?;
                previous = Some(record.clone());
                audit.push(record);
            }
        }

        tx.commit().await.map_err(backend)?;
        Ok(CommitOutcome::Committed(CommitReceipt {
            entries: sealed,
            audit,
        }))
    }

    async fn account(&self, user_id: &str) -> WagerResult<AccountHead> {
        let row = sqlx::query(
            "SELECT user_id, balance, entry_number, entry_hash, halted FROM wager_accounts WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        match row {
            Some(row) => account_from_row(&row),
            None => Ok(AccountHead::empty(user_id)),
        }
    }

    async fn set_halted(&self, user_id: &str, halted: bool) -> WagerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO wager_accounts (user_id, balance, entry_number, entry_hash, halted)
            VALUES ($1, 0, 0, NULL, $2)
            ON CONFLICT (user_id) DO UPDATE SET halted = EXCLUDED.halted
            "#,
        )
        .bind(user_id)
        .bind(halted)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn chain(&self, user_id: &str) -> WagerResult<Vec<LedgerEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM wager_ledger_entries
             WHERE user_id = $1
             ORDER BY entry_number ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn ledger_entries(&self, query: &LedgerQuery) -> WagerResult<Vec<LedgerEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM wager_ledger_entries
             WHERE ($1::TEXT IS NULL OR user_id = $1)
               AND ($2::TIMESTAMPTZ IS NULL OR created_at >= $2)
               AND ($3::TIMESTAMPTZ IS NULL OR created_at < $3)
               AND ($4::TEXT IS NULL OR transaction_type = $4)
             ORDER BY created_at ASC, user_id ASC, entry_number ASC
            "#,
        )
        .bind(query.user_id.as_deref())
        .bind(query.from)
        .bind(query.to)
        .bind(query.transaction_type.map(|kind| kind.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn slip(&self, slip_id: Uuid) -> WagerResult<Option<BetSlip>> {
        let row = sqlx::query("SELECT slip FROM wager_slips WHERE slip_id = $1")
            .bind(slip_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(|row| json_column(&row, "slip")).transpose()
    }

    async fn open_slips_for_match(&self, match_id: &str) -> WagerResult<Vec<BetSlip>> {
        let rows = sqlx::query(
            r#"
            SELECT slip FROM wager_slips
             WHERE status IN ('pending', 'pending_settlement')
               AND slip->'selections' @> jsonb_build_array(jsonb_build_object('match_id', $1::TEXT))
             ORDER BY created_at ASC
            "#,
        )
        .bind(match_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(|row| json_column(row, "slip")).collect()
    }

    async fn slips_for_user(&self, user_id: &str) -> WagerResult<Vec<BetSlip>> {
        let rows = sqlx::query(
            "SELECT slip FROM wager_slips WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(|row| json_column(row, "slip")).collect()
    }

    async fn dispute(&self, dispute_id: Uuid) -> WagerResult<Option<Dispute>> {
        let row = sqlx::query("SELECT dispute FROM wager_disputes WHERE dispute_id = $1")
            .bind(dispute_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(|row| json_column(&row, "dispute")).transpose()
    }

    async fn disputes_for_slip(&self, slip_id: Uuid) -> WagerResult<Vec<Dispute>> {
        let rows = sqlx::query(
            "SELECT dispute FROM wager_disputes WHERE slip_id = $1 ORDER BY opened_at ASC",
        )
        .bind(slip_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(|row| json_column(row, "dispute")).collect()
    }

    async fn flags(&self) -> WagerResult<Vec<RegulatoryFlag>> {
        let rows = sqlx::query(
            "SELECT flag, lifted_at FROM wager_flags ORDER BY effective_from ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(flag_from_row).collect()
    }

    async fn escrow_transfers(&self, flag_id: Option<Uuid>) -> WagerResult<Vec<EscrowTransfer>> {
        let rows = sqlx::query(
            r#"
            SELECT transfer FROM wager_escrow_transfers
             WHERE ($1::UUID IS NULL OR flag_id = $1)
             ORDER BY completed_at ASC
            "#,
        )
        .bind(flag_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(|row| json_column(row, "transfer")).collect()
    }

    async fn ensure_platform_float(&self, initial: Money) -> WagerResult<Money> {
        sqlx::query("INSERT INTO wager_platform (id, float) VALUES (1, $1) ON CONFLICT (id) DO NOTHING")
            .bind(initial)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        self.platform_float().await
    }

    async fn platform_float(&self) -> WagerResult<Money> {
        let float: Option<i64> = sqlx::query_scalar("SELECT float FROM wager_platform WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(float.unwrap_or_default())
    }

    async fn role_of(&self, user_id: &str) -> WagerResult<Role> {
        let role: Option<String> = sqlx::query_scalar("SELECT role FROM wager_roles WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        role.map(|role| Role::parse(&role))
            .transpose()
            .map(|role| role.unwrap_or(Role::User))
    }

    async fn append_audit(&self, event: AuditAppend) -> WagerResult<AuditRecord> {
        let mut tx = self.begin().await?;
        let previous = lock_audit_tail(&mut *tx).await?;
        let record = seal_audit(event, previous.as_ref());
        insert_audit(&mut *tx, &record).await?;
        tx.commit().await.map_err(backend)?;
        Ok(record)
    }

    async fn audit_log(&self, window: QueryWindow) -> WagerResult<Vec<AuditRecord>> {
        let limit = if window.limit == 0 {
            None
        } else {
            Some(usize_to_i64(window.limit)?)
        };
        let rows = sqlx::query(
            r#"
            SELECT record FROM wager_audit_log
             ORDER BY sequence DESC
             LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(usize_to_i64(window.offset)?)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(|row| json_column(row, "record")).collect()
    }

    async fn export_table(&self, table: &str) -> WagerResult<Vec<serde_json::Value>> {
        let mut conn = self.pool.acquire().await.map_err(backend)?;
        export_rows(&mut *conn, table).await
    }

    async fn export_snapshot(&self) -> WagerResult<BTreeMap<String, Vec<serde_json::Value>>> {
        let mut tx = self.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        let mut snapshot = BTreeMap::new();
        for table in TABLES {
            snapshot.insert(table.to_string(), export_rows(&mut *tx, table).await?);
        }
        tx.commit().await.map_err(backend)?;
        Ok(snapshot)
    }

    async fn restore_rows(&self, table: &str, rows: Vec<serde_json::Value>) -> WagerResult<usize> {
        let mut tx = self.begin().await?;
        let mut inserted: u64 = 0;
        match table {
            "roles" => {
                for row in from_rows::<RoleRow>(rows)? {
                    inserted += sqlx::query(
                        "INSERT INTO wager_roles (user_id, role) VALUES ($1, $2) ON CONFLICT DO NOTHING",
                    )
                    .bind(&row.user_id)
                    .bind(row.role.as_str())
                    .execute(&mut *tx)
                    .await
                    .map_err(backend)?
                    .rows_affected();
                }
            }
            "platform" => {
                for row in from_rows::<PlatformRow>(rows)? {
                    inserted += sqlx::query(
                        "INSERT INTO wager_platform (id, float) VALUES (1, $1) ON CONFLICT DO NOTHING",
                    )
                    .bind(row.float)
                    .execute(&mut *tx)
                    .await
                    .map_err(backend)?
                    .rows_affected();
                }
            }
            "balances" => {
                for head in from_rows::<AccountHead>(rows)? {
                    inserted += sqlx::query(
                        r#"
                        INSERT INTO wager_accounts (user_id, balance, entry_number, entry_hash, halted)
                        VALUES ($1, $2, $3, $4, $5)
                        ON CONFLICT DO NOTHING
                        "#,
                    )
                    .bind(&head.user_id)
                    .bind(head.balance)
                    .bind(to_i64(head.entry_number)?)
                    .bind(&head.entry_hash)
                    .bind(head.halted)
                    .execute(&mut *tx)
                    .await
                    .map_err(backend)?
                    .rows_affected();
                }
            }
            "ledger_entries" => {
                for entry in from_rows::<LedgerEntry>(rows)? {
                    inserted += insert_entry(&mut *tx, &entry).await.map_err(backend)?;
                }
            }
            "slips" => {
                for slip in from_rows::<BetSlip>(rows)? {
                    inserted += sqlx::query(
                        r#"
                        INSERT INTO wager_slips (slip_id, user_id, status, slip, created_at, version)
                        VALUES ($1, $2, $3, $4, $5, $6)
                        ON CONFLICT DO NOTHING
                        "#,
                    )
                    .bind(slip.slip_id)
                    .bind(&slip.user_id)
                    .bind(slip.status.as_str())
                    .bind(serde_json::to_value(&slip)?)
                    .bind(slip.created_at)
                    .bind(slip.version as i64)
                    .execute(&mut *tx)
                    .await
                    .map_err(backend)?
                    .rows_affected();
                }
            }
            "disputes" => {
                for dispute in from_rows::<Dispute>(rows)? {
                    inserted += sqlx::query(
                        r#"
                        INSERT INTO wager_disputes (dispute_id, slip_id, status, dispute, opened_at)
                        VALUES ($1, $2, $3, $4, $5)
                        ON CONFLICT DO NOTHING
                        "#,
                    )
                    .bind(dispute.dispute_id)
                    .bind(dispute.slip_id)
                    .bind(dispute.status.as_str())
                    .bind(serde_json::to_value(&dispute)?)
                    .bind(dispute.opened_at)
                    .execute(&mut *tx)
                    .await
                    .map_err(backend)?
                    .rows_affected();
                }
            }
            "regulatory_flags" => {
                for flag in from_rows::<RegulatoryFlag>(rows)? {
                    inserted += insert_flag(&mut *tx, &flag, true).await?;
                }
            }
            "escrow_transfers" => {
                for transfer in from_rows::<EscrowTransfer>(rows)? {
                    inserted += insert_transfer(&mut *tx, &transfer).await?;
                }
            }
            "audit_log" => {
                for record in from_rows::<AuditRecord>(rows)? {
                    inserted += sqlx::query(
                        "INSERT INTO wager_audit_log (sequence, record) VALUES ($1, $2) ON CONFLICT DO NOTHING",
                    )
                    .bind(to_i64(record.sequence)?)
                    .bind(serde_json::to_value(&record)?)
                    .execute(&mut *tx)
                    .await
                    .map_err(backend)?
                    .rows_affected();
                }
            }
            other => return Err(unknown_table(other)),
        }
        tx.commit().await.map_err(backend)?;
        usize::try_from(inserted).map_err(|_| WagerError::Storage("row count overflow".to_string()))
    }
}

async fn export_rows(conn: &mut PgConnection, table: &str) -> WagerResult<Vec<serde_json::Value>> {
    let rows = match table {
        "roles" => {
            let rows = sqlx::query("SELECT user_id, role FROM wager_roles ORDER BY user_id")
                .fetch_all(&mut *conn)
                .await
                .map_err(backend)?;
            let mut values = Vec::with_capacity(rows.len());
            for row in rows {
                let role: String = row.try_get("role").map_err(backend)?;
                values.push(serde_json::to_value(RoleRow {
                    user_id: row.try_get("user_id").map_err(backend)?,
                    role: Role::parse(&role)?,
                })?);
            }
            values
        }
        "platform" => {
            let float: Option<i64> =
                sqlx::query_scalar("SELECT float FROM wager_platform WHERE id = 1")
                    .fetch_optional(&mut *conn)
                    .await
                    .map_err(backend)?;
            float
                .map(|float| serde_json::to_value(PlatformRow { float }))
                .into_iter()
                .collect::<Result<Vec<_>, _>>()?
        }
        "balances" => {
            let rows = sqlx::query(
                "SELECT user_id, balance, entry_number, entry_hash, halted FROM wager_accounts ORDER BY user_id",
            )
            .fetch_all(&mut *conn)
            .await
            .map_err(backend)?;
            rows.iter()
                .map(|row| account_from_row(row).and_then(to_json))
                .collect::<WagerResult<Vec<_>>>()?
        }
        "ledger_entries" => {
            let rows = sqlx::query(
                "SELECT * FROM wager_ledger_entries ORDER BY user_id, entry_number",
            )
            .fetch_all(&mut *conn)
            .await
            .map_err(backend)?;
            rows.iter()
                .map(|row| entry_from_row(row).and_then(to_json))
                .collect::<WagerResult<Vec<_>>>()?
        }
        "slips" => json_rows(&mut *conn, "SELECT slip AS doc FROM wager_slips ORDER BY created_at").await?,
        "disputes" => {
            json_rows(&mut *conn, "SELECT dispute AS doc FROM wager_disputes ORDER BY opened_at")
                .await?
        }
        "regulatory_flags" => {
            let rows = sqlx::query(
                "SELECT flag, lifted_at FROM wager_flags ORDER BY effective_from",
            )
            .fetch_all(&mut *conn)
            .await
            .map_err(backend)?;
            rows.iter()
                .map(|row| flag_from_row(row).and_then(to_json))
                .collect::<WagerResult<Vec<_>>>()?
        }
        "escrow_transfers" => {
            json_rows(
                &mut *conn,
                "SELECT transfer AS doc FROM wager_escrow_transfers ORDER BY completed_at",
            )
            .await?
        }
        "audit_log" => {
            json_rows(&mut *conn, "SELECT record AS doc FROM wager_audit_log ORDER BY sequence")
                .await?
        }
        other => return Err(unknown_table(other)),
    };
    Ok(rows)
}

async fn json_rows(conn: &mut PgConnection, sql: &str) -> WagerResult<Vec<serde_json::Value>> {
    let rows = sqlx::query(sql)
        .fetch_all(&mut *conn)
        .await
        .map_err(backend)?;
    rows.iter()
        .map(|row| row.try_get::<serde_json::Value, _>("doc").map_err(backend))
        .collect()
}

/// Returns a supersede reason when the status or revision precondition no longer holds.
async fn write_slip(conn: &mut PgConnection, write: &SlipWrite) -> WagerResult<Option<String>> {
    match write {
        SlipWrite::Insert(slip) => {
            sqlx::query(
                r#"
                INSERT INTO wager_slips (slip_id, user_id, status, slip, created_at, version)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(slip.slip_id)
            .bind(&slip.user_id)
            .bind(slip.status.as_str())
            .bind(serde_json::to_value(slip)?)
            .bind(slip.created_at)
            .bind(slip.version as i64)
            .execute(&mut *conn)
            .await
            .map_err(map_sqlx_conflict)?;
            Ok(None)
        }
        SlipWrite::Transition { expected, slip } => {
            let result = sqlx::query(
                r#"
                UPDATE wager_slips
                   SET status = $2, slip = $3, version = $5
                 WHERE slip_id = $1
                   AND status = $4
                   AND version = $6
                "#,
            )
            .bind(slip.slip_id)
            .bind(slip.status.as_str())
            .bind(serde_json::to_value(slip)?)
            .bind(expected.as_str())
            .bind(slip.version as i64)
            .bind(slip.version as i64 - 1)
            .execute(&mut *conn)
            .await
            .map_err(backend)?;

            if result.rows_affected() > 0 {
                return Ok(None);
            }
            let current: Option<(String, i64)> =
                sqlx::query_as("SELECT status, version FROM wager_slips WHERE slip_id = $1")
                    .bind(slip.slip_id)
                    .fetch_optional(&mut *conn)
                    .await
                    .map_err(backend)?;
            match current {
                Some((status, _)) if status != expected.as_str() => Ok(Some(format!(
                    "slip {} is '{}', expected '{}'",
                    slip.slip_id, status, expected
                ))),
                Some((_, version)) => Ok(Some(format!(
                    "slip {} is at revision {}, write was based on {}",
                    slip.slip_id,
                    version,
                    slip.version.saturating_sub(1)
                ))),
                None => Err(WagerError::not_found("slip", slip.slip_id)),
            }
        }
    }
}

async fn write_dispute(
    conn: &mut PgConnection,
    write: &DisputeWrite,
) -> WagerResult<Option<String>> {
    match write {
        DisputeWrite::Insert(dispute) => {
            sqlx::query(
                r#"
                INSERT INTO wager_disputes (dispute_id, slip_id, status, dispute, opened_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(dispute.dispute_id)
            .bind(dispute.slip_id)
            .bind(dispute.status.as_str())
            .bind(serde_json::to_value(dispute)?)
            .bind(dispute.opened_at)
            .execute(&mut *conn)
            .await
            .map_err(|e| match map_sqlx_conflict(e) {
                WagerError::StateConflict(_) => WagerError::StateConflict(format!(
                    "slip {} already has an open dispute",
                    dispute.slip_id
                )),
                other => other,
            })?;
            Ok(None)
        }
        DisputeWrite::Transition { expected, dispute } => {
            let result = sqlx::query(
                r#"
                UPDATE wager_disputes
                   SET status = $2, dispute = $3
                 WHERE dispute_id = $1
                   AND status = $4
                "#,
            )
            .bind(dispute.dispute_id)
            .bind(dispute.status.as_str())
            .bind(serde_json::to_value(dispute)?)
            .bind(expected.as_str())
            .execute(&mut *conn)
            .await
            .map_err(backend)?;

            if result.rows_affected() > 0 {
                return Ok(None);
            }
            let current: Option<String> =
                sqlx::query_scalar("SELECT status FROM wager_disputes WHERE dispute_id = $1")
                    .bind(dispute.dispute_id)
                    .fetch_optional(&mut *conn)
                    .await
                    .map_err(backend)?;
            match current {
                Some(status) => Ok(Some(format!(
                    "dispute {} is '{}'",
                    dispute.dispute_id, status
                ))),
                None => Err(WagerError::not_found("dispute", dispute.dispute_id)),
            }
        }
    }
}

async fn write_flag(conn: &mut PgConnection, write: &FlagWrite) -> WagerResult<Option<String>> {
    match write {
        FlagWrite::Insert(flag) => {
            insert_flag(conn, flag, false).await?;
            Ok(None)
        }
        FlagWrite::Lift { flag_id, lifted_at } => {
            let result = sqlx::query(
                "UPDATE wager_flags SET lifted_at = $2 WHERE flag_id = $1 AND lifted_at IS NULL",
            )
            .bind(flag_id)
            .bind(lifted_at)
            .execute(&mut *conn)
            .await
            .map_err(backend)?;
            if result.rows_affected() > 0 {
                return Ok(None);
            }
            let exists: Option<Uuid> =
                sqlx::query_scalar("SELECT flag_id FROM wager_flags WHERE flag_id = $1")
                    .bind(flag_id)
                    .fetch_optional(&mut *conn)
                    .await
                    .map_err(backend)?;
            match exists {
                Some(_) => Ok(Some(format!("flag {flag_id} already lifted"))),
                None => Err(WagerError::not_found("flag", flag_id)),
            }
        }
    }
}

async fn write_escrow(
    conn: &mut PgConnection,
    transfer: &EscrowTransfer,
    once_per_flag: bool,
) -> WagerResult<Option<String>> {
    let float: Option<i64> =
        sqlx::query_scalar("SELECT float FROM wager_platform WHERE id = 1 FOR UPDATE")
            .fetch_optional(&mut *conn)
            .await
            .map_err(backend)?;
    let float = float.unwrap_or_default();
    if float != transfer.float_before {
        return Ok(Some(format!(
            "platform float moved from {} to {}",
            transfer.float_before, float
        )));
    }

    if once_per_flag {
        let prior: Option<Uuid> = sqlx::query_scalar(
            "SELECT transfer_id FROM wager_escrow_transfers WHERE flag_id = $1 LIMIT 1",
        )
        .bind(transfer.flag_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(backend)?;
        if prior.is_some() {
            return Ok(Some(format!("flag {} already transferred", transfer.flag_id)));
        }
    }

    if insert_transfer(conn, transfer).await? == 0 {
        return Ok(Some(format!(
            "flag {} already transferred for {}",
            transfer.flag_id, transfer.transfer_day
        )));
    }

    sqlx::query("UPDATE wager_platform SET float = $1 WHERE id = 1")
        .bind(transfer.float_after)
        .execute(&mut *conn)
        .await
        .map_err(backend)?;
    Ok(None)
}

async fn insert_transfer(conn: &mut PgConnection, transfer: &EscrowTransfer) -> WagerResult<u64> {
    Ok(sqlx::query(
        r#"
        INSERT INTO wager_escrow_transfers (transfer_id, flag_id, transfer_day, transfer, completed_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(transfer.transfer_id)
    .bind(transfer.flag_id)
    .bind(transfer.transfer_day)
    .bind(serde_json::to_value(transfer)?)
    .bind(transfer.completed_at)
    .execute(&mut *conn)
    .await
    .map_err(backend)?
    .rows_affected())
}

async fn insert_flag(
    conn: &mut PgConnection,
    flag: &RegulatoryFlag,
    skip_existing: bool,
) -> WagerResult<u64> {
    let sql = if skip_existing {
        "INSERT INTO wager_flags (flag_id, flag, effective_from, lifted_at) VALUES ($1, $2, $3, $4) ON CONFLICT DO NOTHING"
    } else {
        "INSERT INTO wager_flags (flag_id, flag, effective_from, lifted_at) VALUES ($1, $2, $3, $4)"
    };
    Ok(sqlx::query(sql)
        .bind(flag.flag_id)
        .bind(serde_json::to_value(flag)?)
        .bind(flag.effective_from)
        .bind(flag.lifted_at)
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx_conflict)?
        .rows_affected())
}

async fn lock_account(conn: &mut PgConnection, user_id: &str) -> WagerResult<AccountHead> {
    sqlx::query(
        r#"
        INSERT INTO wager_accounts (user_id, balance, entry_number, entry_hash, halted)
        VALUES ($1, 0, 0, NULL, FALSE)
        ON CONFLICT (user_id) DO NOTHING
        "#,
    )
    .bind(user_id)
    .execute(&mut *conn)
    .await
    .map_err(backend)?;

    let row = sqlx::query(
        r#"
        SELECT user_id, balance, entry_number, entry_hash, halted
          FROM wager_accounts
         WHERE user_id = $1
         FOR UPDATE
        "#,
    )
    .bind(user_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(backend)?;
    account_from_row(&row)
}

async fn chain_tail(conn: &mut PgConnection, user_id: &str) -> WagerResult<Option<LedgerEntry>> {
    let row = sqlx::query(
        r#"
        SELECT * FROM wager_ledger_entries
         WHERE user_id = $1
         ORDER BY entry_number DESC
         LIMIT 1
        "#,
    )
    .bind(user_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(backend)?;
    row.as_ref().map(entry_from_row).transpose()
}

async fn insert_entry(conn: &mut PgConnection, entry: &LedgerEntry) -> Result<u64, sqlx::Error> {
    let entry_number = i64::try_from(entry.entry_number)
        .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
    Ok(sqlx::query(
        r#"
        INSERT INTO wager_ledger_entries
            (entry_id, user_id, entry_number, transaction_type, amount, currency,
             balance_before, balance_after, description, reference_type, reference_id,
             previous_hash, entry_hash, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        ON CONFLICT (entry_id) DO NOTHING
        "#,
    )
    .bind(entry.entry_id)
    .bind(&entry.user_id)
    .bind(entry_number)
    .bind(entry.transaction_type.as_str())
    .bind(entry.amount)
    .bind(&entry.currency)
    .bind(entry.balance_before)
    .bind(entry.balance_after)
    .bind(&entry.description)
    .bind(&entry.reference_type)
    .bind(&entry.reference_id)
    .bind(&entry.previous_hash)
    .bind(&entry.entry_hash)
    .bind(entry.created_at)
    .execute(&mut *conn)
    .await?
    .rows_affected())
}

async fn lock_audit_tail(conn: &mut PgConnection) -> WagerResult<Option<AuditRecord>> {
    sqlx::query("LOCK TABLE wager_audit_log IN EXCLUSIVE MODE")
        .execute(&mut *conn)
        .await
        .map_err(backend)?;
    let row = sqlx::query("SELECT record FROM wager_audit_log ORDER BY sequence DESC LIMIT 1")
        .fetch_optional(&mut *conn)
        .await
        .map_err(backend)?;
    row.map(|row| json_column(&row, "record")).transpose()
}

async fn insert_audit(conn: &mut PgConnection, record: &AuditRecord) -> WagerResult<()> {
    sqlx::query("INSERT INTO wager_audit_log (sequence, record) VALUES ($1, $2)")
        .bind(to_i64(record.sequence)?)
        .bind(serde_json::to_value(record)?)
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx_conflict)?;
    Ok(())
}

fn account_from_row(row: &PgRow) -> WagerResult<AccountHead> {
    let entry_number: i64 = row.try_get("entry_number").map_err(backend)?;
    Ok(AccountHead {
        user_id: row.try_get("user_id").map_err(backend)?,
        balance: row.try_get("balance").map_err(backend)?,
        entry_number: to_u64(entry_number)?,
        entry_hash: row.try_get("entry_hash").map_err(backend)?,
        halted: row.try_get("halted").map_err(backend)?,
    })
}

fn entry_from_row(row: &PgRow) -> WagerResult<LedgerEntry> {
    let entry_number: i64 = row.try_get("entry_number").map_err(backend)?;
    let transaction_type: String = row.try_get("transaction_type").map_err(backend)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(backend)?;
    Ok(LedgerEntry {
        entry_id: row.try_get("entry_id").map_err(backend)?,
        entry_number: to_u64(entry_number)?,
        user_id: row.try_get("user_id").map_err(backend)?,
        transaction_type: TransactionType::parse(&transaction_type)?,
        amount: row.try_get("amount").map_err(backend)?,
        currency: row.try_get("currency").map_err(backend)?,
        balance_before: row.try_get("balance_before").map_err(backend)?,
        balance_after: row.try_get("balance_after").map_err(backend)?,
        description: row.try_get("description").map_err(backend)?,
        reference_type: row.try_get("reference_type").map_err(backend)?,
        reference_id: row.try_get("reference_id").map_err(backend)?,
        previous_hash: row.try_get("previous_hash").map_err(backend)?,
        entry_hash: row.try_get("entry_hash").map_err(backend)?,
        created_at,
    })
}

fn flag_from_row(row: &PgRow) -> WagerResult<RegulatoryFlag> {
    let mut flag: RegulatoryFlag = json_column(row, "flag")?;
    flag.lifted_at = row.try_get("lifted_at").map_err(backend)?;
    Ok(flag)
}

fn json_column<T: DeserializeOwned>(row: &PgRow, column: &str) -> WagerResult<T> {
    let value: serde_json::Value = row.try_get(column).map_err(backend)?;
    Ok(serde_json::from_value(value)?)
}

fn from_rows<T: DeserializeOwned>(rows: Vec<serde_json::Value>) -> WagerResult<Vec<T>> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(WagerError::from))
        .collect()
}

fn to_json<T: serde::Serialize>(value: T) -> WagerResult<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

fn backend(err: sqlx::Error) -> WagerError {
    WagerError::Storage(err.to_string())
}

fn map_sqlx_conflict(err: sqlx::Error) -> WagerError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            return WagerError::StateConflict(db_err.message().to_string());
        }
    }
    backend(err)
}

fn to_i64(value: u64) -> WagerResult<i64> {
    i64::try_from(value).map_err(|_| WagerError::Storage(format!("value {value} out of range")))
}

fn usize_to_i64(value: usize) -> WagerResult<i64> {
    i64::try_from(value).map_err(|_| WagerError::validation("window value too large"))
}

fn to_u64(value: i64) -> WagerResult<u64> {
    u64::try_from(value).map_err(|_| WagerError::Storage(format!("negative counter {value}")))
}
