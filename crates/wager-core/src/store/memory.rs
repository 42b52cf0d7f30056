//! In-memory reference implementation of [`WagerStore`].
//!
//! All state sits behind one lock so a [`WriteSet`] is staged and applied as a
//! single critical section. The only write made before a failed commit returns
//! is the halt flag on an account whose head no longer matches its chain. Production deployments should use PostgreSQL.

use super::{
    apply_window, unknown_table, CommitOutcome, CommitReceipt, DisputeWrite, FlagWrite,
    PlatformRow, QueryWindow, RoleRow, SlipWrite, WagerResult, WagerStore, WriteSet, TABLES,
};
use crate::audit::{seal_audit, AuditAppend, AuditRecord};
use crate::error::WagerError;
use crate::ledger::{seal, verify_tail, AccountHead, LedgerEntry, LedgerQuery};
use crate::types::{
    BetSlip, Dispute, DisputeStatus, EscrowTransfer, Money, RegulatoryFlag, Role,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::warn;
use uuid::Uuid;

#[derive(Default)]
struct MemoryState {
    accounts: HashMap<String, AccountHead>,
    entries: HashMap<String, Vec<LedgerEntry>>,
    slips: HashMap<Uuid, BetSlip>,
    disputes: HashMap<Uuid, Dispute>,
    flags: HashMap<Uuid, RegulatoryFlag>,
    escrow: Vec<EscrowTransfer>,
    audit: Vec<AuditRecord>,
    roles: HashMap<String, Role>,
    platform_float: Option<Money>,
}

impl MemoryState {
    fn head(&self, user_id: &str) -> AccountHead {
        self.accounts
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| AccountHead::empty(user_id))
    }
}

/// In-memory wager store.
#[derive(Default)]
pub struct InMemoryWagerStore {
    state: RwLock<MemoryState>,
}

impl InMemoryWagerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> WagerResult<RwLockReadGuard<'_, MemoryState>> {
        self.state
            .read()
            .map_err(|_| WagerError::Storage("wager state lock poisoned".to_string()))
    }

    fn write(&self) -> WagerResult<RwLockWriteGuard<'_, MemoryState>> {
        self.state
            .write()
            .map_err(|_| WagerError::Storage("wager state lock poisoned".to_string()))
    }
}

#[async_trait]
impl WagerStore for InMemoryWagerStore {
    fn backend_label(&self) -> &'static str {
        "memory"
    }

    async fn commit(&self, writes: WriteSet) -> WagerResult<CommitOutcome> {
        let mut state = self.write()?;

        // Preconditions first; nothing below mutates until every check has passed.
        match &writes.slip {
            Some(SlipWrite::Insert(slip)) => {
                if state.slips.contains_key(&slip.slip_id) {
                    return Err(WagerError::StateConflict(format!(
                        "slip {} already exists",
                        slip.slip_id
                    )));
                }
            }
            Some(SlipWrite::Transition { expected, slip }) => {
                let current = state
                    .slips
                    .get(&slip.slip_id)
                    .ok_or_else(|| WagerError::not_found("slip", slip.slip_id))?;
                if current.status != *expected {
                    return Ok(CommitOutcome::Superseded(format!(
                        "slip {} is '{}', expected '{}'",
                        slip.slip_id, current.status, expected
                    )));
                }
                if current.version + 1 != slip.version {
                    return Ok(CommitOutcome::Superseded(format!(
                        "slip {} is at revision {}, write was based on {}",
                        slip.slip_id,
                        current.version,
                        slip.version.saturating_sub(1)
                    )));
                }
            }
            None => {}
        }

        match &writes.dispute {
            Some(DisputeWrite::Insert(dispute)) => {
                let already_open = state.disputes.values().any(|existing| {
                    existing.slip_id == dispute.slip_id && existing.status == DisputeStatus::Open
                });
                if already_open || state.disputes.contains_key(&dispute.dispute_id) {
                    return Err(WagerError::StateConflict(format!(
                        "slip {} already has an open dispute",
                        dispute.slip_id
                    )));
                }
            }
            Some(DisputeWrite::Transition { expected, dispute }) => {
                let current = state
                    .disputes
                    .get(&dispute.dispute_id)
                    .ok_or_else(|| WagerError::not_found("dispute", dispute.dispute_id))?;
                if current.status != *expected {
                    return Ok(CommitOutcome::Superseded(format!(
                        "dispute {} is '{}'",
                        dispute.dispute_id,
                        current.status.as_str()
                    )));
                }
            }
            None => {}
        }

        match &writes.flag {
            Some(FlagWrite::Insert(flag)) => {
                if state.flags.contains_key(&flag.flag_id) {
                    return Err(WagerError::StateConflict(format!(
                        "flag {} already exists",
                        flag.flag_id
                    )));
                }
            }
            Some(FlagWrite::Lift { flag_id, .. }) => {
                let current = state
                    .flags
                    .get(flag_id)
                    .ok_or_else(|| WagerError::not_found("flag", flag_id))?;
                if current.lifted_at.is_some() {
                    return Ok(CommitOutcome::Superseded(format!(
                        "flag {flag_id} already lifted"
                    )));
                }
            }
            None => {}
        }

        if let Some(write) = &writes.escrow {
            let transfer = &write.transfer;
            let duplicate = state.escrow.iter().any(|existing| {
                existing.flag_id == transfer.flag_id
                    && (write.once_per_flag || existing.transfer_day == transfer.transfer_day)
            });
            if duplicate {
                return Ok(CommitOutcome::Superseded(format!(
                    "flag {} already transferred for {}",
                    transfer.flag_id, transfer.transfer_day
                )));
            }
            let float = state.platform_float.unwrap_or_default();
            if float != transfer.float_before {
                return Ok(CommitOutcome::Superseded(format!(
                    "platform float moved from {} to {}",
                    transfer.float_before, float
                )));
            }
        }

        let now = Utc::now();
        let mut staged_heads: HashMap<String, AccountHead> = HashMap::new();
        let mut sealed = Vec::with_capacity(writes.postings.len());
        for draft in &writes.postings {
            let head = match staged_heads.get(&draft.user_id) {
                Some(head) => head.clone(),
                None => {
                    let head = state.head(&draft.user_id);
                    if !head.halted {
                        let tail = state.entries.get(&draft.user_id).and_then(|chain| chain.last());
                        if let Err(err) = verify_tail(&head, tail) {
                            warn!(user_id = %draft.user_id, error = %err, "account head diverged from ledger; halting writes");
                            state
                                .accounts
                                .entry(draft.user_id.clone())
                                .or_insert(head)
                                .halted = true;
                            return Err(err);
                        }
                    }
                    head
                }
            };
            let entry = seal(draft, &head, now)?;
            staged_heads.insert(draft.user_id.clone(), head.advanced(&entry));
            sealed.push(entry);
        }

        let mut audit = Vec::with_capacity(writes.audit.len());
        for event in writes.audit {
            let previous = audit.last().or_else(|| state.audit.last());
            let record = seal_audit(event, previous);
            audit.push(record);
        }

        // Apply.
        if let Some(write) = writes.slip {
            let slip = match write {
                SlipWrite::Insert(slip) => slip,
                SlipWrite::Transition { slip, .. } => slip,
            };
            state.slips.insert(slip.slip_id, slip);
        }
        if let Some(write) = writes.dispute {
            let dispute = match write {
                DisputeWrite::Insert(dispute) => dispute,
                DisputeWrite::Transition { dispute, .. } => dispute,
            };
            state.disputes.insert(dispute.dispute_id, dispute);
        }
        match writes.flag {
            Some(FlagWrite::Insert(flag)) => {
                state.flags.insert(flag.flag_id, flag);
            }
            Some(FlagWrite::Lift { flag_id, lifted_at }) => {
                if let Some(flag) = state.flags.get_mut(&flag_id) {
                    flag.lifted_at = Some(lifted_at);
                }
            }
            None => {}
        }
        if let Some(write) = writes.escrow {
            state.platform_float = Some(write.transfer.float_after);
            state.escrow.push(write.transfer);
        }
        if let Some((user_id, role)) = writes.role {
            state.roles.insert(user_id, role);
        }
        for (user_id, head) in staged_heads {
            state.accounts.insert(user_id, head);
        }
        for entry in &sealed {
            state
                .entries
                .entry(entry.user_id.clone())
                .or_default()
                .push(entry.clone());
        }
        state.audit.extend(audit.iter().cloned());

        Ok(CommitOutcome::Committed(CommitReceipt {
            entries: sealed,
            audit,
        }))
    }

    async fn account(&self, user_id: &str) -> WagerResult<AccountHead> {
        Ok(self.read()?.head(user_id))
    }

    async fn set_halted(&self, user_id: &str, halted: bool) -> WagerResult<()> {
        let mut state = self.write()?;
        let mut head = state.head(user_id);
        head.halted = halted;
        state.accounts.insert(user_id.to_string(), head);
        Ok(())
    }

    async fn chain(&self, user_id: &str) -> WagerResult<Vec<LedgerEntry>> {
        Ok(self
            .read()?
            .entries
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn ledger_entries(&self, query: &LedgerQuery) -> WagerResult<Vec<LedgerEntry>> {
        let state = self.read()?;
        let mut entries: Vec<LedgerEntry> = state
            .entries
            .values()
            .flatten()
            .filter(|entry| query.matches(entry))
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.user_id.cmp(&b.user_id))
                .then_with(|| a.entry_number.cmp(&b.entry_number))
        });
        Ok(entries)
    }

    async fn slip(&self, slip_id: Uuid) -> WagerResult<Option<BetSlip>> {
        Ok(self.read()?.slips.get(&slip_id).cloned())
    }

    async fn open_slips_for_match(&self, match_id: &str) -> WagerResult<Vec<BetSlip>> {
        let state = self.read()?;
        let mut slips: Vec<BetSlip> = state
            .slips
            .values()
            .filter(|slip| !slip.status.is_terminal() && slip.references_match(match_id))
            .cloned()
            .collect();
        slips.sort_by_key(|slip| slip.created_at);
        Ok(slips)
    }

    async fn slips_for_user(&self, user_id: &str) -> WagerResult<Vec<BetSlip>> {
        let state = self.read()?;
        let mut slips: Vec<BetSlip> = state
            .slips
            .values()
            .filter(|slip| slip.user_id == user_id)
            .cloned()
            .collect();
        slips.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(slips)
    }

    async fn dispute(&self, dispute_id: Uuid) -> WagerResult<Option<Dispute>> {
        Ok(self.read()?.disputes.get(&dispute_id).cloned())
    }

    async fn disputes_for_slip(&self, slip_id: Uuid) -> WagerResult<Vec<Dispute>> {
        let state = self.read()?;
        let mut disputes: Vec<Dispute> = state
            .disputes
            .values()
            .filter(|dispute| dispute.slip_id == slip_id)
            .cloned()
            .collect();
        disputes.sort_by_key(|dispute| dispute.opened_at);
        Ok(disputes)
    }

    async fn flags(&self) -> WagerResult<Vec<RegulatoryFlag>> {
        let state = self.read()?;
        let mut flags: Vec<RegulatoryFlag> = state.flags.values().cloned().collect();
        flags.sort_by_key(|flag| flag.effective_from);
        Ok(flags)
    }

    async fn escrow_transfers(&self, flag_id: Option<Uuid>) -> WagerResult<Vec<EscrowTransfer>> {
        Ok(self
            .read()?
            .escrow
            .iter()
            .filter(|transfer| flag_id.map(|id| transfer.flag_id == id).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn ensure_platform_float(&self, initial: Money) -> WagerResult<Money> {
        let mut state = self.write()?;
        Ok(*state.platform_float.get_or_insert(initial))
    }

    async fn platform_float(&self) -> WagerResult<Money> {
        Ok(self.read()?.platform_float.unwrap_or_default())
    }

    async fn role_of(&self, user_id: &str) -> WagerResult<Role> {
        Ok(self
            .read()?
            .roles
            .get(user_id)
            .copied()
            .unwrap_or(Role::User))
    }

    async fn append_audit(&self, event: AuditAppend) -> WagerResult<AuditRecord> {
        let mut state = self.write()?;
        let record = seal_audit(event, state.audit.last());
        state.audit.push(record.clone());
        Ok(record)
    }

    async fn audit_log(&self, window: QueryWindow) -> WagerResult<Vec<AuditRecord>> {
        let state = self.read()?;
        let newest_first: Vec<AuditRecord> = state.audit.iter().rev().cloned().collect();
        Ok(apply_window(newest_first, window))
    }

    async fn export_table(&self, table: &str) -> WagerResult<Vec<serde_json::Value>> {
        let state = self.read()?;
        export_rows(&state, table)
    }

    async fn export_snapshot(&self) -> WagerResult<BTreeMap<String, Vec<serde_json::Value>>> {
        let state = self.read()?;
        TABLES
            .iter()
            .map(|table| Ok((table.to_string(), export_rows(&state, table)?)))
            .collect()
    }

    async fn restore_rows(&self, table: &str, rows: Vec<serde_json::Value>) -> WagerResult<usize> {
        let mut state = self.write()?;
        let mut inserted = 0;
        match table {
            "roles" => {
                for row in from_rows::<RoleRow>(rows)? {
                    if !state.roles.contains_key(&row.user_id) {
                        state.roles.insert(row.user_id, row.role);
                        inserted += 1;
                    }
                }
            }
            "platform" => {
                for row in from_rows::<PlatformRow>(rows)? {
                    if state.platform_float.is_none() {
                        state.platform_float = Some(row.float);
                        inserted += 1;
                    }
                }
            }
            "balances" => {
                for head in from_rows::<AccountHead>(rows)? {
                    if !state.accounts.contains_key(&head.user_id) {
                        state.accounts.insert(head.user_id.clone(), head);
                        inserted += 1;
                    }
                }
            }
            "ledger_entries" => {
                let mut restored = from_rows::<LedgerEntry>(rows)?;
                restored.sort_by_key(|entry| entry.entry_number);
                for entry in restored {
                    let chain = state.entries.entry(entry.user_id.clone()).or_default();
                    if chain
                        .iter()
                        .all(|existing| existing.entry_number != entry.entry_number)
                    {
                        chain.push(entry);
                        chain.sort_by_key(|existing| existing.entry_number);
                        inserted += 1;
                    }
                }
            }
            "slips" => {
                for slip in from_rows::<BetSlip>(rows)? {
                    if !state.slips.contains_key(&slip.slip_id) {
                        state.slips.insert(slip.slip_id, slip);
                        inserted += 1;
                    }
                }
            }
            "disputes" => {
                for dispute in from_rows::<Dispute>(rows)? {
                    if !state.disputes.contains_key(&dispute.dispute_id) {
                        state.disputes.insert(dispute.dispute_id, dispute);
                        inserted += 1;
                    }
                }
            }
            "regulatory_flags" => {
                for flag in from_rows::<RegulatoryFlag>(rows)? {
                    if !state.flags.contains_key(&flag.flag_id) {
                        state.flags.insert(flag.flag_id, flag);
                        inserted += 1;
                    }
                }
            }
            "escrow_transfers" => {
                for transfer in from_rows::<EscrowTransfer>(rows)? {
                    if state
                        .escrow
                        .iter()
                        .all(|existing| existing.transfer_id != transfer.transfer_id)
                    {
                        state.escrow.push(transfer);
                        inserted += 1;
                    }
                }
            }
            "audit_log" => {
                let mut restored = from_rows::<AuditRecord>(rows)?;
                restored.sort_by_key(|record| record.sequence);
                for record in restored {
                    if state
                        .audit
                        .iter()
                        .all(|existing| existing.sequence != record.sequence)
                    {
                        state.audit.push(record);
                        inserted += 1;
                    }
                }
                state.audit.sort_by_key(|record| record.sequence);
            }
            other => return Err(unknown_table(other)),
        }
        Ok(inserted)
    }
}

fn export_rows(state: &MemoryState, table: &str) -> WagerResult<Vec<serde_json::Value>> {
    let rows = match table {
        "roles" => to_rows(state.roles.iter().map(|(user_id, role)| RoleRow {
            user_id: user_id.clone(),
            role: *role,
        }))?,
        "platform" => to_rows(
            state
                .platform_float
                .into_iter()
                .map(|float| PlatformRow { float }),
        )?,
        "balances" => to_rows(state.accounts.values().cloned())?,
        "ledger_entries" => to_rows(state.entries.values().flatten().cloned())?,
        "slips" => to_rows(state.slips.values().cloned())?,
        "disputes" => to_rows(state.disputes.values().cloned())?,
        "regulatory_flags" => to_rows(state.flags.values().cloned())?,
        "escrow_transfers" => to_rows(state.escrow.iter().cloned())?,
        "audit_log" => to_rows(state.audit.iter().cloned())?,
        other => return Err(unknown_table(other)),
    };
    Ok(rows)
}

fn to_rows<T: serde::Serialize>(
    values: impl Iterator<Item = T>,
) -> WagerResult<Vec<serde_json::Value>> {
    values
        .map(|value| serde_json::to_value(value).map_err(WagerError::from))
        .collect()
}

fn from_rows<T: DeserializeOwned>(rows: Vec<serde_json::Value>) -> WagerResult<Vec<T>> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(WagerError::from))
        .collect()
}
