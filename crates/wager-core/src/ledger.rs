//! Per-user hash-chained ledger.
//!
//! Entries are never mutated or removed; corrections are new offsetting entries.
//! Each user owns an independent chain so two users never contend on append.

use crate::error::WagerError;
use crate::types::{Money, TransactionType};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Immutable, hash-chained ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerEntry {
    pub entry_id: Uuid,
    /// Monotonic per user, starting at 1.
    pub entry_number: u64,
    pub user_id: String,
    pub transaction_type: TransactionType,
    pub amount: Money,
    pub currency: String,
    pub balance_before: Money,
    pub balance_after: Money,
    pub description: String,
    pub reference_type: Option<String>,
    pub reference_id: Option<String>,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Balance and chain position of one user as read inside a unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountHead {
    pub user_id: String,
    pub balance: Money,
    /// Number of the latest entry, 0 when the chain is empty.
    pub entry_number: u64,
    pub entry_hash: Option<String>,
    /// Set by integrity reconciliation; blocks every further posting.
    pub halted: bool,
}

impl AccountHead {
    pub fn empty(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            balance: 0,
            entry_number: 0,
            entry_hash: None,
            halted: false,
        }
    }

    /// Head after `entry` has been appended.
    pub fn advanced(&self, entry: &LedgerEntry) -> Self {
        Self {
            user_id: self.user_id.clone(),
            balance: entry.balance_after,
            entry_number: entry.entry_number,
            entry_hash: Some(entry.entry_hash.clone()),
            halted: self.halted,
        }
    }
}

/// Balance change requested by a caller, bound to the chain head it was derived from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostingDraft {
    pub user_id: String,
    pub transaction_type: TransactionType,
    pub amount: Money,
    pub currency: String,
    pub description: String,
    pub reference_type: Option<String>,
    pub reference_id: Option<String>,
    pub expected_entry_number: u64,
    /// System corrections (dispute clawback) may push the balance below zero.
    pub allow_negative: bool,
}

impl PostingDraft {
    pub fn new(
        head: &AccountHead,
        transaction_type: TransactionType,
        amount: Money,
        currency: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            user_id: head.user_id.clone(),
            transaction_type,
            amount,
            currency: currency.into(),
            description: description.into(),
            reference_type: None,
            reference_id: None,
            expected_entry_number: head.entry_number,
            allow_negative: false,
        }
    }

    pub fn with_reference(
        mut self,
        reference_type: impl Into<String>,
        reference_id: impl ToString,
    ) -> Self {
        self.reference_type = Some(reference_type.into());
        self.reference_id = Some(reference_id.to_string());
        self
    }

    pub fn allowing_negative(mut self) -> Self {
        self.allow_negative = true;
        self
    }

    /// Balance this draft leaves behind if sealed against `head`.
    pub fn projected_balance(&self, head: &AccountHead) -> Option<Money> {
        head.balance.checked_add(self.amount)
    }
}

/// Seal a draft against the current chain head.
///
/// Fails with a sequence conflict when another writer advanced the chain after the
/// caller read it, and with insufficient funds when a non-correction posting would
/// drive the balance negative.
pub fn seal(
    draft: &PostingDraft,
    head: &AccountHead,
    created_at: DateTime<Utc>,
) -> Result<LedgerEntry, WagerError> {
    if draft.user_id != head.user_id {
        return Err(WagerError::Storage(format!(
            "posting for '{}' sealed against head of '{}'",
            draft.user_id, head.user_id
        )));
    }
    if head.halted {
        return Err(WagerError::IntegrityHalt(head.user_id.clone()));
    }
    if head.entry_number != draft.expected_entry_number {
        return Err(WagerError::SequenceConflict {
            user_id: head.user_id.clone(),
            expected: draft.expected_entry_number,
            found: head.entry_number,
        });
    }

    let balance_after = draft
        .projected_balance(head)
        .ok_or_else(|| WagerError::validation("balance overflow"))?;
    if balance_after < 0 && !draft.allow_negative {
        return Err(WagerError::InsufficientFunds {
            user_id: head.user_id.clone(),
            balance: head.balance,
            required: -draft.amount,
        });
    }

    // Postgres keeps microseconds; hash what the store can give back.
    let created_at = created_at.trunc_subsecs(6);
    let mut entry = LedgerEntry {
        entry_id: Uuid::new_v4(),
        entry_number: head.entry_number + 1,
        user_id: draft.user_id.clone(),
        transaction_type: draft.transaction_type,
        amount: draft.amount,
        currency: draft.currency.clone(),
        balance_before: head.balance,
        balance_after,
        description: draft.description.clone(),
        reference_type: draft.reference_type.clone(),
        reference_id: draft.reference_id.clone(),
        previous_hash: head.entry_hash.clone(),
        entry_hash: String::new(),
        created_at,
    };
    entry.entry_hash = compute_entry_hash(&entry);
    Ok(entry)
}

/// Verify one user's full chain: numbering, links, hashes and balance arithmetic.
pub fn verify_chain(user_id: &str, entries: &[LedgerEntry]) -> Result<(), WagerError> {
    let mut previous_hash: Option<&str> = None;
    let mut previous_balance: Money = 0;

    for (position, entry) in entries.iter().enumerate() {
        let violation = |detail: String| WagerError::Integrity {
            user_id: user_id.to_string(),
            detail,
        };

        if entry.user_id != user_id {
            return Err(violation(format!(
                "entry {} belongs to '{}'",
                entry.entry_number, entry.user_id
            )));
        }
        let expected_number = position as u64 + 1;
        if entry.entry_number != expected_number {
            return Err(violation(format!(
                "entry number gap: expected {}, found {}",
                expected_number, entry.entry_number
            )));
        }
        if entry.previous_hash.as_deref() != previous_hash {
            return Err(violation(format!(
                "entry {} does not link to its predecessor",
                entry.entry_number
            )));
        }
        if entry.balance_before != previous_balance {
            return Err(violation(format!(
                "entry {} opens at {} but previous entry closed at {}",
                entry.entry_number, entry.balance_before, previous_balance
            )));
        }
        if entry.balance_before.checked_add(entry.amount) != Some(entry.balance_after) {
            return Err(violation(format!(
                "entry {} arithmetic mismatch",
                entry.entry_number
            )));
        }
        if compute_entry_hash(entry) != entry.entry_hash {
            return Err(violation(format!(
                "entry {} hash mismatch",
                entry.entry_number
            )));
        }

        previous_hash = Some(entry.entry_hash.as_str());
        previous_balance = entry.balance_after;
    }

    Ok(())
}

/// Check that an account head still agrees with the newest stored entry before
/// anything is sealed on top of it.
pub fn verify_tail(head: &AccountHead, tail: Option<&LedgerEntry>) -> Result<(), WagerError> {
    let violation = |detail: String| WagerError::Integrity {
        user_id: head.user_id.clone(),
        detail,
    };
    let Some(entry) = tail else {
        if head.entry_number == 0 && head.entry_hash.is_none() && head.balance == 0 {
            return Ok(());
        }
        return Err(violation(format!(
            "account head claims entry {} with balance {} but the chain is empty",
            head.entry_number, head.balance
        )));
    };

    if entry.entry_number != head.entry_number
        || head.entry_hash.as_deref() != Some(entry.entry_hash.as_str())
    {
        return Err(violation(format!(
            "account head at entry {} does not match newest entry {}",
            head.entry_number, entry.entry_number
        )));
    }
    if entry.balance_after != head.balance {
        return Err(violation(format!(
            "account balance {} but entry {} closed at {}",
            head.balance, entry.entry_number, entry.balance_after
        )));
    }
    if compute_entry_hash(entry) != entry.entry_hash {
        return Err(violation(format!(
            "entry {} hash mismatch",
            entry.entry_number
        )));
    }
    Ok(())
}

/// hash(previous_hash ∥ canonical fields)
pub fn compute_entry_hash(entry: &LedgerEntry) -> String {
    let material = serde_json::json!({
        "entry_id": entry.entry_id,
        "entry_number": entry.entry_number,
        "user_id": entry.user_id,
        "transaction_type": entry.transaction_type,
        "amount": entry.amount,
        "currency": entry.currency,
        "balance_before": entry.balance_before,
        "balance_after": entry.balance_after,
        "description": entry.description,
        "reference_type": entry.reference_type,
        "reference_id": entry.reference_id,
        "created_at": entry.created_at,
    });

    let mut hasher = blake3::Hasher::new();
    hasher.update(entry.previous_hash.as_deref().unwrap_or_default().as_bytes());
    hasher.update(&serde_json::to_vec(&material).unwrap_or_default());
    hasher.finalize().to_hex().to_string()
}

/// Filter for ledger reads and regulatory exports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerQuery {
    pub user_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub transaction_type: Option<TransactionType>,
}

impl LedgerQuery {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        self.user_id
            .as_deref()
            .map(|user| entry.user_id == user)
            .unwrap_or(true)
            && self.from.map(|from| entry.created_at >= from).unwrap_or(true)
            && self.to.map(|to| entry.created_at < to).unwrap_or(true)
            && self
                .transaction_type
                .map(|kind| entry.transaction_type == kind)
                .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn append(
        head: &AccountHead,
        kind: TransactionType,
        amount: Money,
    ) -> (LedgerEntry, AccountHead) {
        let draft = PostingDraft::new(head, kind, amount, "USD", kind.as_str());
        let entry = seal(&draft, head, Utc::now()).expect("sealed");
        let next = head.advanced(&entry);
        (entry, next)
    }

    #[test]
    fn seals_and_verifies_chain() {
        let head = AccountHead::empty("alice");
        let (first, head) = append(&head, TransactionType::Deposit, 5_000);
        let (second, head) = append(&head, TransactionType::StakeHold, -1_000);

        assert_eq!(first.entry_number, 1);
        assert_eq!(first.previous_hash, None);
        assert_eq!(second.previous_hash.as_deref(), Some(first.entry_hash.as_str()));
        assert_eq!(second.balance_before - 1_000, second.balance_after);
        assert_eq!(head.balance, 4_000);
        assert!(verify_chain("alice", &[first, second]).is_ok());
    }

    #[test]
    fn stale_head_is_a_sequence_conflict() {
        let head = AccountHead::empty("alice");
        let stale = PostingDraft::new(&head, TransactionType::Deposit, 100, "USD", "deposit");
        let (_, advanced) = append(&head, TransactionType::Deposit, 100);

        let err = seal(&stale, &advanced, Utc::now()).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn negative_balance_requires_correction_flag() {
        let head = AccountHead::empty("bob");
        let (_, head) = append(&head, TransactionType::Deposit, 100);

        let debit = PostingDraft::new(&head, TransactionType::DisputeFreeze, -500, "USD", "freeze");
        assert!(matches!(
            seal(&debit, &head, Utc::now()),
            Err(WagerError::InsufficientFunds { .. })
        ));

        let entry = seal(&debit.allowing_negative(), &head, Utc::now()).unwrap();
        assert_eq!(entry.balance_after, -400);
    }

    #[test]
    fn halted_account_rejects_postings() {
        let mut head = AccountHead::empty("carol");
        head.halted = true;
        let draft = PostingDraft::new(&head, TransactionType::Deposit, 100, "USD", "deposit");
        assert!(matches!(
            seal(&draft, &head, Utc::now()),
            Err(WagerError::IntegrityHalt(_))
        ));
    }

    #[test]
    fn tampering_with_history_breaks_every_later_link() {
        let head = AccountHead::empty("dave");
        let (first, head) = append(&head, TransactionType::Deposit, 1_000);
        let (second, head) = append(&head, TransactionType::StakeHold, -200);
        let (third, _) = append(&head, TransactionType::BetWin, 380);

        let mut tampered = vec![first, second, third];
        tampered[0].description = "rewritten".to_string();
        let err = verify_chain("dave", &tampered).unwrap_err();
        assert!(err.to_string().contains("entry 1 hash mismatch"));

        // Re-hashing the edited entry still leaves its successor pointing at the old hash.
        tampered[0].entry_hash = compute_entry_hash(&tampered[0]);
        let err = verify_chain("dave", &tampered).unwrap_err();
        assert!(err.to_string().contains("entry 2 does not link"));
    }

    #[test]
    fn head_must_agree_with_newest_entry() {
        let empty = AccountHead::empty("frank");
        assert!(verify_tail(&empty, None).is_ok());

        let (first, head) = append(&empty, TransactionType::Deposit, 700);
        assert!(verify_tail(&head, Some(&first)).is_ok());

        let mut inflated = head.clone();
        inflated.balance = 70_000;
        let err = verify_tail(&inflated, Some(&first)).unwrap_err();
        assert!(err.to_string().contains("closed at 700"));

        let err = verify_tail(&head, None).unwrap_err();
        assert_eq!(err.kind(), "integrity");

        let mut edited = first.clone();
        edited.amount = 7_000;
        assert!(verify_tail(&head, Some(&edited)).is_err());
    }

    #[test]
    fn query_filters_by_user_and_window() {
        let head = AccountHead::empty("erin");
        let (entry, _) = append(&head, TransactionType::Deposit, 10);

        assert!(LedgerQuery::for_user("erin").matches(&entry));
        assert!(!LedgerQuery::for_user("frank").matches(&entry));

        let future = LedgerQuery {
            from: Some(entry.created_at + chrono::Duration::seconds(1)),
            ..LedgerQuery::default()
        };
        assert!(!future.matches(&entry));
    }
}
