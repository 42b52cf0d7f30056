//! Balance Accessor.
//!
//! A user's balance is the head of their ledger chain; it only ever moves inside
//! a commit that also appends the entry justifying the change.

use crate::audit::AuditAppend;
use crate::error::WagerError;
use crate::ledger::{LedgerEntry, PostingDraft};
use crate::store::{with_retry, CommitOutcome, WagerResult, WagerStore, WriteSet};
use crate::types::{Money, TransactionType};
use std::sync::Arc;
use tracing::info;

/// Requested balance movement and its justification.
#[derive(Debug, Clone)]
pub struct BalanceChange {
    pub user_id: String,
    pub transaction_type: TransactionType,
    /// Signed delta in minor units.
    pub amount: Money,
    pub currency: String,
    pub description: String,
    pub reference: Option<(String, String)>,
    /// Only system corrections set this.
    pub allow_negative: bool,
}

impl BalanceChange {
    pub fn new(
        user_id: impl Into<String>,
        transaction_type: TransactionType,
        amount: Money,
        currency: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            transaction_type,
            amount,
            currency: currency.into(),
            description: description.into(),
            reference: None,
            allow_negative: false,
        }
    }

    pub fn with_reference(mut self, kind: impl Into<String>, id: impl ToString) -> Self {
        self.reference = Some((kind.into(), id.to_string()));
        self
    }
}

#[derive(Clone)]
pub struct BalanceAccessor {
    store: Arc<dyn WagerStore>,
    currency: String,
    max_commit_attempts: u32,
}

impl BalanceAccessor {
    pub fn new(store: Arc<dyn WagerStore>, currency: impl Into<String>, max_commit_attempts: u32) -> Self {
        Self {
            store,
            currency: currency.into(),
            max_commit_attempts,
        }
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub async fn get_balance(&self, user_id: &str) -> WagerResult<Money> {
        Ok(self.store.account(user_id).await?.balance)
    }

    /// Apply `change` together with its ledger entry, plus optional audit records,
    /// as one unit of work.
    pub async fn credit_debit(
        &self,
        change: BalanceChange,
        audit: Vec<AuditAppend>,
    ) -> WagerResult<LedgerEntry> {
        let change = &change;
        let audit = &audit;
        let entry = with_retry(self.max_commit_attempts, || async move {
            let head = self.store.account(&change.user_id).await?;
            let draft = draft_for(change, &head);
            let mut writes = WriteSet::new().posting(draft);
            writes.audit = audit.clone();

            match self.store.commit(writes).await? {
                CommitOutcome::Committed(mut receipt) => receipt
                    .entries
                    .pop()
                    .ok_or_else(|| WagerError::Storage("commit returned no ledger entry".to_string())),
                CommitOutcome::Superseded(reason) => Err(WagerError::StateConflict(reason)),
            }
        })
        .await?;

        info!(
            user_id = %entry.user_id,
            transaction_type = entry.transaction_type.as_str(),
            amount = entry.amount,
            entry_number = entry.entry_number,
            balance_after = entry.balance_after,
            "balance changed"
        );
        Ok(entry)
    }

    pub async fn deposit(
        &self,
        user_id: &str,
        amount: Money,
        reference: Option<String>,
    ) -> WagerResult<LedgerEntry> {
        require_positive(amount, "deposit")?;
        let mut change = BalanceChange::new(
            user_id,
            TransactionType::Deposit,
            amount,
            self.currency.clone(),
            "wallet deposit",
        );
        if let Some(reference) = reference {
            change = change.with_reference("payment", reference);
        }
        self.credit_debit(change, Vec::new()).await
    }

    pub async fn withdraw(
        &self,
        user_id: &str,
        amount: Money,
        reference: Option<String>,
    ) -> WagerResult<LedgerEntry> {
        require_positive(amount, "withdrawal")?;
        let mut change = BalanceChange::new(
            user_id,
            TransactionType::Withdrawal,
            -amount,
            self.currency.clone(),
            "wallet withdrawal",
        );
        if let Some(reference) = reference {
            change = change.with_reference("payment", reference);
        }
        self.credit_debit(change, Vec::new()).await
    }
}

pub(crate) fn draft_for(change: &BalanceChange, head: &crate::ledger::AccountHead) -> PostingDraft {
    let mut draft = PostingDraft::new(
        head,
        change.transaction_type,
        change.amount,
        change.currency.clone(),
        change.description.clone(),
    );
    if let Some((kind, id)) = &change.reference {
        draft = draft.with_reference(kind.clone(), id);
    }
    if change.allow_negative {
        draft = draft.allowing_negative();
    }
    draft
}

pub(crate) fn require_positive(amount: Money, what: &str) -> Result<(), WagerError> {
    if amount <= 0 {
        return Err(WagerError::validation(format!(
            "{what} amount must be positive, got {amount}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryWagerStore;

    fn accessor() -> BalanceAccessor {
        BalanceAccessor::new(Arc::new(InMemoryWagerStore::new()), "USD", 4)
    }

    #[tokio::test]
    async fn deposit_and_withdraw_track_ledger_head() {
        let balances = accessor();
        balances.deposit("alice", 5_000, Some("psp-1".to_string())).await.unwrap();
        let entry = balances.withdraw("alice", 1_200, None).await.unwrap();

        assert_eq!(entry.entry_number, 2);
        assert_eq!(entry.balance_before, 5_000);
        assert_eq!(entry.balance_after, 3_800);
        assert_eq!(balances.get_balance("alice").await.unwrap(), 3_800);
    }

    #[tokio::test]
    async fn overdraft_and_non_positive_amounts_are_rejected() {
        let balances = accessor();
        balances.deposit("bob", 100, None).await.unwrap();

        let err = balances.withdraw("bob", 101, None).await.unwrap_err();
        assert!(matches!(err, WagerError::InsufficientFunds { .. }));
        assert!(balances.deposit("bob", 0, None).await.is_err());
        assert_eq!(balances.get_balance("bob").await.unwrap(), 100);
    }

    #[tokio::test]
    async fn concurrent_credits_serialize_through_the_chain() {
        let balances = accessor();
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let balances = balances.clone();
            tasks.push(tokio::spawn(async move {
                balances.deposit("carol", 10, None).await
            }));
        }
        let mut committed = 0;
        for task in tasks {
            if task.await.unwrap().is_ok() {
                committed += 1;
            }
        }
        assert_eq!(balances.get_balance("carol").await.unwrap(), committed * 10);
    }
}
