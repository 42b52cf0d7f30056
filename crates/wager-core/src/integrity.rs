//! Ledger integrity reconciliation.
//!
//! A failed verification halts every further posting for the user until a
//! superadmin releases the hold.

use crate::audit::{AuditAppend, AuditStatus};
use crate::error::WagerError;
use crate::events::{EventBus, PlatformEvent};
use crate::ledger::verify_chain;
use crate::store::{WagerResult, WagerStore};
use crate::types::{Caller, Money};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub user_id: String,
    pub entries_checked: usize,
    pub balance: Money,
    pub head_hash: Option<String>,
    pub halted: bool,
}

#[derive(Clone)]
pub struct IntegrityMonitor {
    store: Arc<dyn WagerStore>,
    events: EventBus,
}

impl IntegrityMonitor {
    pub fn new(store: Arc<dyn WagerStore>, events: EventBus) -> Self {
        Self { store, events }
    }

    /// Replay the user's chain and compare it with the stored balance head.
    pub async fn verify_user(&self, user_id: &str) -> WagerResult<IntegrityReport> {
        let head = self.store.account(user_id).await?;
        let chain = self.store.chain(user_id).await?;

        let outcome = verify_chain(user_id, &chain).and_then(|()| {
            let (last_number, last_balance, last_hash) = chain
                .last()
                .map(|entry| (entry.entry_number, entry.balance_after, Some(entry.entry_hash.clone())))
                .unwrap_or((0, 0, None));
            if head.balance != last_balance {
                return Err(WagerError::Integrity {
                    user_id: user_id.to_string(),
                    detail: format!(
                        "balance {} diverges from ledger head {}",
                        head.balance, last_balance
                    ),
                });
            }
            if head.entry_number != last_number || head.entry_hash != last_hash {
                return Err(WagerError::Integrity {
                    user_id: user_id.to_string(),
                    detail: format!(
                        "balance row points at entry {} but ledger ends at {}",
                        head.entry_number, last_number
                    ),
                });
            }
            Ok(())
        });

        match outcome {
            Ok(()) => Ok(IntegrityReport {
                user_id: user_id.to_string(),
                entries_checked: chain.len(),
                balance: head.balance,
                head_hash: head.entry_hash,
                halted: head.halted,
            }),
            Err(violation) => {
                self.halt(user_id, &violation).await?;
                Err(violation)
            }
        }
    }

    async fn halt(&self, user_id: &str, violation: &WagerError) -> WagerResult<()> {
        error!(user_id, error = %violation, "ledger integrity violation; halting writes");
        self.store.set_halted(user_id, true).await?;

        let detail = violation.to_string();
        if let Err(err) = self
            .store
            .append_audit(AuditAppend::new(
                "system",
                "integrity_halt",
                format!("user:{user_id}"),
                AuditStatus::Failed,
                detail.clone(),
            ))
            .await
        {
            warn!(user_id, error = %err, "failed to audit integrity halt");
        }
        self.events.publish(vec![PlatformEvent::IntegrityHalted {
            user_id: user_id.to_string(),
            detail,
        }]);
        Ok(())
    }

    /// Clear a halt after manual reconciliation. Authorization is the caller's
    /// responsibility.
    pub(crate) async fn release(&self, caller: &Caller, user_id: &str, note: &str) -> WagerResult<()> {
        let head = self.store.account(user_id).await?;
        if !head.halted {
            return Err(WagerError::StateConflict(format!(
                "user '{user_id}' is not halted"
            )));
        }
        self.store.set_halted(user_id, false).await?;
        self.store
            .append_audit(AuditAppend::success(
                caller.user_id.clone(),
                "integrity_release",
                format!("user:{user_id}"),
                note,
            ))
            .await?;
        info!(user_id, released_by = %caller.user_id, "integrity hold released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::BalanceAccessor;
    use crate::store::InMemoryWagerStore;

    #[tokio::test]
    async fn healthy_chain_reports_head() {
        let store: Arc<dyn WagerStore> = Arc::new(InMemoryWagerStore::new());
        let balances = BalanceAccessor::new(store.clone(), "USD", 4);
        balances.deposit("alice", 700, None).await.unwrap();
        balances.withdraw("alice", 200, None).await.unwrap();

        let monitor = IntegrityMonitor::new(store, EventBus::new());
        let report = monitor.verify_user("alice").await.unwrap();
        assert_eq!(report.entries_checked, 2);
        assert_eq!(report.balance, 500);
        assert!(!report.halted);
    }

    #[tokio::test]
    async fn release_requires_an_active_halt() {
        let store: Arc<dyn WagerStore> = Arc::new(InMemoryWagerStore::new());
        let monitor = IntegrityMonitor::new(store.clone(), EventBus::new());
        let root = Caller::new("root", crate::types::Role::Superadmin);
        assert!(monitor.release(&root, "bob", "nothing to do").await.is_err());

        store.set_halted("bob", true).await.unwrap();
        monitor.release(&root, "bob", "reconciled").await.unwrap();
        assert!(!store.account("bob").await.unwrap().halted);
    }
}
