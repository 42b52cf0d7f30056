//! Admin Override Tools.
//!
//! Every privileged operation runs the same capability check first and lands
//! an audit record in the same commit as its mutation. Attempts that pass the
//! check but fail later are recorded as `failed`.

use crate::audit::{AuditAppend, AuditRecord, AuditStatus};
use crate::authz::{authorize, ADMIN_ROLES, SUPERADMIN_ONLY};
use crate::balance::{require_positive, BalanceAccessor, BalanceChange};
use crate::dispute::DisputeHandler;
use crate::error::WagerError;
use crate::integrity::{IntegrityMonitor, IntegrityReport};
use crate::ledger::LedgerEntry;
use crate::lifecycle::{BetLifecycleManager, SettlementOutcome};
use crate::regulatory::{EscrowCheck, FlagRequest, RegulatoryController};
use crate::store::{CommitOutcome, QueryWindow, WagerResult, WagerStore, WriteSet};
use crate::types::{BetSlip, Caller, Dispute, DisputeResolution, Money, RegulatoryFlag, Role, SelectionStatus, TransactionType};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct AdminTools {
    store: Arc<dyn WagerStore>,
    balances: BalanceAccessor,
    lifecycle: BetLifecycleManager,
    disputes: DisputeHandler,
    regulatory: RegulatoryController,
    integrity: IntegrityMonitor,
}

impl AdminTools {
    pub fn new(
        store: Arc<dyn WagerStore>,
        balances: BalanceAccessor,
        lifecycle: BetLifecycleManager,
        disputes: DisputeHandler,
        regulatory: RegulatoryController,
        integrity: IntegrityMonitor,
    ) -> Self {
        Self {
            store,
            balances,
            lifecycle,
            disputes,
            regulatory,
            integrity,
        }
    }

    pub async fn manual_payout(
        &self,
        caller: &Caller,
        user_id: &str,
        amount: Money,
        reason: &str,
    ) -> WagerResult<LedgerEntry> {
        self.credit(caller, "manual_payout", TransactionType::ManualPayout, user_id, amount, reason)
            .await
    }

    pub async fn retention_bonus(
        &self,
        caller: &Caller,
        user_id: &str,
        amount: Money,
        reason: &str,
    ) -> WagerResult<LedgerEntry> {
        self.credit(caller, "retention_bonus", TransactionType::RetentionBonus, user_id, amount, reason)
            .await
    }

    async fn credit(
        &self,
        caller: &Caller,
        action: &str,
        kind: TransactionType,
        user_id: &str,
        amount: Money,
        reason: &str,
    ) -> WagerResult<LedgerEntry> {
        let resource = format!("user:{user_id}");
        authorize(self.store.as_ref(), caller, ADMIN_ROLES, action, &resource).await?;

        let result = async {
            require_positive(amount, action)?;
            let change = BalanceChange::new(
                user_id,
                kind,
                amount,
                self.balances.currency(),
                format!("{action} by {}: {reason}", caller.user_id),
            )
            .with_reference("admin", &caller.user_id);
            let audit = AuditAppend::success(
                caller.user_id.clone(),
                action,
                resource.clone(),
                format!("credited {amount}: {reason}"),
            );
            self.balances.credit_debit(change, vec![audit]).await
        }
        .await;
        self.settle_attempt(caller, action, &resource, result).await
    }

    pub async fn void_slip(&self, caller: &Caller, slip_id: Uuid, reason: &str) -> WagerResult<BetSlip> {
        let resource = format!("slip:{slip_id}");
        authorize(self.store.as_ref(), caller, SUPERADMIN_ONLY, "void_bet", &resource).await?;
        let audit = AuditAppend::success(caller.user_id.clone(), "void_bet", resource.clone(), reason);
        let result = self.lifecycle.void_slip(caller, slip_id, reason, audit).await;
        self.settle_attempt(caller, "void_bet", &resource, result).await
    }

    /// Force every leg outcome of a slip that the feed could not settle.
    pub async fn settle_slip(
        &self,
        caller: &Caller,
        slip_id: Uuid,
        outcomes: &[SelectionStatus],
    ) -> WagerResult<SettlementOutcome> {
        let resource = format!("slip:{slip_id}");
        authorize(self.store.as_ref(), caller, ADMIN_ROLES, "manual_settle", &resource).await?;
        let audit = AuditAppend::success(
            caller.user_id.clone(),
            "manual_settle",
            resource.clone(),
            format!("{} leg outcomes applied", outcomes.len()),
        );
        let result = self
            .lifecycle
            .settle_manually(caller, slip_id, outcomes, audit)
            .await;
        self.settle_attempt(caller, "manual_settle", &resource, result).await
    }

    pub async fn resolve_dispute(
        &self,
        caller: &Caller,
        dispute_id: Uuid,
        resolution: &DisputeResolution,
        note: Option<String>,
    ) -> WagerResult<Dispute> {
        let resource = format!("dispute:{dispute_id}");
        authorize(self.store.as_ref(), caller, ADMIN_ROLES, "resolve_dispute", &resource).await?;
        let detail = match resolution {
            DisputeResolution::Release => "released".to_string(),
            DisputeResolution::Forfeit => "forfeited".to_string(),
            DisputeResolution::Compensate { amount } => format!("compensated {amount}"),
        };
        let audit = AuditAppend::success(caller.user_id.clone(), "resolve_dispute", resource.clone(), detail);
        let result = self
            .disputes
            .resolve(caller, dispute_id, resolution, note, audit)
            .await;
        self.settle_attempt(caller, "resolve_dispute", &resource, result).await
    }

    pub async fn elevate_role(&self, caller: &Caller, user_id: &str, role: Role) -> WagerResult<Role> {
        let resource = format!("user:{user_id}");
        authorize(self.store.as_ref(), caller, SUPERADMIN_ONLY, "elevate_role", &resource).await?;

        let result = async {
            if user_id.trim().is_empty() {
                return Err(WagerError::validation("user id is required"));
            }
            let previous = self.store.role_of(user_id).await?;
            let writes = WriteSet::new().role(user_id, role).audit(AuditAppend::success(
                caller.user_id.clone(),
                "elevate_role",
                resource.clone(),
                format!("{} -> {}", previous.as_str(), role.as_str()),
            ));
            match self.store.commit(writes).await? {
                CommitOutcome::Committed(_) => Ok(role),
                CommitOutcome::Superseded(reason) => Err(WagerError::StateConflict(reason)),
            }
        }
        .await;
        let role = self.settle_attempt(caller, "elevate_role", &resource, result).await?;
        info!(user_id, role = role.as_str(), granted_by = %caller.user_id, "role changed");
        Ok(role)
    }

    pub async fn raise_flag(&self, caller: &Caller, request: FlagRequest) -> WagerResult<RegulatoryFlag> {
        authorize(self.store.as_ref(), caller, SUPERADMIN_ONLY, "raise_regulatory_flag", "regulatory").await?;
        let result = self.regulatory.raise_flag(caller, request).await;
        self.settle_attempt(caller, "raise_regulatory_flag", "regulatory", result).await
    }

    pub async fn lift_flag(&self, caller: &Caller, flag_id: Uuid) -> WagerResult<()> {
        let resource = format!("flag:{flag_id}");
        authorize(self.store.as_ref(), caller, SUPERADMIN_ONLY, "lift_regulatory_flag", &resource).await?;
        let result = self.regulatory.lift_flag(caller, flag_id).await;
        self.settle_attempt(caller, "lift_regulatory_flag", &resource, result).await
    }

    /// On-demand run of the scheduled escrow check.
    pub async fn run_regulatory_check(&self, caller: &Caller) -> WagerResult<EscrowCheck> {
        authorize(self.store.as_ref(), caller, ADMIN_ROLES, "regulatory_check", "regulatory").await?;
        let result = self.regulatory.check_and_transfer().await;
        let check = self.settle_attempt(caller, "regulatory_check", "regulatory", result).await?;
        self.store
            .append_audit(AuditAppend::success(
                caller.user_id.clone(),
                "regulatory_check",
                "regulatory",
                format!("transferred {}", check.amount),
            ))
            .await?;
        Ok(check)
    }

    pub async fn audit_log(&self, caller: &Caller, window: QueryWindow) -> WagerResult<Vec<AuditRecord>> {
        authorize(self.store.as_ref(), caller, ADMIN_ROLES, "read_audit_log", "audit_log").await?;
        self.store.audit_log(window).await
    }

    pub async fn verify_integrity(&self, caller: &Caller, user_id: &str) -> WagerResult<IntegrityReport> {
        let resource = format!("user:{user_id}");
        authorize(self.store.as_ref(), caller, ADMIN_ROLES, "verify_integrity", &resource).await?;
        // Violations are audited by the monitor itself.
        let report = self.integrity.verify_user(user_id).await?;
        self.store
            .append_audit(AuditAppend::success(
                caller.user_id.clone(),
                "verify_integrity",
                resource,
                format!("{} entries verified", report.entries_checked),
            ))
            .await?;
        Ok(report)
    }

    pub async fn release_integrity_hold(&self, caller: &Caller, user_id: &str, note: &str) -> WagerResult<()> {
        let resource = format!("user:{user_id}");
        authorize(self.store.as_ref(), caller, SUPERADMIN_ONLY, "integrity_release", &resource).await?;
        let result = self.integrity.release(caller, user_id, note).await;
        self.settle_attempt(caller, "integrity_release", &resource, result).await
    }

    async fn settle_attempt<T>(
        &self,
        caller: &Caller,
        action: &str,
        resource: &str,
        result: WagerResult<T>,
    ) -> WagerResult<T> {
        if let Err(err) = &result {
            warn!(caller = %caller.user_id, action, resource, error = %err, "privileged action failed");
            let record = AuditAppend::new(
                caller.user_id.clone(),
                action,
                resource,
                AuditStatus::Failed,
                err.to_string(),
            );
            if let Err(audit_err) = self.store.append_audit(record).await {
                warn!(error = %audit_err, action, "failed to record failed attempt");
            }
        }
        result
    }
}
