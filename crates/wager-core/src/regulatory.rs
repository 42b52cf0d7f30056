use crate::audit::AuditAppend;
use crate::error::WagerError;
use crate::events::{EventBus, PlatformEvent};
use crate::store::{CommitOutcome, EscrowWrite, FlagWrite, WagerResult, WagerStore, WriteSet};
use crate::types::{Caller, EscrowTransfer, Money, RegulatoryFlag};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Regulatory freeze configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegulatoryConfig {
    /// Share of the platform float moved to escrow per transfer.
    pub escrow_fraction: f64,
    pub escrow_destination: String,
    /// Float seeded into an empty store at bootstrap (minor units).
    pub initial_platform_float: Money,
}

impl Default for RegulatoryConfig {
    fn default() -> Self {
        Self {
            escrow_fraction: 0.20,
            escrow_destination: "regulatory-escrow".to_string(),
            initial_platform_float: 0,
        }
    }
}

/// Flag as raised by an operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagRequest {
    pub reason: String,
    #[serde(default)]
    pub effective_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub effective_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub repeatable: bool,
}

/// Outcome of one scheduled check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EscrowCheck {
    pub transferred: bool,
    pub amount: Money,
    pub transfers: Vec<EscrowTransfer>,
}

/// Regulatory Freeze Controller.
///
/// Moves platform float, never user balances.
#[derive(Clone)]
pub struct RegulatoryController {
    store: Arc<dyn WagerStore>,
    config: RegulatoryConfig,
    events: EventBus,
}

impl RegulatoryController {
    pub fn new(store: Arc<dyn WagerStore>, config: RegulatoryConfig, events: EventBus) -> Self {
        Self {
            store,
            config,
            events,
        }
    }

    pub fn config(&self) -> &RegulatoryConfig {
        &self.config
    }

    pub async fn flags(&self) -> WagerResult<Vec<RegulatoryFlag>> {
        self.store.flags().await
    }

    /// Escrow amount for a given float: floor(float × fraction), never negative.
    pub fn escrow_amount(&self, float: Money) -> Money {
        if float <= 0 {
            return 0;
        }
        let amount = (float as f64 * self.config.escrow_fraction).floor();
        if amount.is_finite() && amount > 0.0 {
            (amount as Money).min(float)
        } else {
            0
        }
    }

    pub async fn check_and_transfer(&self) -> WagerResult<EscrowCheck> {
        self.check_and_transfer_at(Utc::now()).await
    }

    /// Transfer for every flag active at `now` that has not yet transferred in
    /// its window (today for repeatable flags, ever otherwise).
    pub async fn check_and_transfer_at(&self, now: DateTime<Utc>) -> WagerResult<EscrowCheck> {
        let now = now.trunc_subsecs(6);
        let today = now.date_naive();
        let mut check = EscrowCheck::default();

        for flag in self.store.flags().await? {
            if !flag.is_active_at(now) {
                continue;
            }
            let prior = self.store.escrow_transfers(Some(flag.flag_id)).await?;
            let already = prior
                .iter()
                .any(|transfer| !flag.repeatable || transfer.transfer_day == today);
            if already {
                debug!(flag_id = %flag.flag_id, "escrow already transferred for this window");
                continue;
            }

            let float = self.store.platform_float().await?;
            let amount = self.escrow_amount(float);
            if amount == 0 {
                warn!(flag_id = %flag.flag_id, float, "regulatory flag active but float is empty");
                continue;
            }

            let transfer = EscrowTransfer {
                transfer_id: Uuid::new_v4(),
                flag_id: flag.flag_id,
                amount,
                float_before: float,
                float_after: float - amount,
                destination: self.config.escrow_destination.clone(),
                transfer_day: today,
                completed_at: now,
            };
            let writes = WriteSet::new()
                .escrow(EscrowWrite {
                    transfer: transfer.clone(),
                    once_per_flag: !flag.repeatable,
                })
                .audit(AuditAppend::success(
                    "system",
                    "escrow_transfer",
                    format!("flag:{}", flag.flag_id),
                    format!(
                        "moved {amount} of {float} to {}",
                        self.config.escrow_destination
                    ),
                ));

            match self.store.commit(writes).await? {
                CommitOutcome::Committed(_) => {
                    info!(
                        flag_id = %flag.flag_id,
                        transfer_id = %transfer.transfer_id,
                        amount,
                        float_after = transfer.float_after,
                        "escrow transfer completed"
                    );
                    self.events.publish(vec![PlatformEvent::EscrowTransferred {
                        transfer_id: transfer.transfer_id,
                        flag_id: transfer.flag_id,
                        amount,
                    }]);
                    check.transferred = true;
                    check.amount += amount;
                    check.transfers.push(transfer);
                }
                CommitOutcome::Superseded(reason) => {
                    debug!(flag_id = %flag.flag_id, reason, "escrow transfer superseded");
                }
            }
        }
        Ok(check)
    }

    /// Authorization is the caller's responsibility.
    pub(crate) async fn raise_flag(
        &self,
        caller: &Caller,
        request: FlagRequest,
    ) -> WagerResult<RegulatoryFlag> {
        if request.reason.trim().is_empty() {
            return Err(WagerError::validation("flag reason is required"));
        }
        let effective_from = request.effective_from.unwrap_or_else(Utc::now).trunc_subsecs(6);
        if let Some(until) = request.effective_until {
            if until <= effective_from {
                return Err(WagerError::validation(
                    "flag window must end after it starts",
                ));
            }
        }

        let flag = RegulatoryFlag {
            flag_id: Uuid::new_v4(),
            reason: request.reason.trim().to_string(),
            raised_by: caller.user_id.clone(),
            effective_from,
            effective_until: request.effective_until.map(|until| until.trunc_subsecs(6)),
            repeatable: request.repeatable,
            lifted_at: None,
        };
        let writes = WriteSet::new()
            .flag(FlagWrite::Insert(flag.clone()))
            .audit(AuditAppend::success(
                caller.user_id.clone(),
                "raise_regulatory_flag",
                format!("flag:{}", flag.flag_id),
                flag.reason.clone(),
            ));
        match self.store.commit(writes).await? {
            CommitOutcome::Committed(_) => {
                warn!(flag_id = %flag.flag_id, raised_by = %caller.user_id, reason = %flag.reason, "regulatory flag raised");
                Ok(flag)
            }
            CommitOutcome::Superseded(reason) => Err(WagerError::StateConflict(reason)),
        }
    }

    pub(crate) async fn lift_flag(&self, caller: &Caller, flag_id: Uuid) -> WagerResult<()> {
        let writes = WriteSet::new()
            .flag(FlagWrite::Lift {
                flag_id,
                lifted_at: Utc::now().trunc_subsecs(6),
            })
            .audit(AuditAppend::success(
                caller.user_id.clone(),
                "lift_regulatory_flag",
                format!("flag:{flag_id}"),
                "lifted",
            ));
        match self.store.commit(writes).await? {
            CommitOutcome::Committed(_) => {
                info!(flag_id = %flag_id, lifted_by = %caller.user_id, "regulatory flag lifted");
                Ok(())
            }
            CommitOutcome::Superseded(reason) => Err(WagerError::StateConflict(reason)),
        }
    }
}
