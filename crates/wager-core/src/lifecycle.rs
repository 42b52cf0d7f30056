//! Bet Lifecycle Manager.
//!
//! Owns every slip status transition:
//!
//! ```text
//! pending ──► pending_settlement ──► won | lost | void
//!    │                │
//!    ├──► cashed_out  └──► void (admin)
//!    └──► won | lost | void
//! ```
//!
//! Each transition is one [`WriteSet`] conditioned on the status it was computed
//! from. Settlement re-reads a slip that changed underneath it and re-applies the
//! result until the slip is terminal; user and admin actions surface a lost race
//! as a state conflict.

use crate::audit::AuditAppend;
use crate::error::WagerError;
use crate::events::{EventBus, PlatformEvent};
use crate::ledger::PostingDraft;
use crate::odds::{OddsSource, QuoteWindow};
use crate::pricing::PricingEngine;
use crate::store::{with_retry, CommitOutcome, SlipWrite, WagerResult, WagerStore, WriteSet};
use crate::types::{
    BetSlip, BetStatus, Caller, Money, PlacementRequest, ResultEvent, Role, Selection,
    SelectionStatus, TransactionType,
};
use chrono::{Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Placement limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementPolicy {
    pub min_stake: Money,
    pub max_stake: Money,
    pub max_selections: usize,
    /// Maximum relative drift between quoted and live odds.
    pub odds_tolerance: f64,
    pub max_quote_age_secs: i64,
    pub placement_timeout_ms: u64,
}

impl Default for PlacementPolicy {
    fn default() -> Self {
        Self {
            min_stake: 100,
            // 100,000.00 in cents.
            max_stake: 10_000_000,
            max_selections: 20,
            odds_tolerance: 0.05,
            max_quote_age_secs: 30,
            placement_timeout_ms: 5_000,
        }
    }
}

impl PlacementPolicy {
    fn quote_window(&self) -> QuoteWindow {
        QuoteWindow {
            tolerance: self.odds_tolerance,
            max_age: Duration::seconds(self.max_quote_age_secs),
        }
    }
}

/// Early-settlement price for a live slip.
pub trait CashOutPricer: Send + Sync {
    /// Amount offered now, or `None` when the slip cannot be cashed out.
    fn quote(&self, slip: &BetSlip) -> Option<Money>;
}

/// Offers a fixed share of the stake while no leg has lost.
#[derive(Debug, Clone)]
pub struct StakeShareCashOut {
    pub share: f64,
}

impl Default for StakeShareCashOut {
    fn default() -> Self {
        Self { share: 0.90 }
    }
}

impl CashOutPricer for StakeShareCashOut {
    fn quote(&self, slip: &BetSlip) -> Option<Money> {
        if slip
            .selections
            .iter()
            .any(|selection| selection.status == SelectionStatus::Lost)
        {
            return None;
        }
        let offer = (slip.total_stake as f64 * self.share).floor();
        (offer.is_finite() && offer > 0.0).then_some(offer as Money)
    }
}

/// What a settlement attempt did to one slip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SettlementOutcome {
    Settled { status: BetStatus, payout: Money },
    /// Some legs resolved, no leg lost; waiting for the rest.
    AwaitingLegs,
    /// Slip was already terminal or another settler won the race.
    NoOp { status: BetStatus },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchSettlementReport {
    pub match_id: String,
    pub examined: usize,
    pub settled: Vec<(Uuid, SettlementOutcome)>,
    pub failed: Vec<(Uuid, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CashOutReceipt {
    pub slip_id: Uuid,
    pub amount: Money,
    pub entry_number: u64,
    pub balance_after: Money,
}

/// Result of aggregating leg statuses.
#[derive(Debug, Clone, PartialEq)]
struct Verdict {
    status: BetStatus,
    payout: Money,
    posting: Option<(TransactionType, Money, String)>,
}

/// One settlement attempt: finished, or lost the slip to a concurrent writer.
enum Resolution {
    Done(SettlementOutcome, Option<BetSlip>),
    Raced(String),
}

#[derive(Clone)]
pub struct BetLifecycleManager {
    store: Arc<dyn WagerStore>,
    pricing: PricingEngine,
    policy: PlacementPolicy,
    odds: Option<Arc<dyn OddsSource>>,
    cash_out: Arc<dyn CashOutPricer>,
    events: EventBus,
    max_commit_attempts: u32,
}

impl BetLifecycleManager {
    pub fn new(
        store: Arc<dyn WagerStore>,
        pricing: PricingEngine,
        policy: PlacementPolicy,
        events: EventBus,
        max_commit_attempts: u32,
    ) -> Self {
        Self {
            store,
            pricing,
            policy,
            odds: None,
            cash_out: Arc::new(StakeShareCashOut::default()),
            events,
            max_commit_attempts,
        }
    }

    pub fn with_odds_source(mut self, odds: Arc<dyn OddsSource>) -> Self {
        self.odds = Some(odds);
        self
    }

    pub fn with_cash_out_pricer(mut self, pricer: Arc<dyn CashOutPricer>) -> Self {
        self.cash_out = pricer;
        self
    }

    pub fn policy(&self) -> &PlacementPolicy {
        &self.policy
    }

    pub fn pricing(&self) -> &PricingEngine {
        &self.pricing
    }

    pub async fn slip(&self, slip_id: Uuid) -> WagerResult<BetSlip> {
        self.store
            .slip(slip_id)
            .await?
            .ok_or_else(|| WagerError::not_found("slip", slip_id))
    }

    /// Validate, price and place a slip, holding the stake.
    ///
    /// The placement timeout bounds validation and pricing. Once the deadline has
    /// passed nothing is written; a commit that has started is never abandoned.
    pub async fn place(&self, caller: &Caller, request: PlacementRequest) -> WagerResult<BetSlip> {
        if caller.user_id != request.user_id {
            return Err(WagerError::Unauthorized {
                caller: caller.user_id.clone(),
                action: format!("place a slip for '{}'", request.user_id),
            });
        }

        let budget = std::time::Duration::from_millis(self.policy.placement_timeout_ms);
        let deadline = tokio::time::Instant::now() + budget;
        let timed_out = || {
            WagerError::Timeout(format!(
                "placement did not complete within {}ms",
                self.policy.placement_timeout_ms
            ))
        };
        let slip = tokio::time::timeout_at(deadline, self.prepare_slip(request))
            .await
            .map_err(|_| timed_out())??;
        if tokio::time::Instant::now() >= deadline {
            return Err(timed_out());
        }
        let slip = self.hold_stake(slip).await?;

        info!(
            slip_id = %slip.slip_id,
            user_id = %slip.user_id,
            stake = slip.total_stake,
            total_odds = slip.total_odds,
            potential_win = slip.potential_win,
            "bet placed"
        );
        self.events.publish(vec![PlatformEvent::BetPlaced {
            slip_id: slip.slip_id,
            user_id: slip.user_id.clone(),
            stake: slip.total_stake,
            potential_win: slip.potential_win,
        }]);
        Ok(slip)
    }

    async fn prepare_slip(&self, request: PlacementRequest) -> WagerResult<BetSlip> {
        self.validate_placement(&request).await?;

        let selections: Vec<Selection> = request
            .selections
            .iter()
            .map(|leg| Selection::new(leg.match_id.clone(), leg.selection_type, leg.value.clone(), leg.odds))
            .collect();
        let quote = self.pricing.price(&selections)?;
        let potential_win = quote.payout_for(request.stake)?;

        Ok(BetSlip {
            slip_id: Uuid::new_v4(),
            user_id: request.user_id.clone(),
            selections,
            total_stake: request.stake,
            currency: request.currency.clone(),
            total_odds: quote.final_odds,
            correlation_factor: quote.correlation_factor,
            potential_win,
            payout: None,
            status: BetStatus::Pending,
            created_at: Utc::now().trunc_subsecs(6),
            settled_at: None,
            settled_by: None,
            version: 0,
        })
    }

    async fn hold_stake(&self, slip: BetSlip) -> WagerResult<BetSlip> {
        let slip = &slip;
        with_retry(self.max_commit_attempts, || async move {
            let head = self.store.account(&slip.user_id).await?;
            if head.balance < slip.total_stake {
                return Err(WagerError::InsufficientFunds {
                    user_id: slip.user_id.clone(),
                    balance: head.balance,
                    required: slip.total_stake,
                });
            }
            let hold = PostingDraft::new(
                &head,
                TransactionType::StakeHold,
                -slip.total_stake,
                slip.currency.clone(),
                format!("stake hold for slip {}", slip.slip_id),
            )
            .with_reference("bet_slip", slip.slip_id);

            let writes = WriteSet::new()
                .slip(SlipWrite::Insert(slip.clone()))
                .posting(hold);
            match self.store.commit(writes).await? {
                CommitOutcome::Committed(_) => Ok(()),
                CommitOutcome::Superseded(reason) => Err(WagerError::StateConflict(reason)),
            }
        })
        .await?;

        Ok(slip.clone())
    }

    async fn validate_placement(&self, request: &PlacementRequest) -> WagerResult<()> {
        let policy = &self.policy;
        if request.user_id.trim().is_empty() {
            return Err(WagerError::validation("user id is required"));
        }
        if request.currency.trim().is_empty() {
            return Err(WagerError::validation("currency is required"));
        }
        if request.stake < policy.min_stake {
            return Err(WagerError::validation(format!(
                "stake {} is below the minimum of {}",
                request.stake, policy.min_stake
            )));
        }
        if request.stake > policy.max_stake {
            return Err(WagerError::validation(format!(
                "stake {} exceeds the maximum of {}",
                request.stake, policy.max_stake
            )));
        }
        if request.selections.is_empty() {
            return Err(WagerError::validation("slip has no selections"));
        }
        if request.selections.len() > policy.max_selections {
            return Err(WagerError::validation(format!(
                "slip has {} selections, limit is {}",
                request.selections.len(),
                policy.max_selections
            )));
        }

        let mut seen = HashSet::new();
        for leg in &request.selections {
            if leg.match_id.trim().is_empty() || leg.value.trim().is_empty() {
                return Err(WagerError::validation("selection needs a match id and a value"));
            }
            if !seen.insert((leg.match_id.as_str(), leg.selection_type, leg.value.to_ascii_lowercase())) {
                return Err(WagerError::validation(format!(
                    "duplicate selection {}/{}",
                    leg.match_id,
                    leg.selection_type.as_str()
                )));
            }
        }

        let window = policy.quote_window();
        let now = Utc::now();
        for leg in &request.selections {
            window.check(leg, self.odds.as_deref(), now).await?;
        }
        Ok(())
    }

    /// Fan a result out to every open slip on the match. Safe to redeliver.
    pub async fn settle_match(&self, event: &ResultEvent) -> WagerResult<MatchSettlementReport> {
        let slips = self.store.open_slips_for_match(&event.match_id).await?;
        let mut report = MatchSettlementReport {
            match_id: event.match_id.clone(),
            examined: slips.len(),
            ..MatchSettlementReport::default()
        };

        for slip in slips {
            match self.settle_slip(slip.slip_id, event).await {
                Ok(outcome) => report.settled.push((slip.slip_id, outcome)),
                Err(err) => {
                    warn!(
                        slip_id = %slip.slip_id,
                        match_id = %event.match_id,
                        error = %err,
                        "slip settlement failed"
                    );
                    report.failed.push((slip.slip_id, err.to_string()));
                }
            }
        }
        info!(
            match_id = %event.match_id,
            examined = report.examined,
            failed = report.failed.len(),
            "result event applied"
        );
        Ok(report)
    }

    /// Apply `event` to one slip. Idempotent.
    pub async fn settle_slip(&self, slip_id: Uuid, event: &ResultEvent) -> WagerResult<SettlementOutcome> {
        self.apply_resolution(slip_id, "result_feed", None, |slip| {
            let mut changed = false;
            for selection in slip.selections.iter_mut() {
                if selection.status != SelectionStatus::Pending {
                    continue;
                }
                if let Some(status) = event.resolve(selection) {
                    selection.status = status;
                    changed = true;
                }
            }
            Ok(changed)
        })
        .await
    }

    /// Admin override: set every leg outcome explicitly. Authorization is the
    /// caller's responsibility.
    pub(crate) async fn settle_manually(
        &self,
        caller: &Caller,
        slip_id: Uuid,
        outcomes: &[SelectionStatus],
        audit: AuditAppend,
    ) -> WagerResult<SettlementOutcome> {
        if outcomes.contains(&SelectionStatus::Pending) {
            return Err(WagerError::validation(
                "manual settlement must resolve every selection",
            ));
        }
        let outcome = self
            .apply_resolution(slip_id, &caller.user_id, Some(audit), |slip| {
                if outcomes.len() != slip.selections.len() {
                    return Err(WagerError::validation(format!(
                        "slip has {} selections, {} outcomes given",
                        slip.selections.len(),
                        outcomes.len()
                    )));
                }
                for (selection, status) in slip.selections.iter_mut().zip(outcomes) {
                    selection.status = *status;
                }
                Ok(true)
            })
            .await?;

        if let SettlementOutcome::NoOp { status } = outcome {
            return Err(WagerError::unexpected_status(
                &format!("slip {slip_id}"),
                "pending",
                status.as_str(),
            ));
        }
        Ok(outcome)
    }

    async fn apply_resolution<F>(
        &self,
        slip_id: Uuid,
        settled_by: &str,
        audit: Option<AuditAppend>,
        resolve: F,
    ) -> WagerResult<SettlementOutcome>
    where
        F: Fn(&mut BetSlip) -> Result<bool, WagerError>,
    {
        let resolve = &resolve;
        let audit = &audit;
        let attempts = self.max_commit_attempts.max(1);
        let mut raced = 0;
        let (outcome, settled) = loop {
            let step = with_retry(self.max_commit_attempts, || async move {
                let current = self.slip(slip_id).await?;
                if current.status.is_terminal() {
                    debug!(slip_id = %slip_id, status = current.status.as_str(), "slip already settled");
                    return Ok(Resolution::Done(SettlementOutcome::NoOp { status: current.status }, None));
                }

                let mut next = current.next_revision();
                let legs_changed = resolve(&mut next)?;
                if !legs_changed {
                    return Ok(Resolution::Done(SettlementOutcome::NoOp { status: current.status }, None));
                }

                let verdict = self.verdict(&next)?;
                let mut writes = WriteSet::new();
                let now = Utc::now().trunc_subsecs(6);
                next.status = verdict.status;
                if verdict.status.is_terminal() {
                    next.payout = Some(verdict.payout);
                    next.settled_at = Some(now);
                    next.settled_by = Some(settled_by.to_string());
                }
                if let Some((kind, amount, description)) = &verdict.posting {
                    let head = self.store.account(&next.user_id).await?;
                    writes = writes.posting(
                        PostingDraft::new(&head, *kind, *amount, next.currency.clone(), description.clone())
                            .with_reference("bet_slip", slip_id),
                    );
                }
                if let Some(event) = audit {
                    writes = writes.audit(event.clone());
                }
                writes = writes.slip(SlipWrite::Transition {
                    expected: current.status,
                    slip: next.clone(),
                });

                match self.store.commit(writes).await? {
                    CommitOutcome::Committed(_) => {
                        if verdict.status.is_terminal() {
                            Ok(Resolution::Done(
                                SettlementOutcome::Settled {
                                    status: verdict.status,
                                    payout: verdict.payout,
                                },
                                Some(next),
                            ))
                        } else {
                            Ok(Resolution::Done(SettlementOutcome::AwaitingLegs, None))
                        }
                    }
                    CommitOutcome::Superseded(reason) => Ok(Resolution::Raced(reason)),
                }
            })
            .await?;

            match step {
                Resolution::Done(outcome, settled) => break (outcome, settled),
                Resolution::Raced(reason) => {
                    raced += 1;
                    debug!(slip_id = %slip_id, reason = %reason, raced, "slip changed underneath settlement; re-reading");
                    if raced >= attempts {
                        return Err(WagerError::StateConflict(format!(
                            "slip {slip_id} kept changing during settlement: {reason}"
                        )));
                    }
                }
            }
        };

        if let Some(slip) = settled {
            let payout = slip.payout.unwrap_or_default();
            info!(
                slip_id = %slip.slip_id,
                user_id = %slip.user_id,
                status = slip.status.as_str(),
                payout,
                settled_by,
                "slip settled"
            );
            self.events.publish(vec![PlatformEvent::BetSettled {
                slip_id: slip.slip_id,
                user_id: slip.user_id,
                status: slip.status,
                payout,
            }]);
        }
        Ok(outcome)
    }

    /// Aggregate leg statuses into the slip verdict.
    fn verdict(&self, slip: &BetSlip) -> WagerResult<Verdict> {
        let legs = &slip.selections;
        if legs.iter().any(|leg| leg.status == SelectionStatus::Lost) {
            return Ok(Verdict {
                status: BetStatus::Lost,
                payout: 0,
                posting: Some((
                    TransactionType::BetLoss,
                    0,
                    format!("slip {} lost", slip.slip_id),
                )),
            });
        }
        if legs.iter().any(|leg| leg.status == SelectionStatus::Pending) {
            return Ok(Verdict {
                status: BetStatus::PendingSettlement,
                payout: 0,
                posting: None,
            });
        }

        let live: Vec<Selection> = legs
            .iter()
            .filter(|leg| leg.status == SelectionStatus::Won)
            .cloned()
            .collect();
        if live.is_empty() {
            return Ok(Verdict {
                status: BetStatus::Void,
                payout: slip.total_stake,
                posting: Some((
                    TransactionType::BetVoidRefund,
                    slip.total_stake,
                    format!("slip {} void, stake refunded", slip.slip_id),
                )),
            });
        }

        let payout = if live.len() == legs.len() {
            slip.potential_win
        } else {
            self.pricing.price(&live)?.payout_for(slip.total_stake)?
        };
        Ok(Verdict {
            status: BetStatus::Won,
            payout,
            posting: Some((
                TransactionType::BetWin,
                payout,
                format!("slip {} won", slip.slip_id),
            )),
        })
    }

    /// Admin void with full stake refund. Rejected once the slip is terminal.
    pub(crate) async fn void_slip(
        &self,
        caller: &Caller,
        slip_id: Uuid,
        reason: &str,
        audit: AuditAppend,
    ) -> WagerResult<BetSlip> {
        let audit = &audit;
        let slip = with_retry(self.max_commit_attempts, || async move {
            let current = self.slip(slip_id).await?;
            if current.status.is_terminal() {
                return Err(WagerError::unexpected_status(
                    &format!("slip {slip_id}"),
                    "pending",
                    current.status.as_str(),
                ));
            }

            let head = self.store.account(&current.user_id).await?;
            let refund = PostingDraft::new(
                &head,
                TransactionType::BetVoidRefund,
                current.total_stake,
                current.currency.clone(),
                format!("slip {slip_id} voided by admin: {reason}"),
            )
            .with_reference("bet_slip", slip_id);

            let mut next = current.next_revision();
            next.status = BetStatus::Void;
            next.payout = Some(current.total_stake);
            next.settled_at = Some(Utc::now().trunc_subsecs(6));
            next.settled_by = Some(caller.user_id.clone());

            let writes = WriteSet::new()
                .slip(SlipWrite::Transition {
                    expected: current.status,
                    slip: next.clone(),
                })
                .posting(refund)
                .audit(audit.clone());
            match self.store.commit(writes).await? {
                CommitOutcome::Committed(_) => Ok(next),
                CommitOutcome::Superseded(reason) => Err(WagerError::StateConflict(reason)),
            }
        })
        .await?;

        info!(slip_id = %slip_id, admin = %caller.user_id, reason, "slip voided");
        self.events.publish(vec![PlatformEvent::BetSettled {
            slip_id,
            user_id: slip.user_id.clone(),
            status: BetStatus::Void,
            payout: slip.total_stake,
        }]);
        Ok(slip)
    }

    pub async fn cash_out_quote(&self, caller: &Caller, slip_id: Uuid) -> WagerResult<Option<Money>> {
        let slip = self.owned_slip(caller, slip_id).await?;
        if slip.status != BetStatus::Pending {
            return Ok(None);
        }
        Ok(self.cash_out.quote(&slip))
    }

    /// Settle a pending slip early at the cash-out price.
    pub async fn cash_out(&self, caller: &Caller, slip_id: Uuid) -> WagerResult<CashOutReceipt> {
        self.owned_slip(caller, slip_id).await?;

        let receipt = with_retry(self.max_commit_attempts, || async move {
            let current = self.slip(slip_id).await?;
            if current.status != BetStatus::Pending {
                return Err(WagerError::unexpected_status(
                    &format!("slip {slip_id}"),
                    BetStatus::Pending.as_str(),
                    current.status.as_str(),
                ));
            }
            let amount = self.cash_out.quote(&current).ok_or_else(|| {
                WagerError::validation(format!("slip {slip_id} has no cash-out price"))
            })?;

            let head = self.store.account(&current.user_id).await?;
            let credit = PostingDraft::new(
                &head,
                TransactionType::CashOut,
                amount,
                current.currency.clone(),
                format!("slip {slip_id} cashed out"),
            )
            .with_reference("bet_slip", slip_id);

            let mut next = current.next_revision();
            next.status = BetStatus::CashedOut;
            next.payout = Some(amount);
            next.settled_at = Some(Utc::now().trunc_subsecs(6));
            next.settled_by = Some(current.user_id.clone());

            let writes = WriteSet::new()
                .slip(SlipWrite::Transition {
                    expected: BetStatus::Pending,
                    slip: next,
                })
                .posting(credit);
            match self.store.commit(writes).await? {
                CommitOutcome::Committed(receipt) => {
                    let entry = receipt.entries.first().ok_or_else(|| {
                        WagerError::Storage("commit returned no ledger entry".to_string())
                    })?;
                    Ok(CashOutReceipt {
                        slip_id,
                        amount,
                        entry_number: entry.entry_number,
                        balance_after: entry.balance_after,
                    })
                }
                CommitOutcome::Superseded(reason) => Err(WagerError::StateConflict(reason)),
            }
        })
        .await?;

        info!(slip_id = %slip_id, user_id = %caller.user_id, amount = receipt.amount, "slip cashed out");
        self.events.publish(vec![PlatformEvent::BetCashedOut {
            slip_id,
            user_id: caller.user_id.clone(),
            amount: receipt.amount,
        }]);
        Ok(receipt)
    }

    /// Slip visible to `caller`: its owner, or any admin.
    pub async fn owned_slip(&self, caller: &Caller, slip_id: Uuid) -> WagerResult<BetSlip> {
        let slip = self.slip(slip_id).await?;
        if slip.user_id != caller.user_id && caller.role == Role::User {
            return Err(WagerError::Unauthorized {
                caller: caller.user_id.clone(),
                action: format!("access slip {slip_id}"),
            });
        }
        Ok(slip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditRecord;
    use crate::balance::BalanceAccessor;
    use crate::ledger::{AccountHead, LedgerEntry, LedgerQuery};
    use crate::store::{InMemoryWagerStore, QueryWindow};
    use crate::types::{
        Dispute, EscrowTransfer, MarketResult, MatchOutcome, RegulatoryFlag, SelectionRequest,
        SelectionType,
    };
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Barrier;

    /// Store wrapper that can hold the first slip reads at a barrier and slow commits.
    struct Choreographed {
        inner: Arc<dyn WagerStore>,
        held_reads: usize,
        reads: AtomicUsize,
        gate: Barrier,
        commit_delay: std::time::Duration,
    }

    impl Choreographed {
        fn new(inner: Arc<dyn WagerStore>, held_reads: usize, commit_delay: std::time::Duration) -> Self {
            Self {
                inner,
                held_reads,
                reads: AtomicUsize::new(0),
                gate: Barrier::new(held_reads.max(1)),
                commit_delay,
            }
        }
    }

    #[async_trait]
    impl WagerStore for Choreographed {
        fn backend_label(&self) -> &'static str {
            self.inner.backend_label()
        }

        async fn commit(&self, writes: WriteSet) -> WagerResult<CommitOutcome> {
            if !self.commit_delay.is_zero() {
                tokio::time::sleep(self.commit_delay).await;
            }
            self.inner.commit(writes).await
        }

        async fn account(&self, user_id: &str) -> WagerResult<AccountHead> {
            self.inner.account(user_id).await
        }

        async fn set_halted(&self, user_id: &str, halted: bool) -> WagerResult<()> {
            self.inner.set_halted(user_id, halted).await
        }

        async fn chain(&self, user_id: &str) -> WagerResult<Vec<LedgerEntry>> {
            self.inner.chain(user_id).await
        }

        async fn ledger_entries(&self, query: &LedgerQuery) -> WagerResult<Vec<LedgerEntry>> {
            self.inner.ledger_entries(query).await
        }

        async fn slip(&self, slip_id: Uuid) -> WagerResult<Option<BetSlip>> {
            let slip = self.inner.slip(slip_id).await?;
            if self.reads.fetch_add(1, Ordering::SeqCst) < self.held_reads {
                self.gate.wait().await;
            }
            Ok(slip)
        }

        async fn open_slips_for_match(&self, match_id: &str) -> WagerResult<Vec<BetSlip>> {
            self.inner.open_slips_for_match(match_id).await
        }

        async fn slips_for_user(&self, user_id: &str) -> WagerResult<Vec<BetSlip>> {
            self.inner.slips_for_user(user_id).await
        }

        async fn dispute(&self, dispute_id: Uuid) -> WagerResult<Option<Dispute>> {
            self.inner.dispute(dispute_id).await
        }

        async fn disputes_for_slip(&self, slip_id: Uuid) -> WagerResult<Vec<Dispute>> {
            self.inner.disputes_for_slip(slip_id).await
        }

        async fn flags(&self) -> WagerResult<Vec<RegulatoryFlag>> {
            self.inner.flags().await
        }

        async fn escrow_transfers(&self, flag_id: Option<Uuid>) -> WagerResult<Vec<EscrowTransfer>> {
            self.inner.escrow_transfers(flag_id).await
        }

        async fn ensure_platform_float(&self, initial: Money) -> WagerResult<Money> {
            self.inner.ensure_platform_float(initial).await
        }

        async fn platform_float(&self) -> WagerResult<Money> {
            self.inner.platform_float().await
        }

        async fn role_of(&self, user_id: &str) -> WagerResult<Role> {
            self.inner.role_of(user_id).await
        }

        async fn append_audit(&self, event: AuditAppend) -> WagerResult<AuditRecord> {
            self.inner.append_audit(event).await
        }

        async fn audit_log(&self, window: QueryWindow) -> WagerResult<Vec<AuditRecord>> {
            self.inner.audit_log(window).await
        }

        async fn export_table(&self, table: &str) -> WagerResult<Vec<serde_json::Value>> {
            self.inner.export_table(table).await
        }

        async fn export_snapshot(&self) -> WagerResult<BTreeMap<String, Vec<serde_json::Value>>> {
            self.inner.export_snapshot().await
        }

        async fn restore_rows(&self, table: &str, rows: Vec<serde_json::Value>) -> WagerResult<usize> {
            self.inner.restore_rows(table, rows).await
        }
    }

    /// Odds source that answers only after `delay`.
    struct SlowOdds {
        delay: std::time::Duration,
    }

    #[async_trait]
    impl OddsSource for SlowOdds {
        async fn current_odds(
            &self,
            _match_id: &str,
            _selection_type: SelectionType,
            _value: &str,
        ) -> Result<Option<f64>, WagerError> {
            tokio::time::sleep(self.delay).await;
            Ok(Some(2.0))
        }
    }

    fn lifecycle_over(store: Arc<dyn WagerStore>, placement_timeout_ms: u64) -> BetLifecycleManager {
        BetLifecycleManager::new(
            store,
            PricingEngine::default(),
            PlacementPolicy {
                placement_timeout_ms,
                ..PlacementPolicy::default()
            },
            EventBus::new(),
            4,
        )
    }

    struct Harness {
        store: Arc<dyn WagerStore>,
        lifecycle: BetLifecycleManager,
        balances: BalanceAccessor,
    }

    async fn harness(opening_balance: Money) -> Harness {
        let store: Arc<dyn WagerStore> = Arc::new(InMemoryWagerStore::new());
        let balances = BalanceAccessor::new(store.clone(), "USD", 4);
        if opening_balance > 0 {
            balances.deposit("alice", opening_balance, None).await.unwrap();
        }
        let lifecycle = BetLifecycleManager::new(
            store.clone(),
            PricingEngine::default(),
            PlacementPolicy::default(),
            EventBus::new(),
            4,
        );
        Harness {
            store,
            lifecycle,
            balances,
        }
    }

    fn request(stake: Money, legs: Vec<SelectionRequest>) -> PlacementRequest {
        PlacementRequest {
            user_id: "alice".to_string(),
            stake,
            currency: "USD".to_string(),
            selections: legs,
        }
    }

    fn result(match_id: &str, kind: SelectionType, winner: &str) -> ResultEvent {
        ResultEvent {
            match_id: match_id.to_string(),
            outcome: MatchOutcome::Completed {
                markets: vec![MarketResult {
                    selection_type: kind,
                    winning_values: vec![winner.to_string()],
                    void: false,
                }],
            },
        }
    }

    #[tokio::test]
    async fn placement_holds_stake_and_prices_slip() {
        let h = harness(5_000).await;
        let slip = h
            .lifecycle
            .place(
                &Caller::user("alice"),
                request(1_000, vec![SelectionRequest::new("m1", SelectionType::MatchWinner, "home", 2.0)]),
            )
            .await
            .unwrap();

        assert_eq!(slip.status, BetStatus::Pending);
        assert_eq!(slip.potential_win, 1_900);
        assert_eq!(h.balances.get_balance("alice").await.unwrap(), 4_000);

        let chain = h.store.chain("alice").await.unwrap();
        let hold = chain.last().unwrap();
        assert_eq!(hold.transaction_type, TransactionType::StakeHold);
        assert_eq!(hold.balance_before - 1_000, hold.balance_after);
        assert_eq!(hold.reference_id.as_deref(), Some(slip.slip_id.to_string().as_str()));
    }

    #[tokio::test]
    async fn placement_rejections_leave_no_trace() {
        let h = harness(500).await;
        let alice = Caller::user("alice");
        let leg = || SelectionRequest::new("m1", SelectionType::MatchWinner, "home", 2.0);

        let err = h.lifecycle.place(&alice, request(50, vec![leg()])).await.unwrap_err();
        assert_eq!(err.kind(), "validation");

        let err = h.lifecycle.place(&alice, request(1_000, vec![leg()])).await.unwrap_err();
        assert!(matches!(err, WagerError::InsufficientFunds { .. }));

        let err = h
            .lifecycle
            .place(&Caller::user("mallory"), request(200, vec![leg()]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "unauthorized");

        assert_eq!(h.balances.get_balance("alice").await.unwrap(), 500);
        assert!(h.store.slips_for_user("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn winning_single_pays_once_even_if_result_is_redelivered() {
        let h = harness(1_000).await;
        let slip = h
            .lifecycle
            .place(
                &Caller::user("alice"),
                request(1_000, vec![SelectionRequest::new("m1", SelectionType::MatchWinner, "home", 2.0)]),
            )
            .await
            .unwrap();

        let event = result("m1", SelectionType::MatchWinner, "home");
        let first = h.lifecycle.settle_slip(slip.slip_id, &event).await.unwrap();
        let second = h.lifecycle.settle_slip(slip.slip_id, &event).await.unwrap();

        assert_eq!(
            first,
            SettlementOutcome::Settled {
                status: BetStatus::Won,
                payout: 1_900
            }
        );
        assert_eq!(second, SettlementOutcome::NoOp { status: BetStatus::Won });
        assert_eq!(h.balances.get_balance("alice").await.unwrap(), 1_900);
    }

    #[tokio::test]
    async fn partial_result_waits_then_loss_records_zero_entry() {
        let h = harness(1_000).await;
        let slip = h
            .lifecycle
            .place(
                &Caller::user("alice"),
                request(
                    500,
                    vec![
                        SelectionRequest::new("m1", SelectionType::MatchWinner, "home", 2.0),
                        SelectionRequest::new("m2", SelectionType::MatchWinner, "away", 3.0),
                    ],
                ),
            )
            .await
            .unwrap();

        let outcome = h
            .lifecycle
            .settle_slip(slip.slip_id, &result("m1", SelectionType::MatchWinner, "home"))
            .await
            .unwrap();
        assert_eq!(outcome, SettlementOutcome::AwaitingLegs);
        assert_eq!(
            h.lifecycle.slip(slip.slip_id).await.unwrap().status,
            BetStatus::PendingSettlement
        );

        let report = h
            .lifecycle
            .settle_match(&result("m2", SelectionType::MatchWinner, "home"))
            .await
            .unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(
            report.settled[0].1,
            SettlementOutcome::Settled {
                status: BetStatus::Lost,
                payout: 0
            }
        );

        let last = h.store.chain("alice").await.unwrap().pop().unwrap();
        assert_eq!(last.transaction_type, TransactionType::BetLoss);
        assert_eq!(last.amount, 0);
        assert_eq!(h.balances.get_balance("alice").await.unwrap(), 500);
    }

    #[tokio::test]
    async fn cash_out_credits_offer_and_blocks_settlement() {
        let h = harness(2_000).await;
        let alice = Caller::user("alice");
        let slip = h
            .lifecycle
            .place(
                &alice,
                request(1_000, vec![SelectionRequest::new("m1", SelectionType::MatchWinner, "home", 2.0)]),
            )
            .await
            .unwrap();

        assert_eq!(h.lifecycle.cash_out_quote(&alice, slip.slip_id).await.unwrap(), Some(900));
        let receipt = h.lifecycle.cash_out(&alice, slip.slip_id).await.unwrap();
        assert_eq!(receipt.amount, 900);
        assert_eq!(receipt.balance_after, 1_900);

        let again = h.lifecycle.cash_out(&alice, slip.slip_id).await.unwrap_err();
        assert_eq!(again.kind(), "state_conflict");
        let settle = h
            .lifecycle
            .settle_slip(slip.slip_id, &result("m1", SelectionType::MatchWinner, "home"))
            .await
            .unwrap();
        assert_eq!(settle, SettlementOutcome::NoOp { status: BetStatus::CashedOut });
    }

    #[tokio::test]
    async fn racing_results_on_different_legs_both_land() {
        let h = harness(5_000).await;
        let slip = h
            .lifecycle
            .place(
                &Caller::user("alice"),
                request(
                    1_000,
                    vec![
                        SelectionRequest::new("m1", SelectionType::MatchWinner, "home", 2.0),
                        SelectionRequest::new("m2", SelectionType::MatchWinner, "home", 2.0),
                        SelectionRequest::new("m3", SelectionType::MatchWinner, "home", 2.0),
                    ],
                ),
            )
            .await
            .unwrap();
        let first = h
            .lifecycle
            .settle_slip(slip.slip_id, &result("m1", SelectionType::MatchWinner, "home"))
            .await
            .unwrap();
        assert_eq!(first, SettlementOutcome::AwaitingLegs);

        // Both settlers read the same revision before either commits.
        let racing = lifecycle_over(
            Arc::new(Choreographed::new(h.store.clone(), 2, std::time::Duration::ZERO)),
            5_000,
        );
        let m2 = result("m2", SelectionType::MatchWinner, "home");
        let m3 = result("m3", SelectionType::MatchWinner, "home");
        let (a, b) = tokio::join!(
            racing.settle_slip(slip.slip_id, &m2),
            racing.settle_slip(slip.slip_id, &m3)
        );
        let outcomes = [a.unwrap(), b.unwrap()];
        let won = SettlementOutcome::Settled {
            status: BetStatus::Won,
            payout: slip.potential_win,
        };
        assert!(outcomes.contains(&SettlementOutcome::AwaitingLegs));
        assert!(outcomes.contains(&won));

        let stored = h.store.slip(slip.slip_id).await.unwrap().unwrap();
        assert_eq!(stored.status, BetStatus::Won);
        assert!(stored
            .selections
            .iter()
            .all(|leg| leg.status == SelectionStatus::Won));
        assert_eq!(stored.version, 3);
        assert_eq!(
            h.balances.get_balance("alice").await.unwrap(),
            4_000 + slip.potential_win
        );
    }

    #[tokio::test]
    async fn slow_pricing_times_out_without_touching_the_account() {
        let h = harness(5_000).await;
        let slow = lifecycle_over(h.store.clone(), 50).with_odds_source(Arc::new(SlowOdds {
            delay: std::time::Duration::from_millis(500),
        }));

        let err = slow
            .place(
                &Caller::user("alice"),
                request(1_000, vec![SelectionRequest::new("m1", SelectionType::MatchWinner, "home", 2.0)]),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert_eq!(h.balances.get_balance("alice").await.unwrap(), 5_000);
        assert!(h.store.slips_for_user("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn commit_outlasting_the_placement_timeout_still_completes() {
        let h = harness(5_000).await;
        let slow_store = lifecycle_over(
            Arc::new(Choreographed::new(h.store.clone(), 0, std::time::Duration::from_millis(200))),
            50,
        );

        let slip = slow_store
            .place(
                &Caller::user("alice"),
                request(1_000, vec![SelectionRequest::new("m1", SelectionType::MatchWinner, "home", 2.0)]),
            )
            .await
            .unwrap();
        assert_eq!(h.store.slip(slip.slip_id).await.unwrap().unwrap().status, BetStatus::Pending);
        assert_eq!(h.balances.get_balance("alice").await.unwrap(), 4_000);
    }
}
