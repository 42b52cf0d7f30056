//! Dispute Handler.
//!
//! Opening a dispute on a won slip claws the paid amount back (`dispute_freeze`),
//! possibly below zero. Winnings still held by an earlier forfeited or compensated
//! dispute are not frozen again. An admin later closes the dispute:
//!
//! * `released`: frozen funds are credited back.
//! * `forfeited`: funds stay frozen; a zero-amount entry records the decision.
//! * `compensated`: an admin-chosen amount is credited (upheld complaints on lost slips).

use crate::audit::{AuditAppend, AuditStatus};
use crate::error::WagerError;
use crate::events::{EventBus, PlatformEvent};
use crate::ledger::PostingDraft;
use crate::store::{
    with_retry, CommitOutcome, DisputeWrite, WagerResult, WagerStore, WriteSet,
};
use crate::types::{
    BetStatus, Caller, Dispute, DisputeRequest, DisputeResolution, DisputeStatus, Money,
    TransactionType,
};
use chrono::{SubsecRound, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct DisputeHandler {
    store: Arc<dyn WagerStore>,
    events: EventBus,
    max_commit_attempts: u32,
}

impl DisputeHandler {
    pub fn new(store: Arc<dyn WagerStore>, events: EventBus, max_commit_attempts: u32) -> Self {
        Self {
            store,
            events,
            max_commit_attempts,
        }
    }

    pub async fn dispute(&self, dispute_id: Uuid) -> WagerResult<Dispute> {
        self.store
            .dispute(dispute_id)
            .await?
            .ok_or_else(|| WagerError::not_found("dispute", dispute_id))
    }

    pub async fn open(&self, caller: &Caller, request: DisputeRequest) -> WagerResult<Dispute> {
        if request.reason.trim().is_empty() {
            return Err(WagerError::validation("dispute reason is required"));
        }

        let request = &request;
        let dispute = with_retry(self.max_commit_attempts, || async move {
            let slip = self
                .store
                .slip(request.slip_id)
                .await?
                .ok_or_else(|| WagerError::not_found("slip", request.slip_id))?;
            if slip.user_id != caller.user_id {
                return Err(WagerError::Unauthorized {
                    caller: caller.user_id.clone(),
                    action: format!("dispute slip {}", slip.slip_id),
                });
            }
            if !matches!(slip.status, BetStatus::Won | BetStatus::Lost) {
                return Err(WagerError::unexpected_status(
                    &format!("slip {}", slip.slip_id),
                    "won or lost",
                    slip.status.as_str(),
                ));
            }

            let dispute_id = Uuid::new_v4();
            let mut dispute = Dispute {
                dispute_id,
                slip_id: slip.slip_id,
                user_id: slip.user_id.clone(),
                reason: request.reason.trim().to_string(),
                details: request.details.clone(),
                ticket_reference: ticket_reference(dispute_id),
                winnings_frozen: false,
                frozen_amount: 0,
                collections_review: false,
                status: DisputeStatus::Open,
                opened_at: Utc::now().trunc_subsecs(6),
                resolved_at: None,
                resolved_by: None,
                resolution_note: None,
            };

            let mut writes = WriteSet::new();
            if slip.status == BetStatus::Won {
                // Winnings kept by an earlier unreleased dispute are not frozen twice.
                let held: Money = self
                    .store
                    .disputes_for_slip(slip.slip_id)
                    .await?
                    .iter()
                    .filter(|prior| prior.winnings_frozen && prior.status != DisputeStatus::Released)
                    .map(|prior| prior.frozen_amount)
                    .sum();
                let frozen = (slip.payout.unwrap_or(slip.potential_win) - held).max(0);
                let head = self.store.account(&slip.user_id).await?;
                let freeze = PostingDraft::new(
                    &head,
                    TransactionType::DisputeFreeze,
                    -frozen,
                    slip.currency.clone(),
                    format!("winnings frozen pending dispute {dispute_id}"),
                )
                .with_reference("dispute", dispute_id)
                .allowing_negative();

                dispute.winnings_frozen = frozen > 0;
                dispute.frozen_amount = frozen;
                dispute.collections_review = freeze.projected_balance(&head).unwrap_or(0) < 0;
                if dispute.winnings_frozen {
                    writes = writes.posting(freeze);
                } else {
                    debug!(slip_id = %slip.slip_id, held, "winnings already held by an earlier dispute");
                }

                if dispute.collections_review {
                    writes = writes.audit(AuditAppend::new(
                        "system",
                        "collections_review",
                        format!("user:{}", slip.user_id),
                        AuditStatus::Success,
                        format!(
                            "dispute {dispute_id} freeze of {frozen} leaves balance {}",
                            head.balance - frozen
                        ),
                    ));
                }
            }
            writes = writes.dispute(DisputeWrite::Insert(dispute.clone()));

            match self.store.commit(writes).await? {
                CommitOutcome::Committed(_) => Ok(dispute),
                CommitOutcome::Superseded(reason) => Err(WagerError::StateConflict(reason)),
            }
        })
        .await?;

        if dispute.collections_review {
            warn!(
                dispute_id = %dispute.dispute_id,
                user_id = %dispute.user_id,
                frozen_amount = dispute.frozen_amount,
                "dispute freeze drove balance negative; flagged for collections review"
            );
        }
        info!(
            dispute_id = %dispute.dispute_id,
            slip_id = %dispute.slip_id,
            user_id = %dispute.user_id,
            frozen_amount = dispute.frozen_amount,
            ticket = %dispute.ticket_reference,
            "dispute opened"
        );
        self.events.publish(vec![PlatformEvent::DisputeOpened {
            dispute_id: dispute.dispute_id,
            slip_id: dispute.slip_id,
            user_id: dispute.user_id.clone(),
            ticket_reference: dispute.ticket_reference.clone(),
            reason: dispute.reason.clone(),
            frozen_amount: dispute.frozen_amount,
            collections_review: dispute.collections_review,
        }]);
        Ok(dispute)
    }

    /// Close an open dispute. Authorization is the caller's responsibility.
    pub(crate) async fn resolve(
        &self,
        caller: &Caller,
        dispute_id: Uuid,
        resolution: &DisputeResolution,
        note: Option<String>,
        audit: AuditAppend,
    ) -> WagerResult<Dispute> {
        if let DisputeResolution::Compensate { amount } = resolution {
            if *amount <= 0 {
                return Err(WagerError::validation(format!(
                    "compensation must be positive, got {amount}"
                )));
            }
        }

        let note = &note;
        let audit = &audit;
        let (dispute, credited) = with_retry(self.max_commit_attempts, || async move {
            let current = self.dispute(dispute_id).await?;
            if current.status != DisputeStatus::Open {
                return Err(WagerError::unexpected_status(
                    &format!("dispute {dispute_id}"),
                    DisputeStatus::Open.as_str(),
                    current.status.as_str(),
                ));
            }
            let slip = self
                .store
                .slip(current.slip_id)
                .await?
                .ok_or_else(|| WagerError::not_found("slip", current.slip_id))?;

            let (status, credited): (DisputeStatus, Money) = match resolution {
                DisputeResolution::Release => (DisputeStatus::Released, current.frozen_amount),
                DisputeResolution::Forfeit => (DisputeStatus::Forfeited, 0),
                DisputeResolution::Compensate { amount } => (DisputeStatus::Compensated, *amount),
            };

            let head = self.store.account(&current.user_id).await?;
            let posting = PostingDraft::new(
                &head,
                TransactionType::DisputeResolve,
                credited,
                slip.currency.clone(),
                format!("dispute {dispute_id} {}", status.as_str()),
            )
            .with_reference("dispute", dispute_id);

            let mut next = current.clone();
            next.status = status;
            next.resolved_at = Some(Utc::now().trunc_subsecs(6));
            next.resolved_by = Some(caller.user_id.clone());
            next.resolution_note = note.clone();

            let writes = WriteSet::new()
                .dispute(DisputeWrite::Transition {
                    expected: DisputeStatus::Open,
                    dispute: next.clone(),
                })
                .posting(posting)
                .audit(audit.clone());
            match self.store.commit(writes).await? {
                CommitOutcome::Committed(_) => Ok((next, credited)),
                CommitOutcome::Superseded(reason) => Err(WagerError::StateConflict(reason)),
            }
        })
        .await?;

        info!(
            dispute_id = %dispute_id,
            admin = %caller.user_id,
            status = dispute.status.as_str(),
            credited,
            "dispute resolved"
        );
        self.events.publish(vec![PlatformEvent::DisputeResolved {
            dispute_id,
            user_id: dispute.user_id.clone(),
            status: dispute.status,
            credited,
        }]);
        Ok(dispute)
    }
}

/// External support ticket reference, created before the ticket itself exists.
pub fn ticket_reference(dispute_id: Uuid) -> String {
    let simple = dispute_id.simple().to_string().to_ascii_uppercase();
    format!("DSP-{}", &simple[..12])
}
