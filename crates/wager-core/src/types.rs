use crate::error::WagerError;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Amounts are signed integers in minor currency units (cents).
pub type Money = i64;

/// Balance-affecting ledger transaction types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    StakeHold,
    BetWin,
    BetLoss,
    BetVoidRefund,
    CashOut,
    ManualPayout,
    RetentionBonus,
    DisputeFreeze,
    DisputeResolve,
    Deposit,
    Withdrawal,
}

impl TransactionType {
    pub const ALL: [TransactionType; 11] = [
        Self::StakeHold,
        Self::BetWin,
        Self::BetLoss,
        Self::BetVoidRefund,
        Self::CashOut,
        Self::ManualPayout,
        Self::RetentionBonus,
        Self::DisputeFreeze,
        Self::DisputeResolve,
        Self::Deposit,
        Self::Withdrawal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::StakeHold => "stake_hold",
            Self::BetWin => "bet_win",
            Self::BetLoss => "bet_loss",
            Self::BetVoidRefund => "bet_void_refund",
            Self::CashOut => "cash_out",
            Self::ManualPayout => "manual_payout",
            Self::RetentionBonus => "retention_bonus",
            Self::DisputeFreeze => "dispute_freeze",
            Self::DisputeResolve => "dispute_resolve",
            Self::Deposit => "deposit",
            Self::Withdrawal => "withdrawal",
        }
    }

    pub fn parse(value: &str) -> Result<Self, WagerError> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| WagerError::validation(format!("unknown transaction type '{value}'")))
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bet slip state machine.
///
/// `pending` and `pending_settlement` are the only non-terminal states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BetStatus {
    Pending,
    PendingSettlement,
    Won,
    Lost,
    Void,
    CashedOut,
}

impl BetStatus {
    pub const ALL: [BetStatus; 6] = [
        Self::Pending,
        Self::PendingSettlement,
        Self::Won,
        Self::Lost,
        Self::Void,
        Self::CashedOut,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::PendingSettlement => "pending_settlement",
            Self::Won => "won",
            Self::Lost => "lost",
            Self::Void => "void",
            Self::CashedOut => "cashed_out",
        }
    }

    pub fn parse(value: &str) -> Result<Self, WagerError> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| WagerError::validation(format!("unknown bet status '{value}'")))
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::PendingSettlement)
    }
}

impl fmt::Display for BetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-leg settlement status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStatus {
    Pending,
    Won,
    Lost,
    Void,
}

/// Market a selection is placed on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SelectionType {
    MatchWinner,
    PlayerProp,
    TotalGoals,
    BothTeamsToScore,
    Handicap,
    CorrectScore,
}

impl SelectionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MatchWinner => "match_winner",
            Self::PlayerProp => "player_prop",
            Self::TotalGoals => "total_goals",
            Self::BothTeamsToScore => "both_teams_to_score",
            Self::Handicap => "handicap",
            Self::CorrectScore => "correct_score",
        }
    }
}

/// One leg of a slip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Selection {
    pub match_id: String,
    pub selection_type: SelectionType,
    pub value: String,
    /// Decimal odds captured at placement.
    pub odds: f64,
    pub status: SelectionStatus,
}

impl Selection {
    pub fn new(
        match_id: impl Into<String>,
        selection_type: SelectionType,
        value: impl Into<String>,
        odds: f64,
    ) -> Self {
        Self {
            match_id: match_id.into(),
            selection_type,
            value: value.into(),
            odds,
            status: SelectionStatus::Pending,
        }
    }
}

/// One wager, owned by the placing user and mutated only by the lifecycle manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BetSlip {
    pub slip_id: Uuid,
    pub user_id: String,
    pub selections: Vec<Selection>,
    pub total_stake: Money,
    pub currency: String,
    pub total_odds: f64,
    pub correlation_factor: f64,
    pub potential_win: Money,
    /// Amount actually credited when the slip reached a paying terminal status.
    pub payout: Option<Money>,
    pub status: BetStatus,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    pub settled_by: Option<String>,
    /// Revision of the stored slip; every transition bumps it by one.
    #[serde(default)]
    pub version: u64,
}

impl BetSlip {
    /// Copy to be written as the next revision of this slip.
    pub fn next_revision(&self) -> BetSlip {
        let mut next = self.clone();
        next.version = self.version + 1;
        next
    }

    pub fn references_match(&self, match_id: &str) -> bool {
        self.selections
            .iter()
            .any(|selection| selection.match_id == match_id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    Open,
    Released,
    Forfeited,
    Compensated,
}

impl DisputeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Released => "released",
            Self::Forfeited => "forfeited",
            Self::Compensated => "compensated",
        }
    }
}

/// Dispute against a settled slip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Dispute {
    pub dispute_id: Uuid,
    pub slip_id: Uuid,
    pub user_id: String,
    pub reason: String,
    pub details: String,
    pub ticket_reference: String,
    pub winnings_frozen: bool,
    pub frozen_amount: Money,
    /// Set when the freeze pushed the balance below zero.
    pub collections_review: bool,
    pub status: DisputeStatus,
    pub opened_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolution_note: Option<String>,
}

/// Active regulator-mandated freeze condition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegulatoryFlag {
    pub flag_id: Uuid,
    pub reason: String,
    pub raised_by: String,
    pub effective_from: DateTime<Utc>,
    pub effective_until: Option<DateTime<Utc>>,
    /// Repeatable flags may transfer once per calendar day, others once ever.
    pub repeatable: bool,
    pub lifted_at: Option<DateTime<Utc>>,
}

impl RegulatoryFlag {
    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        if self.lifted_at.map(|lifted| lifted <= at).unwrap_or(false) {
            return false;
        }
        self.effective_from <= at && self.effective_until.map(|until| at < until).unwrap_or(true)
    }
}

/// Movement of platform float to escrow, triggered by a regulatory flag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EscrowTransfer {
    pub transfer_id: Uuid,
    pub flag_id: Uuid,
    pub amount: Money,
    pub float_before: Money,
    pub float_after: Money,
    pub destination: String,
    pub transfer_day: NaiveDate,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
    Superadmin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
            Self::Superadmin => "superadmin",
        }
    }

    pub fn parse(value: &str) -> Result<Self, WagerError> {
        match value {
            "user" => Ok(Self::User),
            "admin" => Ok(Self::Admin),
            "superadmin" => Ok(Self::Superadmin),
            other => Err(WagerError::validation(format!("unknown role '{other}'"))),
        }
    }
}

/// Authenticated identity invoking an operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub role: Role,
}

impl Caller {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }

    pub fn user(user_id: impl Into<String>) -> Self {
        Self::new(user_id, Role::User)
    }

    /// Identity used for automated settlement and scheduled jobs.
    pub fn system() -> Self {
        Self::new("system", Role::Superadmin)
    }
}

/// Requested leg, as quoted to the player.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionRequest {
    pub match_id: String,
    pub selection_type: SelectionType,
    pub value: String,
    pub odds: f64,
    pub quoted_at: DateTime<Utc>,
}

impl SelectionRequest {
    pub fn new(
        match_id: impl Into<String>,
        selection_type: SelectionType,
        value: impl Into<String>,
        odds: f64,
    ) -> Self {
        Self {
            match_id: match_id.into(),
            selection_type,
            value: value.into(),
            odds,
            quoted_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementRequest {
    pub user_id: String,
    pub stake: Money,
    pub currency: String,
    pub selections: Vec<SelectionRequest>,
}

/// Result of one market in a finished event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketResult {
    pub selection_type: SelectionType,
    #[serde(default)]
    pub winning_values: Vec<String>,
    #[serde(default)]
    pub void: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchOutcome {
    /// Results for the markets known so far; markets not listed remain pending.
    Completed { markets: Vec<MarketResult> },
    /// Event cancelled: every selection on it is void.
    Cancelled,
}

/// Authoritative result feed message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEvent {
    pub match_id: String,
    pub outcome: MatchOutcome,
}

impl ResultEvent {
    /// Outcome of a selection under this result, or `None` if its market has no result yet.
    pub fn resolve(&self, selection: &Selection) -> Option<SelectionStatus> {
        if selection.match_id != self.match_id {
            return None;
        }
        match &self.outcome {
            MatchOutcome::Cancelled => Some(SelectionStatus::Void),
            MatchOutcome::Completed { markets } => markets
                .iter()
                .find(|market| market.selection_type == selection.selection_type)
                .map(|market| {
                    if market.void {
                        SelectionStatus::Void
                    } else if market
                        .winning_values
                        .iter()
                        .any(|value| value.eq_ignore_ascii_case(&selection.value))
                    {
                        SelectionStatus::Won
                    } else {
                        SelectionStatus::Lost
                    }
                }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisputeRequest {
    pub slip_id: Uuid,
    pub reason: String,
    pub details: String,
}

/// Admin decision closing an open dispute.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum DisputeResolution {
    /// Winnings confirmed; frozen funds are credited back.
    Release,
    /// Winnings revoked; frozen funds stay debited.
    Forfeit,
    /// Complaint upheld; the given amount is credited.
    Compensate { amount: Money },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn status_strings_roundtrip() {
        for status in BetStatus::ALL {
            assert_eq!(BetStatus::parse(status.as_str()).unwrap(), status);
        }
        for kind in TransactionType::ALL {
            assert_eq!(TransactionType::parse(kind.as_str()).unwrap(), kind);
        }
    }

    #[test]
    fn only_pending_states_are_non_terminal() {
        assert!(!BetStatus::Pending.is_terminal());
        assert!(!BetStatus::PendingSettlement.is_terminal());
        assert!(BetStatus::Won.is_terminal());
        assert!(BetStatus::CashedOut.is_terminal());
    }

    #[test]
    fn result_event_resolves_by_market() {
        let event = ResultEvent {
            match_id: "m1".to_string(),
            outcome: MatchOutcome::Completed {
                markets: vec![MarketResult {
                    selection_type: SelectionType::MatchWinner,
                    winning_values: vec!["home".to_string()],
                    void: false,
                }],
            },
        };

        let home = Selection::new("m1", SelectionType::MatchWinner, "HOME", 2.0);
        let away = Selection::new("m1", SelectionType::MatchWinner, "away", 3.0);
        let prop = Selection::new("m1", SelectionType::PlayerProp, "kane_to_score", 2.5);
        let other = Selection::new("m2", SelectionType::MatchWinner, "home", 2.0);

        assert_eq!(event.resolve(&home), Some(SelectionStatus::Won));
        assert_eq!(event.resolve(&away), Some(SelectionStatus::Lost));
        assert_eq!(event.resolve(&prop), None);
        assert_eq!(event.resolve(&other), None);
    }

    #[test]
    fn cancelled_event_voids_every_selection() {
        let event = ResultEvent {
            match_id: "m1".to_string(),
            outcome: MatchOutcome::Cancelled,
        };
        let prop = Selection::new("m1", SelectionType::PlayerProp, "x", 4.0);
        assert_eq!(event.resolve(&prop), Some(SelectionStatus::Void));
    }

    #[test]
    fn flag_activity_window() {
        let now = Utc::now();
        let mut flag = RegulatoryFlag {
            flag_id: Uuid::new_v4(),
            reason: "regulator order".to_string(),
            raised_by: "ops".to_string(),
            effective_from: now - Duration::hours(1),
            effective_until: Some(now + Duration::hours(1)),
            repeatable: false,
            lifted_at: None,
        };
        assert!(flag.is_active_at(now));
        assert!(!flag.is_active_at(now + Duration::hours(2)));

        flag.lifted_at = Some(now - Duration::minutes(1));
        assert!(!flag.is_active_at(now));
    }
}
