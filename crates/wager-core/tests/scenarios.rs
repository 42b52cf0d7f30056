//! End-to-end engine scenarios against the in-memory store.

use chrono::{Duration, Utc};
use std::sync::Arc;
use wager_core::{
    AuditStatus, BetStatus, Caller, DisputeRequest, DisputeResolution, DisputeStatus, FlagRequest,
    LedgerQuery, MarketResult, MatchOutcome, Money, PlacementRequest, QueryWindow, ResultEvent,
    Role, SelectionRequest, SelectionType, SettlementOutcome, TransactionType, WagerEngine,
    WagerEngineConfig, WagerError,
};

async fn engine() -> WagerEngine {
    WagerEngine::bootstrap(WagerEngineConfig::default()).await.unwrap()
}

fn root() -> Caller {
    Caller::new("root", Role::Superadmin)
}

fn winner(match_id: &str, value: &str) -> ResultEvent {
    ResultEvent {
        match_id: match_id.to_string(),
        outcome: MatchOutcome::Completed {
            markets: vec![MarketResult {
                selection_type: SelectionType::MatchWinner,
                winning_values: vec![value.to_string()],
                void: false,
            }],
        },
    }
}

fn cancelled(match_id: &str) -> ResultEvent {
    ResultEvent {
        match_id: match_id.to_string(),
        outcome: MatchOutcome::Cancelled,
    }
}

fn slip_request(user: &str, stake: Money, legs: &[(&str, f64)]) -> PlacementRequest {
    PlacementRequest {
        user_id: user.to_string(),
        stake,
        currency: "USD".to_string(),
        selections: legs
            .iter()
            .map(|(match_id, odds)| SelectionRequest::new(*match_id, SelectionType::MatchWinner, "home", *odds))
            .collect(),
    }
}

async fn ledger_kinds(engine: &WagerEngine, user: &str) -> Vec<(TransactionType, Money)> {
    engine
        .store()
        .chain(user)
        .await
        .unwrap()
        .into_iter()
        .map(|entry| (entry.transaction_type, entry.amount))
        .collect()
}

#[tokio::test]
async fn single_selection_places_at_margin_adjusted_odds() {
    let engine = engine().await;
    engine.balances().deposit("alice", 5_000, None).await.unwrap();

    let slip = engine
        .lifecycle()
        .place(&Caller::user("alice"), slip_request("alice", 1_000, &[("m1", 2.0)]))
        .await
        .unwrap();

    assert!((slip.total_odds - 1.90).abs() < 1e-9);
    assert_eq!(slip.correlation_factor, 1.0);
    assert_eq!(slip.potential_win, 1_900);
    assert_eq!(
        ledger_kinds(&engine, "alice").await,
        vec![(TransactionType::Deposit, 5_000), (TransactionType::StakeHold, -1_000)]
    );
    assert_eq!(engine.balances().get_balance("alice").await.unwrap(), 4_000);
}

#[tokio::test]
async fn voided_leg_reprices_from_remaining_live_leg() {
    let engine = engine().await;
    engine.balances().deposit("alice", 5_000, None).await.unwrap();
    let slip = engine
        .lifecycle()
        .place(&Caller::user("alice"), slip_request("alice", 1_000, &[("m1", 2.0), ("m2", 3.0)]))
        .await
        .unwrap();
    assert_eq!(slip.potential_win, 5_700);

    let waiting = engine.lifecycle().settle_match(&cancelled("m1")).await.unwrap();
    assert_eq!(waiting.settled[0].1, SettlementOutcome::AwaitingLegs);

    engine.lifecycle().settle_match(&winner("m2", "home")).await.unwrap();
    let settled = engine.lifecycle().slip(slip.slip_id).await.unwrap();
    assert_eq!(settled.status, BetStatus::Won);
    // 1000 × 3.0 × 0.95, not the placement price.
    assert_eq!(settled.payout, Some(2_850));
    assert_eq!(settled.potential_win, 5_700);
    assert_eq!(engine.balances().get_balance("alice").await.unwrap(), 6_850);
}

#[tokio::test]
async fn all_void_refunds_stake_in_full() {
    let engine = engine().await;
    engine.balances().deposit("alice", 2_000, None).await.unwrap();
    let slip = engine
        .lifecycle()
        .place(&Caller::user("alice"), slip_request("alice", 1_000, &[("m1", 2.0), ("m2", 1.5)]))
        .await
        .unwrap();

    engine.lifecycle().settle_match(&cancelled("m1")).await.unwrap();
    engine.lifecycle().settle_match(&cancelled("m2")).await.unwrap();

    let settled = engine.lifecycle().slip(slip.slip_id).await.unwrap();
    assert_eq!(settled.status, BetStatus::Void);
    assert_eq!(engine.balances().get_balance("alice").await.unwrap(), 2_000);
    let kinds = ledger_kinds(&engine, "alice").await;
    assert_eq!(&kinds[1..], &[(TransactionType::StakeHold, -1_000), (TransactionType::BetVoidRefund, 1_000)]);
}

#[tokio::test]
async fn dispute_on_won_slip_freezes_winnings_even_below_zero() {
    let engine = engine().await;
    let alice = Caller::user("alice");
    engine.balances().deposit("alice", 1_000, None).await.unwrap();
    let slip = engine
        .lifecycle()
        .place(&alice, slip_request("alice", 1_000, &[("m1", 2.0)]))
        .await
        .unwrap();
    engine.lifecycle().settle_match(&winner("m1", "home")).await.unwrap();
    engine.balances().withdraw("alice", 1_900, None).await.unwrap();

    let dispute = engine
        .disputes()
        .open(
            &alice,
            DisputeRequest {
                slip_id: slip.slip_id,
                reason: "wrong result".to_string(),
                details: "feed shows the away side winning".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(dispute.frozen_amount, 1_900);
    assert!(dispute.collections_review);
    assert!(dispute.ticket_reference.starts_with("DSP-"));
    assert_eq!(engine.balances().get_balance("alice").await.unwrap(), -1_900);

    let audit = engine.store().audit_log(QueryWindow::default()).await.unwrap();
    assert!(audit.iter().any(|record| record.action == "collections_review"));

    let released = engine
        .admin()
        .resolve_dispute(&root(), dispute.dispute_id, &DisputeResolution::Release, None)
        .await
        .unwrap();
    assert_eq!(released.status, DisputeStatus::Released);
    assert_eq!(engine.balances().get_balance("alice").await.unwrap(), 0);

    let again = engine
        .admin()
        .resolve_dispute(&root(), dispute.dispute_id, &DisputeResolution::Forfeit, None)
        .await
        .unwrap_err();
    assert_eq!(again.kind(), "state_conflict");
}

#[tokio::test]
async fn pending_slips_cannot_be_disputed() {
    let engine = engine().await;
    let alice = Caller::user("alice");
    engine.balances().deposit("alice", 1_000, None).await.unwrap();
    let slip = engine
        .lifecycle()
        .place(&alice, slip_request("alice", 500, &[("m1", 2.0)]))
        .await
        .unwrap();

    let err = engine
        .disputes()
        .open(
            &alice,
            DisputeRequest {
                slip_id: slip.slip_id,
                reason: "early".to_string(),
                details: String::new(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, WagerError::StateConflict(_)));
    assert_eq!(engine.balances().get_balance("alice").await.unwrap(), 500);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_settlements_pay_exactly_once() {
    let engine = engine().await;
    engine.balances().deposit("alice", 1_000, None).await.unwrap();
    let slip = engine
        .lifecycle()
        .place(&Caller::user("alice"), slip_request("alice", 1_000, &[("m1", 2.0)]))
        .await
        .unwrap();

    let slip_id = slip.slip_id;
    let event = Arc::new(winner("m1", "home"));
    let mut racers = Vec::new();
    for _ in 0..2 {
        let lifecycle = engine.lifecycle().clone();
        let event = event.clone();
        racers.push(tokio::spawn(async move {
            lifecycle.settle_slip(slip_id, &event).await
        }));
    }
    let mut outcomes = Vec::new();
    for racer in racers {
        outcomes.push(racer.await.unwrap().unwrap());
    }

    let settled = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, SettlementOutcome::Settled { .. }))
        .count();
    assert_eq!(settled, 1);
    assert!(outcomes
        .iter()
        .any(|outcome| matches!(outcome, SettlementOutcome::NoOp { status: BetStatus::Won })));
    assert_eq!(engine.balances().get_balance("alice").await.unwrap(), 1_900);

    let wins = ledger_kinds(&engine, "alice")
        .await
        .into_iter()
        .filter(|(kind, _)| *kind == TransactionType::BetWin)
        .count();
    assert_eq!(wins, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn escrow_runs_at_most_once_per_day_under_concurrency() {
    let mut config = WagerEngineConfig::default();
    config.regulatory.initial_platform_float = 1_000_000;
    let engine = WagerEngine::bootstrap(config).await.unwrap();
    engine
        .admin()
        .raise_flag(
            &root(),
            FlagRequest {
                reason: "licence suspension".to_string(),
                effective_from: Some(Utc::now() - Duration::minutes(1)),
                effective_until: None,
                repeatable: true,
            },
        )
        .await
        .unwrap();

    let mut checks = Vec::new();
    for _ in 0..4 {
        let regulatory = engine.regulatory().clone();
        checks.push(tokio::spawn(async move { regulatory.check_and_transfer().await }));
    }
    for check in checks {
        check.await.unwrap().unwrap();
    }

    let transfers = engine.store().escrow_transfers(None).await.unwrap();
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].amount, 200_000);
    assert_eq!(engine.store().platform_float().await.unwrap(), 800_000);
}

#[tokio::test]
async fn tampered_ledger_halts_the_user() {
    let source = engine().await;
    source.balances().deposit("alice", 1_000, None).await.unwrap();
    source.balances().deposit("alice", 500, None).await.unwrap();

    let mut entries = source.store().export_table("ledger_entries").await.unwrap();
    entries[0]["amount"] = serde_json::json!(9_000);
    let balances = source.store().export_table("balances").await.unwrap();

    let target = engine().await;
    target.store().restore_rows("balances", balances).await.unwrap();
    target.store().restore_rows("ledger_entries", entries).await.unwrap();

    let err = target.integrity().verify_user("alice").await.unwrap_err();
    assert!(matches!(err, WagerError::Integrity { .. }));
    assert!(target.store().account("alice").await.unwrap().halted);

    let blocked = target.balances().deposit("alice", 10, None).await.unwrap_err();
    assert!(matches!(blocked, WagerError::IntegrityHalt(_)));

    let audit = target.store().audit_log(QueryWindow::default()).await.unwrap();
    assert_eq!(audit[0].action, "integrity_halt");
    assert_eq!(audit[0].status, AuditStatus::Failed);

    target
        .admin()
        .release_integrity_hold(&root(), "alice", "restored from clean backup")
        .await
        .unwrap();
    assert!(!target.store().account("alice").await.unwrap().halted);
}

#[tokio::test]
async fn ledger_export_filters_by_user() {
    let engine = engine().await;
    engine.balances().deposit("alice", 100, None).await.unwrap();
    engine.balances().deposit("bob", 200, None).await.unwrap();

    let rows = engine
        .store()
        .ledger_entries(&LedgerQuery::for_user("bob"))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].amount, 200);
}
