//! Property tests: settlement is idempotent under result redelivery.

use proptest::prelude::*;
use wager_core::{
    BetStatus, Caller, MarketResult, MatchOutcome, PlacementRequest, ResultEvent,
    SelectionRequest, SelectionType, SettlementOutcome, TransactionType, WagerEngine,
    WagerEngineConfig,
};

#[derive(Debug, Clone, Copy)]
enum Feed {
    Win,
    Lose,
    Void,
}

fn arb_feed() -> impl Strategy<Value = Feed> {
    prop_oneof![Just(Feed::Win), Just(Feed::Lose), Just(Feed::Void)]
}

fn event_for(match_id: &str, feed: Feed) -> ResultEvent {
    let outcome = match feed {
        Feed::Void => MatchOutcome::Cancelled,
        Feed::Win | Feed::Lose => MatchOutcome::Completed {
            markets: vec![MarketResult {
                selection_type: SelectionType::MatchWinner,
                winning_values: vec![if matches!(feed, Feed::Win) { "home" } else { "away" }.to_string()],
                void: false,
            }],
        },
    };
    ResultEvent {
        match_id: match_id.to_string(),
        outcome,
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Redelivering every result any number of times yields one terminal status and
    /// the same balance as a single delivery.
    #[test]
    fn redelivery_changes_nothing(
        stake in 100i64..5_000,
        odds in prop::collection::vec(1.05f64..6.0, 1..4),
        feeds in prop::collection::vec(arb_feed(), 4),
        deliveries in 2usize..4,
    ) {
        runtime().block_on(async {
            let engine = WagerEngine::bootstrap(WagerEngineConfig::default()).await.unwrap();
            engine.balances().deposit("punter", 10_000, None).await.unwrap();

            let request = PlacementRequest {
                user_id: "punter".to_string(),
                stake,
                currency: "USD".to_string(),
                selections: odds
                    .iter()
                    .enumerate()
                    .map(|(leg, price)| SelectionRequest::new(format!("m{leg}"), SelectionType::MatchWinner, "home", *price))
                    .collect(),
            };
            let slip = engine.lifecycle().place(&Caller::user("punter"), request).await.unwrap();

            let events: Vec<ResultEvent> = (0..odds.len())
                .map(|leg| event_for(&format!("m{leg}"), feeds[leg]))
                .collect();
            for event in &events {
                engine.lifecycle().settle_slip(slip.slip_id, event).await.unwrap();
            }
            let settled = engine.lifecycle().slip(slip.slip_id).await.unwrap();
            let balance = engine.balances().get_balance("punter").await.unwrap();
            let entries = engine.store().chain("punter").await.unwrap().len();
            prop_assert!(settled.status.is_terminal());

            for _ in 1..deliveries {
                for event in &events {
                    let outcome = engine.lifecycle().settle_slip(slip.slip_id, event).await.unwrap();
                    prop_assert_eq!(outcome, SettlementOutcome::NoOp { status: settled.status });
                }
            }
            prop_assert_eq!(engine.balances().get_balance("punter").await.unwrap(), balance);
            prop_assert_eq!(engine.store().chain("punter").await.unwrap().len(), entries);

            let expected = match settled.status {
                BetStatus::Won => 10_000 - stake + settled.payout.unwrap_or_default(),
                BetStatus::Void => 10_000,
                _ => 10_000 - stake,
            };
            prop_assert_eq!(balance, expected);

            let settlement_entries = engine
                .store()
                .chain("punter")
                .await
                .unwrap()
                .into_iter()
                .filter(|entry| matches!(
                    entry.transaction_type,
                    TransactionType::BetWin | TransactionType::BetLoss | TransactionType::BetVoidRefund
                ))
                .count();
            prop_assert_eq!(settlement_entries, 1);
            Ok(())
        })?;
    }
}
