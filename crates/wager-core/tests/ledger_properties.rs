//! Property tests: per-user hash chain arithmetic and tamper evidence.

use chrono::Utc;
use proptest::prelude::*;
use wager_core::ledger::seal;
use wager_core::{
    compute_entry_hash, verify_chain, AccountHead, LedgerEntry, PostingDraft, TransactionType,
    WagerError,
};

fn kind_for(amount: i64) -> TransactionType {
    if amount >= 0 {
        TransactionType::Deposit
    } else {
        TransactionType::Withdrawal
    }
}

/// Apply `amounts` in order, skipping postings the balance cannot cover.
fn build_chain(user: &str, amounts: &[i64]) -> (AccountHead, Vec<LedgerEntry>) {
    let mut head = AccountHead::empty(user);
    let mut chain = Vec::new();
    for amount in amounts {
        let draft = PostingDraft::new(&head, kind_for(*amount), *amount, "USD", "generated");
        match seal(&draft, &head, Utc::now()) {
            Ok(entry) => {
                head = head.advanced(&entry);
                chain.push(entry);
            }
            Err(WagerError::InsufficientFunds { .. }) => {}
            Err(other) => panic!("unexpected seal failure: {other}"),
        }
    }
    (head, chain)
}

proptest! {
    /// Balance always equals the latest balance_after, which equals the sum of amounts.
    #[test]
    fn head_tracks_chain(amounts in prop::collection::vec(-800i64..1_000, 1..40)) {
        let (head, chain) = build_chain("alice", &amounts);
        prop_assert!(verify_chain("alice", &chain).is_ok());

        let last = chain.last().map(|entry| entry.balance_after).unwrap_or(0);
        prop_assert_eq!(head.balance, last);
        prop_assert_eq!(head.entry_number, chain.len() as u64);
        prop_assert_eq!(chain.iter().map(|entry| entry.amount).sum::<i64>(), head.balance);
        for entry in &chain {
            prop_assert_eq!(entry.balance_after - entry.balance_before, entry.amount);
            prop_assert!(entry.balance_after >= 0);
        }
    }

    /// Editing any historical entry breaks verification, even if its hash is refreshed.
    #[test]
    fn tampering_is_detected(
        amounts in prop::collection::vec(1i64..1_000, 2..30),
        pick in any::<prop::sample::Index>(),
        refresh_hash in any::<bool>(),
    ) {
        let (_, mut chain) = build_chain("bob", &amounts);
        let target = pick.index(chain.len() - 1);
        {
            let entry = &mut chain[target];
            entry.amount += 1;
            entry.balance_after += 1;
            if refresh_hash {
                entry.entry_hash = compute_entry_hash(entry);
            }
        }
        let verdict = verify_chain("bob", &chain);
        prop_assert!(
            matches!(verdict, Err(WagerError::Integrity { .. })),
            "tampered entry {} went unnoticed",
            target + 1
        );
    }

    /// A draft read against a stale head never seals.
    #[test]
    fn stale_heads_conflict(amounts in prop::collection::vec(1i64..1_000, 1..10)) {
        let (head, _) = build_chain("carol", &amounts);
        let stale = AccountHead::empty("carol");
        let draft = PostingDraft::new(&stale, TransactionType::Deposit, 10, "USD", "late");
        let sealed = seal(&draft, &head, Utc::now());
        prop_assert!(
            matches!(sealed, Err(WagerError::SequenceConflict { .. })),
            "stale draft sealed"
        );
    }
}

#[test]
fn dispute_clawback_may_cross_zero_but_stakes_may_not() {
    let (head, _) = build_chain("dave", &[300]);
    let stake = PostingDraft::new(&head, TransactionType::StakeHold, -400, "USD", "stake");
    assert!(matches!(
        seal(&stake, &head, Utc::now()),
        Err(WagerError::InsufficientFunds { .. })
    ));

    let freeze = PostingDraft::new(&head, TransactionType::DisputeFreeze, -400, "USD", "freeze")
        .allowing_negative();
    let entry = seal(&freeze, &head, Utc::now()).unwrap();
    assert_eq!(entry.balance_after, -100);
}
