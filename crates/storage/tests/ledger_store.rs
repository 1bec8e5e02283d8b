//! Ledger contract tests, run against both the sled and the in-memory store.

use forgeshare_storage::{
    LedgerReader, LedgerStore, MemoryLedgerStore, SledLedgerStore, StorageError,
};
use forgeshare_types::{
    Allocation, AllocationKey, Amount, ForgedBlock, MissedBlock, NetworkParams, PayeeType,
};
use tempfile::TempDir;

fn block(height: u64) -> ForgedBlock {
    ForgedBlock {
        round: height / 10 + 1,
        height,
        timestamp: height * 8,
        delegate: "bp".into(),
        reward: Amount(100_000_000),
        fund_deduction: Amount::ZERO,
        fees: Amount(1_000_000),
        burned_fees: Amount::ZERO,
        votes: Amount(100),
        valid_votes: Amount(100),
        org_valid_votes: Amount(100),
        voter_count: 2,
    }
}

fn voter(height: u64, address: &str, valid: u128, allotment: u128) -> Allocation {
    let mut a = Allocation::payee(
        height,
        PayeeType::Voter,
        address,
        50.0,
        Amount(allotment),
        1_700_000_000,
    );
    a.balance = Amount(valid);
    a.org_balance = Amount(valid);
    a.vote_percent = 100.0;
    a.org_vote_percent = 100.0;
    a.valid_vote = Amount(valid);
    a
}

fn rows_for(height: u64) -> Vec<Allocation> {
    vec![
        Allocation::payee(
            height,
            PayeeType::Reserve,
            "reserve",
            50.0,
            Amount(50_000_000),
            1_700_000_000,
        ),
        voter(height, "alice", 60, 30_000_000),
        voter(height, "bob", 40, 20_000_000),
    ]
}

fn seed<S: LedgerStore>(store: &S, heights: &[u64]) {
    for &h in heights {
        store.insert(&[block(h)], &[], &rows_for(h)).unwrap();
    }
}

fn snapshot<S: LedgerReader>(store: &S) -> (Vec<ForgedBlock>, Vec<Allocation>) {
    (
        store.forged_blocks().unwrap(),
        store.allocations().unwrap(),
    )
}

fn with_stores(check: impl Fn(&dyn LedgerStore)) {
    check(&MemoryLedgerStore::new());
    let dir = TempDir::new().unwrap();
    let sled = SledLedgerStore::open(dir.path().join("ledger")).unwrap();
    check(&sled);
}

fn seed_dyn(store: &dyn LedgerStore, heights: &[u64]) {
    for &h in heights {
        store.insert(&[block(h)], &[], &rows_for(h)).unwrap();
    }
}

#[test]
fn empty_ledger_has_height_zero() {
    with_stores(|store| {
        assert_eq!(store.height().unwrap(), 0);
        assert!(store.last_forged().unwrap().is_none());
        assert!(store.all_voters_last_allocation().unwrap().is_empty());
        assert!(store.pending_summary().unwrap().is_none());
    });
}

#[test]
fn insert_is_idempotent() {
    with_stores(|store| {
        seed_dyn(store, &[10, 20]);
        let before = (
            store.forged_blocks().unwrap(),
            store.allocations().unwrap(),
        );
        store.insert(&[block(20)], &[], &rows_for(20)).unwrap();
        let after = (
            store.forged_blocks().unwrap(),
            store.allocations().unwrap(),
        );
        assert_eq!(before, after);
        assert_eq!(store.height().unwrap(), 20);
        assert_eq!(store.allocations_at(20).unwrap().len(), 3);
    });
}

#[test]
fn insert_replaces_everything_from_batch_floor() {
    with_stores(|store| {
        seed_dyn(store, &[10, 20, 30]);
        store.insert(&[block(20)], &[], &rows_for(20)[..1]).unwrap();
        assert_eq!(store.height().unwrap(), 20);
        assert!(store.forged_block(30).unwrap().is_none());
        assert!(store.allocations_at(30).unwrap().is_empty());
        assert_eq!(store.allocations_at(20).unwrap().len(), 1);
        assert_eq!(store.allocations_at(10).unwrap().len(), 3);
    });
}

#[test]
fn purge_then_reinsert_restores_state() {
    with_stores(|store| {
        seed_dyn(store, &[10, 20, 30]);
        let before = (
            store.forged_blocks().unwrap(),
            store.allocations().unwrap(),
        );
        store.purge_from(20, block(20).timestamp).unwrap();
        assert_eq!(store.height().unwrap(), 10);
        seed_dyn(store, &[20, 30]);
        let after = (
            store.forged_blocks().unwrap(),
            store.allocations().unwrap(),
        );
        assert_eq!(before, after);
    });
}

#[test]
fn purge_honours_timestamp_bound() {
    with_stores(|store| {
        seed_dyn(store, &[10, 20, 30]);
        // height bound beyond the tip, timestamp bound inside it
        store.purge_from(1_000, block(20).timestamp).unwrap();
        assert_eq!(store.height().unwrap(), 10);
        assert_eq!(store.allocations_at(20).unwrap().len(), 3);
    });
}

#[test]
fn rollback_drops_rows_at_and_above_height() {
    with_stores(|store| {
        seed_dyn(store, &[10, 20, 30]);
        store
            .record_missed(&MissedBlock {
                round: 4,
                height: 35,
                delegate: "bp".into(),
                timestamp: 280,
            })
            .unwrap();
        store.rollback_to(20).unwrap();
        assert_eq!(store.height().unwrap(), 10);
        assert!(store.missed_blocks().unwrap().is_empty());
        assert!(store.allocations_at(20).unwrap().is_empty());
    });
}

#[test]
fn update_valid_vote_skips_paid_rows_and_sets_block_total() {
    with_stores(|store| {
        seed_dyn(store, &[10]);
        let bob_key = AllocationKey {
            height: 10,
            payee_type: PayeeType::Voter,
            address: "bob".into(),
        };
        assert_eq!(store.set_transaction_id("tx-bob", &[bob_key]).unwrap(), 1);

        let mut rows = store.voter_allocations_at(Some(10)).unwrap();
        for row in rows.iter_mut() {
            row.valid_vote = Amount::ZERO;
            row.allotment = Amount::ZERO;
        }
        store.update_valid_vote(&rows).unwrap();

        let stored = store.voter_allocations_at(Some(10)).unwrap();
        let alice = stored.iter().find(|a| a.address == "alice").unwrap();
        let bob = stored.iter().find(|a| a.address == "bob").unwrap();
        assert_eq!(alice.valid_vote, Amount::ZERO);
        assert_eq!(bob.valid_vote, Amount(40));
        assert_eq!(bob.allotment, Amount(20_000_000));
        assert_eq!(
            store.forged_block(10).unwrap().unwrap().valid_votes,
            Amount::ZERO
        );
        assert_eq!(
            store.forged_block(10).unwrap().unwrap().org_valid_votes,
            Amount(100)
        );
    });
}

#[test]
fn update_valid_vote_rejects_mixed_heights() {
    with_stores(|store| {
        seed_dyn(store, &[10, 20]);
        let rows = vec![voter(10, "alice", 1, 1), voter(20, "alice", 1, 1)];
        assert!(matches!(
            store.update_valid_vote(&rows),
            Err(StorageError::MixedHeights(10, 20))
        ));
    });
}

#[test]
fn settlement_cycle() {
    with_stores(|store| {
        seed_dyn(store, &[10, 20]);
        let keys: Vec<AllocationKey> = store
            .allocations_at(10)
            .unwrap()
            .iter()
            .map(Allocation::key)
            .collect();
        assert_eq!(store.set_transaction_id("tx1", &keys).unwrap(), 3);
        assert_eq!(store.unsettled_txids().unwrap(), vec!["tx1".to_string()]);

        let net = NetworkParams::default();
        let unpaid = store.unpaid_allocations(i64::MAX, &net).unwrap();
        assert!(unpaid.iter().all(|u| u.allocation.height == 20));
        assert_eq!(unpaid.len(), 3);

        assert_eq!(store.settle("tx1", 1_700_000_100).unwrap(), 3);
        assert_eq!(store.settle("tx1", 1_700_000_200).unwrap(), 0);
        assert!(store.unsettled_txids().unwrap().is_empty());
        let paid = store.last_paid_summary().unwrap().unwrap();
        assert_eq!(paid.height, 10);
        assert_eq!(paid.settled, 1_700_000_100);
        let pending = store.pending_summary().unwrap().unwrap();
        assert_eq!(pending.blocks, 1);
        assert_eq!(pending.min_height, 20);

        assert_eq!(store.clear_transaction_id("tx1").unwrap(), 3);
        assert!(store
            .allocations_at(10)
            .unwrap()
            .iter()
            .all(|a| !a.is_paid() && a.settled == 0));
    });
}

#[test]
fn voters_last_allocation_tracks_latest_height() {
    with_stores(|store| {
        seed_dyn(store, &[10, 20]);
        store
            .insert(&[block(30)], &[], &[voter(30, "carol", 5, 1)])
            .unwrap();
        let latest = store.all_voters_last_allocation().unwrap();
        let heights: Vec<(String, u64)> = latest
            .iter()
            .map(|a| (a.address.clone(), a.height))
            .collect();
        assert_eq!(heights.len(), 3);
        assert!(heights.contains(&("alice".into(), 20)));
        assert!(heights.contains(&("bob".into(), 20)));
        assert_eq!(heights.last(), Some(&("carol".into(), 30)));
    });
}

#[test]
fn ledger_views_join_blocks() {
    with_stores(|store| {
        seed_dyn(store, &[10, 11]);
        let net = NetworkParams::default();
        let at_height = store.ledger_at_height(None, &net).unwrap();
        assert_eq!(at_height.len(), 3);
        assert!(at_height.iter().all(|e| e.height == 11));
        assert_eq!(at_height[0].net_reward, "1.01");

        let at_round = store.ledger_at_round(Some(2), &net).unwrap();
        assert_eq!(at_round.len(), 6);
    });
}

#[test]
fn sled_ledger_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ledger");
    {
        let store = SledLedgerStore::open(&path).unwrap();
        seed(&store, &[10, 20]);
        store.flush().unwrap();
    }
    let store = SledLedgerStore::open(&path).unwrap();
    assert_eq!(store.height().unwrap(), 20);
    let (blocks, rows) = snapshot(&store);
    assert_eq!(blocks.len(), 2);
    assert_eq!(rows.len(), 6);

    let memory = MemoryLedgerStore::new();
    seed(&memory, &[10, 20]);
    assert_eq!(snapshot(&memory), (blocks, rows));
}
