//! Retroactive correction of the latest block's voter allotments.
//!
//! A voter who moves funds out or lowers their vote right after the
//! delegate forged should not keep the weight they held at forging time.
//! The corrector reduces that voter's row, re-derives its valid vote under
//! the plan in effect for the block, and re-spreads the voter pool over
//! every voter row of the block.

use crate::allocation::{net_reward, valid_vote, voter_allotment};
use crate::errors::AntiBotError;
use crate::plan_book::PlanBook;
use forgeshare_storage::LedgerStore;
use forgeshare_types::{Amount, FeePolicy, ForgedBlock};
use std::sync::Arc;
use tracing::{debug, info};

/// What the voter did after the block was forged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reduction {
    /// Outgoing transfer; balance drops by `amount + fee`, floored at zero.
    Transfer { amount: Amount, fee: Amount },
    /// New, lower vote percent for the monitored delegate.
    VotePercent { new_percent: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CorrectionOutcome {
    Corrected {
        old_valid: Amount,
        new_valid: Amount,
        /// Sum of valid votes over the block after the correction.
        valid_votes: Amount,
    },
    NotAVoter,
    AlreadyPaid,
    Unchanged,
}

/// True when an event in `event_round` still falls inside the window that
/// follows the round of the last forged block.
pub fn is_eligible(event_round: u64, last_forged_round: u64, window: u64) -> bool {
    event_round.saturating_sub(last_forged_round) <= window
}

pub struct AntiBotCorrector {
    plans: Arc<PlanBook>,
    fees: FeePolicy,
}

impl AntiBotCorrector {
    pub fn new(plans: Arc<PlanBook>, fees: FeePolicy) -> Self {
        Self { plans, fees }
    }

    /// Apply `reduction` to `address`'s row in `block` and rewrite the
    /// block's voter rows.
    ///
    /// Rows that already carry a transaction id are counted in the new
    /// total but never rewritten.
    pub fn correct(
        &self,
        store: &dyn LedgerStore,
        block: &ForgedBlock,
        address: &str,
        reduction: Reduction,
    ) -> Result<CorrectionOutcome, AntiBotError> {
        let mut rows = store.voter_allocations_at(Some(block.height))?;
        let Some(idx) = rows.iter().position(|a| a.address == address) else {
            return Ok(CorrectionOutcome::NotAVoter);
        };
        if rows[idx].is_paid() {
            debug!(target: "antibot", address, height = block.height, "Row already paid");
            return Ok(CorrectionOutcome::AlreadyPaid);
        }

        let row = &mut rows[idx];
        match reduction {
            Reduction::Transfer { amount, fee } => {
                let spent = amount.saturating_add(fee);
                if spent.is_zero() || row.balance.is_zero() {
                    return Ok(CorrectionOutcome::Unchanged);
                }
                row.balance = row.balance.saturating_sub(spent);
            }
            Reduction::VotePercent { new_percent } => {
                if new_percent >= row.vote_percent {
                    return Ok(CorrectionOutcome::Unchanged);
                }
                row.vote_percent = new_percent;
            }
        }

        let plan = self.plans.resolve(block.height, block.timestamp);
        let old_valid = row.valid_vote;
        row.valid_vote = valid_vote(&plan, &row.address, row.vote());
        let new_valid = row.valid_vote;

        let total: Amount = rows.iter().map(|a| a.valid_vote).sum();
        let net = net_reward(
            block.reward,
            block.fund_deduction,
            block.earned_fees(),
            self.fees,
        );
        for row in rows.iter_mut() {
            row.allotment = voter_allotment(net, row.share_ratio, row.valid_vote, total)?;
        }
        store.update_valid_vote(&rows)?;

        info!(
            target: "antibot",
            address,
            height = block.height,
            old_valid = %old_valid,
            new_valid = %new_valid,
            "Voter allotments corrected"
        );
        Ok(CorrectionOutcome::Corrected {
            old_valid,
            new_valid,
            valid_votes: total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgeshare_storage::{LedgerReader, MemoryLedgerStore};
    use forgeshare_types::{
        Allocation, AllocationKey, NetworkParams, PayeeType, Payee, PlanDecl,
    };

    fn book() -> Arc<PlanBook> {
        let base = PlanDecl {
            share: Some(50.0),
            reserves: Some(vec![Payee {
                address: "reserve".into(),
                share: 50.0,
            }]),
            ..Default::default()
        };
        Arc::new(PlanBook::new(vec![base], NetworkParams::default()).unwrap())
    }

    fn block() -> ForgedBlock {
        ForgedBlock {
            round: 2,
            height: 100,
            timestamp: 800,
            delegate: "bp".into(),
            reward: Amount(100_000_000),
            fund_deduction: Amount::ZERO,
            fees: Amount::ZERO,
            burned_fees: Amount::ZERO,
            votes: Amount(100),
            valid_votes: Amount(100),
            org_valid_votes: Amount(100),
            voter_count: 2,
        }
    }

    fn voter(address: &str, balance: u128, allotment: u128) -> Allocation {
        let mut a = Allocation::payee(100, PayeeType::Voter, address, 50.0, Amount(allotment), 0);
        a.balance = Amount(balance);
        a.org_balance = Amount(balance);
        a.vote_percent = 100.0;
        a.org_vote_percent = 100.0;
        a.valid_vote = Amount(balance);
        a
    }

    fn seeded() -> MemoryLedgerStore {
        let store = MemoryLedgerStore::new();
        store
            .insert(
                &[block()],
                &[],
                &[
                    Allocation::payee(100, PayeeType::Reserve, "reserve", 50.0, Amount(50_000_000), 0),
                    voter("alice", 60, 30_000_000),
                    voter("bob", 40, 20_000_000),
                ],
            )
            .unwrap();
        store
    }

    fn row(store: &MemoryLedgerStore, address: &str) -> Allocation {
        store
            .voter_allocations_at(Some(100))
            .unwrap()
            .into_iter()
            .find(|a| a.address == address)
            .unwrap()
    }

    #[test]
    fn transfer_out_moves_pool_to_remaining_voters() {
        let store = seeded();
        let corrector = AntiBotCorrector::new(book(), FeePolicy::default());
        let outcome = corrector
            .correct(
                &store,
                &block(),
                "alice",
                Reduction::Transfer {
                    amount: Amount(60),
                    fee: Amount(1),
                },
            )
            .unwrap();
        assert_eq!(
            outcome,
            CorrectionOutcome::Corrected {
                old_valid: Amount(60),
                new_valid: Amount::ZERO,
                valid_votes: Amount(40),
            }
        );

        let alice = row(&store, "alice");
        assert_eq!(alice.balance, Amount::ZERO);
        assert_eq!(alice.allotment, Amount::ZERO);
        assert_eq!(alice.org_allotment, Amount(30_000_000));
        assert!(alice.is_corrected());
        assert_eq!(row(&store, "bob").allotment, Amount(50_000_000));
        let stored = store.forged_block(100).unwrap().unwrap();
        assert_eq!(stored.valid_votes, Amount(40));
        assert_eq!(stored.org_valid_votes, Amount(100));
    }

    #[test]
    fn lower_vote_percent_reduces_weight() {
        let store = seeded();
        let corrector = AntiBotCorrector::new(book(), FeePolicy::default());
        corrector
            .correct(
                &store,
                &block(),
                "bob",
                Reduction::VotePercent { new_percent: 50.0 },
            )
            .unwrap();
        let bob = row(&store, "bob");
        assert_eq!(bob.vote_percent, 50.0);
        assert_eq!(bob.valid_vote, Amount(20));
        // pool 50M over 60 + 20
        assert_eq!(bob.allotment, Amount(12_500_000));
        assert_eq!(row(&store, "alice").allotment, Amount(37_500_000));

        let again = corrector
            .correct(
                &store,
                &block(),
                "bob",
                Reduction::VotePercent { new_percent: 80.0 },
            )
            .unwrap();
        assert_eq!(again, CorrectionOutcome::Unchanged);
    }

    #[test]
    fn paid_rows_are_left_alone() {
        let store = seeded();
        let key = AllocationKey {
            height: 100,
            payee_type: PayeeType::Voter,
            address: "bob".into(),
        };
        store.set_transaction_id("tx-bob", &[key]).unwrap();
        let corrector = AntiBotCorrector::new(book(), FeePolicy::default());

        let paid = corrector
            .correct(
                &store,
                &block(),
                "bob",
                Reduction::Transfer {
                    amount: Amount(10),
                    fee: Amount::ZERO,
                },
            )
            .unwrap();
        assert_eq!(paid, CorrectionOutcome::AlreadyPaid);

        corrector
            .correct(
                &store,
                &block(),
                "alice",
                Reduction::Transfer {
                    amount: Amount(30),
                    fee: Amount::ZERO,
                },
            )
            .unwrap();
        let bob = row(&store, "bob");
        assert_eq!(bob.allotment, Amount(20_000_000));
        assert_eq!(bob.valid_vote, Amount(40));
        assert_eq!(row(&store, "alice").allotment, Amount(21_428_571));
    }

    #[test]
    fn unknown_address_is_not_a_voter() {
        let store = seeded();
        let corrector = AntiBotCorrector::new(book(), FeePolicy::default());
        let outcome = corrector
            .correct(
                &store,
                &block(),
                "mallory",
                Reduction::VotePercent { new_percent: 0.0 },
            )
            .unwrap();
        assert_eq!(outcome, CorrectionOutcome::NotAVoter);
    }

    #[test]
    fn eligibility_window() {
        assert!(is_eligible(5, 5, 1));
        assert!(is_eligible(6, 5, 1));
        assert!(!is_eligible(7, 5, 1));
        assert!(is_eligible(4, 5, 1));
    }
}
