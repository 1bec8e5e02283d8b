//! Block reward allocation.
//!
//! Turns one forged block, its voter roll (with reconstructed balances) and
//! the plan in effect into a [`ForgedBlock`] row plus reserve, donee and
//! voter allocation rows. Pure: every input is passed in, nothing is read or
//! written.
//!
//! All arithmetic is integer. Percentages enter once, as basis points, and
//! every division truncates, so the rows of a block never sum to more than
//! the net reward plus the optional first-reserve fee bonus.

use crate::errors::AllocationError;
use forgeshare_types::{
    basis_points, raw_vote, Allocation, Amount, ChainBlock, FeePolicy, ForgedBlock, PayeeType,
    Plan,
};
use serde::{Deserialize, Serialize};

/// A voter of the monitored delegate at one height.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoterBalance {
    pub address: String,
    pub balance: Amount,
    pub vote_percent: f64,
}

/// Rows produced for one block.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockAllocation {
    pub block: ForgedBlock,
    pub allocations: Vec<Allocation>,
}

/// Vote weight after mincap, maxcap and blacklist.
pub fn valid_vote(plan: &Plan, address: &str, vote: Amount) -> Amount {
    if vote < plan.mincap || plan.is_blacklisted(address) {
        return Amount::ZERO;
    }
    match plan.maxcap {
        Some(cap) if vote > cap => cap,
        _ => vote,
    }
}

/// `reward - fund deduction`, plus earned fees when they are shared.
pub fn net_reward(
    reward: Amount,
    fund_deduction: Amount,
    earned_fees: Amount,
    fees: FeePolicy,
) -> Amount {
    let earned = reward.saturating_sub(fund_deduction);
    if fees.share_earned_fees {
        earned.saturating_add(earned_fees)
    } else {
        earned
    }
}

/// One voter's cut of the voter pool.
///
/// `net * bps(share) / 10000 * valid / total`, or zero when nobody holds a
/// valid vote.
pub fn voter_allotment(
    net: Amount,
    share_percent: f64,
    valid: Amount,
    total_valid: Amount,
) -> Result<Amount, AllocationError> {
    if total_valid.is_zero() {
        return Ok(Amount::ZERO);
    }
    let pool = net
        .checked_bps(basis_points(share_percent))
        .ok_or(AllocationError::Overflow("voter pool"))?;
    pool.checked_mul_div(valid, total_valid)
        .ok_or(AllocationError::Overflow("voter allotment"))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllocationCalculator {
    fees: FeePolicy,
}

impl AllocationCalculator {
    pub fn new(fees: FeePolicy) -> Self {
        Self { fees }
    }

    pub fn fee_policy(&self) -> FeePolicy {
        self.fees
    }

    /// Allocate `block`'s reward under `plan`.
    ///
    /// `booked` is the unix time stamped on every row.
    pub fn allocate(
        &self,
        block: &ChainBlock,
        delegate: &str,
        round: u64,
        voters: &[VoterBalance],
        plan: &Plan,
        booked: i64,
    ) -> Result<BlockAllocation, AllocationError> {
        let mut votes = Amount::ZERO;
        let mut total_valid = Amount::ZERO;
        let mut weighed = Vec::with_capacity(voters.len());
        for voter in voters {
            let vote = raw_vote(voter.balance, voter.vote_percent);
            let valid = valid_vote(plan, &voter.address, vote);
            votes = votes
                .checked_add(vote)
                .ok_or(AllocationError::Overflow("votes"))?;
            total_valid = total_valid
                .checked_add(valid)
                .ok_or(AllocationError::Overflow("valid votes"))?;
            weighed.push((voter, valid));
        }

        let earned_fees = block.earned_fees();
        let net = net_reward(block.reward, block.fund_deduction, earned_fees, self.fees);
        let fee_bonus = !self.fees.share_earned_fees && self.fees.reserve_gets_fees;

        let mut rows = Vec::with_capacity(plan.reserves.len() + plan.donations.len() + voters.len());
        for (i, reserve) in plan.reserves.iter().enumerate() {
            let mut allotment = net
                .checked_bps(basis_points(reserve.share))
                .ok_or(AllocationError::Overflow("reserve allotment"))?;
            if fee_bonus && i == 0 {
                allotment = allotment
                    .checked_add(earned_fees)
                    .ok_or(AllocationError::Overflow("reserve fee bonus"))?;
            }
            rows.push(Allocation::payee(
                block.height,
                PayeeType::Reserve,
                reserve.address.clone(),
                reserve.share,
                allotment,
                booked,
            ));
        }
        for donee in &plan.donations {
            let allotment = net
                .checked_bps(basis_points(donee.share))
                .ok_or(AllocationError::Overflow("donee allotment"))?;
            rows.push(Allocation::payee(
                block.height,
                PayeeType::Donee,
                donee.address.clone(),
                donee.share,
                allotment,
                booked,
            ));
        }
        for (voter, valid) in weighed {
            let allotment = voter_allotment(net, plan.share, valid, total_valid)?;
            rows.push(Allocation {
                height: block.height,
                address: voter.address.clone(),
                payee_type: PayeeType::Voter,
                balance: voter.balance,
                org_balance: voter.balance,
                vote_percent: voter.vote_percent,
                org_vote_percent: voter.vote_percent,
                valid_vote: valid,
                share_ratio: plan.share,
                allotment,
                org_allotment: allotment,
                booked,
                transaction_id: String::new(),
                settled: 0,
            });
        }

        let mut forged = self.bare_block(block, delegate, round);
        forged.votes = votes;
        forged.valid_votes = total_valid;
        forged.org_valid_votes = total_valid;
        forged.voter_count = voters.len() as u32;
        Ok(BlockAllocation {
            block: forged,
            allocations: rows,
        })
    }

    /// The forged block row with no votes, for heights that share nothing.
    pub fn bare_block(&self, block: &ChainBlock, delegate: &str, round: u64) -> ForgedBlock {
        ForgedBlock {
            round,
            height: block.height,
            timestamp: block.timestamp,
            delegate: delegate.to_string(),
            reward: block.reward,
            fund_deduction: block.fund_deduction,
            fees: block.total_fee,
            burned_fees: block.burned_fee,
            votes: Amount::ZERO,
            valid_votes: Amount::ZERO,
            org_valid_votes: Amount::ZERO,
            voter_count: 0,
        }
    }
}
