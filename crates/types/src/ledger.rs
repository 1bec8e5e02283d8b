//! Ledger records: forged blocks, missed slots and per-payee allocations,
//! plus the read-only views built from them.

use crate::amount::{basis_points, Amount, BPS_DENOMINATOR};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Payee class of an allocation row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayeeType {
    Reserve = 0,
    Voter = 1,
    Donee = 2,
}

impl PayeeType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PayeeType::Reserve),
            1 => Some(PayeeType::Voter),
            2 => Some(PayeeType::Donee),
            _ => None,
        }
    }
}

impl fmt::Display for PayeeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayeeType::Reserve => f.write_str("reserve"),
            PayeeType::Voter => f.write_str("voter"),
            PayeeType::Donee => f.write_str("donee"),
        }
    }
}

/// A block as reported by the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainBlock {
    pub id: String,
    pub height: u64,
    /// Epoch stamp (seconds since genesis).
    pub timestamp: u64,
    pub generator_public_key: String,
    pub reward: Amount,
    pub fund_deduction: Amount,
    pub total_fee: Amount,
    pub burned_fee: Amount,
}

impl ChainBlock {
    pub fn earned_fees(&self) -> Amount {
        self.total_fee.saturating_sub(self.burned_fee)
    }
}

/// One row per height forged by the monitored delegate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForgedBlock {
    pub round: u64,
    pub height: u64,
    pub timestamp: u64,
    pub delegate: String,
    pub reward: Amount,
    pub fund_deduction: Amount,
    pub fees: Amount,
    pub burned_fees: Amount,
    pub votes: Amount,
    /// Sum of valid votes; the only field rewritten after insertion.
    pub valid_votes: Amount,
    pub org_valid_votes: Amount,
    pub voter_count: u32,
}

impl ForgedBlock {
    pub fn earned_rewards(&self) -> Amount {
        self.reward.saturating_sub(self.fund_deduction)
    }

    pub fn earned_fees(&self) -> Amount {
        self.fees.saturating_sub(self.burned_fees)
    }

    pub fn net_reward(&self) -> Amount {
        self.earned_rewards().saturating_add(self.earned_fees())
    }
}

/// A forging slot the delegate missed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissedBlock {
    pub round: u64,
    pub height: u64,
    pub delegate: String,
    pub timestamp: u64,
}

/// Primary key of an allocation row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AllocationKey {
    pub height: u64,
    pub payee_type: PayeeType,
    pub address: String,
}

/// One payee's share of one forged block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub height: u64,
    pub address: String,
    pub payee_type: PayeeType,
    pub balance: Amount,
    pub org_balance: Amount,
    pub vote_percent: f64,
    pub org_vote_percent: f64,
    pub valid_vote: Amount,
    pub share_ratio: f64,
    pub allotment: Amount,
    pub org_allotment: Amount,
    /// Unix seconds the row was computed.
    pub booked: i64,
    /// Empty until a payment is submitted.
    pub transaction_id: String,
    /// Unix seconds the payment was confirmed, 0 while unconfirmed.
    pub settled: i64,
}

impl Allocation {
    /// A reserve or donee row.
    pub fn payee(
        height: u64,
        payee_type: PayeeType,
        address: impl Into<String>,
        share_ratio: f64,
        allotment: Amount,
        booked: i64,
    ) -> Self {
        Self {
            height,
            address: address.into(),
            payee_type,
            balance: Amount::ZERO,
            org_balance: Amount::ZERO,
            vote_percent: 0.0,
            org_vote_percent: 0.0,
            valid_vote: Amount::ZERO,
            share_ratio,
            allotment,
            org_allotment: allotment,
            booked,
            transaction_id: String::new(),
            settled: 0,
        }
    }

    pub fn key(&self) -> AllocationKey {
        AllocationKey {
            height: self.height,
            payee_type: self.payee_type,
            address: self.address.clone(),
        }
    }

    pub fn is_paid(&self) -> bool {
        !self.transaction_id.is_empty()
    }

    /// Raw vote weight: `balance * bps(vote_percent) / 10000`.
    pub fn vote(&self) -> Amount {
        raw_vote(self.balance, self.vote_percent)
    }

    /// True when anti-bot processing changed this row since it was booked.
    pub fn is_corrected(&self) -> bool {
        self.balance != self.org_balance || self.vote_percent != self.org_vote_percent
    }
}

/// `balance * round(percent * 100) / 10000`, saturating.
pub fn raw_vote(balance: Amount, percent: f64) -> Amount {
    balance
        .checked_bps(basis_points(percent))
        .unwrap_or_else(|| Amount(balance.0 / BPS_DENOMINATOR * basis_points(percent)))
}

/// Joined block and allocation row with human readable amounts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub round: u64,
    pub height: u64,
    pub forged_time: String,
    pub reward: String,
    pub earned_rewards: String,
    pub earned_fees: String,
    pub net_reward: String,
    pub valid_votes: String,
    pub address: String,
    pub payee_type: PayeeType,
    pub balance: String,
    pub vote_percent: f64,
    pub vote: String,
    pub valid_vote: String,
    pub share_ratio: f64,
    pub allotment: String,
    pub booked_time: String,
    pub transaction_id: String,
    pub settled_time: Option<String>,
    pub org_balance: String,
    pub org_vote_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastPaidSummary {
    pub round: u64,
    pub height: u64,
    pub transaction_id: String,
    pub settled: i64,
}

/// Totals over blocks forged since the last paid height.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSummary {
    pub min_round: u64,
    pub max_round: u64,
    pub rounds: u64,
    pub min_height: u64,
    pub max_height: u64,
    pub blocks: u64,
    pub block_rewards: Amount,
    pub block_funds: Amount,
    pub block_fees: Amount,
    pub burned_fees: Amount,
    pub earned_rewards: Amount,
    pub earned_fees: Amount,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForgingStats {
    pub first_round: u64,
    pub last_round: u64,
    pub round_count: u64,
    pub first_forged: u64,
    pub last_forged: u64,
    pub forged_count: u64,
    pub block_rewards: Amount,
    pub block_funds: Amount,
    pub block_fees: Amount,
    pub burned_fees: Amount,
    pub earned_rewards: Amount,
    pub earned_fees: Amount,
    pub avg_votes: Amount,
    pub avg_voter_count: f64,
}

/// How consistently an address kept its vote after being credited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoterCommitment {
    pub address: String,
    pub block_count: u64,
    pub blocks_vote_not_reduced: u64,
}

/// Allocation totals for one address over a time window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressScan {
    pub address: String,
    pub block_count: u64,
    pub corrected_blocks: u64,
    pub org_allotted: Amount,
    pub allotted: Amount,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forged_block_views() {
        let block = ForgedBlock {
            round: 1,
            height: 10,
            timestamp: 80,
            delegate: "bp".into(),
            reward: Amount(100),
            fund_deduction: Amount(10),
            fees: Amount(7),
            burned_fees: Amount(2),
            votes: Amount::ZERO,
            valid_votes: Amount::ZERO,
            org_valid_votes: Amount::ZERO,
            voter_count: 0,
        };
        assert_eq!(block.earned_rewards(), Amount(90));
        assert_eq!(block.earned_fees(), Amount(5));
        assert_eq!(block.net_reward(), Amount(95));
    }

    #[test]
    fn vote_uses_rounded_basis_points() {
        assert_eq!(raw_vote(Amount(1_000), 33.335), Amount(333));
        assert_eq!(raw_vote(Amount(1_000), 100.0), Amount(1_000));
        assert_eq!(raw_vote(Amount(1_000), 0.0), Amount::ZERO);
    }

    #[test]
    fn payee_type_codes() {
        for t in [PayeeType::Reserve, PayeeType::Voter, PayeeType::Donee] {
            assert_eq!(PayeeType::from_u8(t.as_u8()), Some(t));
        }
        assert_eq!(PayeeType::from_u8(9), None);
        assert_eq!(
            serde_json::to_string(&PayeeType::Donee).unwrap(),
            "\"donee\""
        );
    }
}
