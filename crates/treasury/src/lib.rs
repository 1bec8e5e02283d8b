//! Reward-sharing core of the forgeshare ledger.
//!
//! Plan resolution, per-block reward allocation and anti-bot correction of
//! voter allotments. Everything here is synchronous; the sync crate drives
//! it from its event loop.

pub mod allocation;
pub mod antibot;
pub mod errors;
pub mod plan_book;

pub use allocation::{
    net_reward, valid_vote, voter_allotment, AllocationCalculator, BlockAllocation, VoterBalance,
};
pub use antibot::{is_eligible, AntiBotCorrector, CorrectionOutcome, Reduction};
pub use errors::{AllocationError, AntiBotError, PlanError};
pub use plan_book::{PlanBook, PlanWatch};
