//! Persistent reward ledger.
//!
//! Three record kinds are stored: forged blocks (one per height produced by
//! the monitored delegate), missed slots, and allocation rows (one per
//! height, payee type and address). Every mutation that touches more than one
//! record happens inside a single storage transaction, so a reprocessed height
//! is either fully replaced or left untouched.
//!
//! Reads are split from writes: [`LedgerReader`] is safe to hand to worker
//! threads, [`LedgerStore`] adds the single-writer mutation paths.

use forgeshare_types::{
    AddressScan, Allocation, AllocationKey, ForgedBlock, ForgingStats, LastPaidSummary,
    LedgerEntry, MissedBlock, NetworkParams, PayeeType, PendingSummary, VoterCommitment,
};
use serde::{Deserialize, Serialize};

pub mod memory;
pub mod sled_store;
pub mod views;

pub use memory::MemoryLedgerStore;
pub use sled_store::SledLedgerStore;

/// Storage errors
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Corrupt key in tree {0}")]
    CorruptKey(&'static str),
    #[error("Valid vote update spans heights {0} and {1}")]
    MixedHeights(u64, u64),
    #[error("Forged block {0} not found")]
    BlockNotFound(u64),
    #[error("Transaction aborted: {0}")]
    Aborted(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// An unpaid allocation with the unix time of its block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnpaidAllocation {
    pub allocation: Allocation,
    pub forged_unix: i64,
}

/// Read access to the ledger.
///
/// Implementors provide the primitive point and range reads; reports are
/// derived from them by the provided methods.
pub trait LedgerReader: Send + Sync {
    /// Highest stored forged block height, 0 when empty.
    fn height(&self) -> Result<u64>;
    fn forged_block(&self, height: u64) -> Result<Option<ForgedBlock>>;
    /// All forged blocks, ascending by height.
    fn forged_blocks(&self) -> Result<Vec<ForgedBlock>>;
    /// All missed slots, ascending by timestamp.
    fn missed_blocks(&self) -> Result<Vec<MissedBlock>>;
    /// Allocation rows at one height, ordered by payee type then address.
    fn allocations_at(&self, height: u64) -> Result<Vec<Allocation>>;
    /// All allocation rows, ascending by height.
    fn allocations(&self) -> Result<Vec<Allocation>>;

    fn last_forged(&self) -> Result<Option<ForgedBlock>> {
        match self.height()? {
            0 => Ok(None),
            h => self.forged_block(h),
        }
    }

    /// Voter rows at `height`, or at the highest allocated height.
    fn voter_allocations_at(&self, height: Option<u64>) -> Result<Vec<Allocation>> {
        let height = match height {
            Some(h) => h,
            None => match self.allocations()?.last() {
                Some(a) => a.height,
                None => return Ok(Vec::new()),
            },
        };
        Ok(self
            .allocations_at(height)?
            .into_iter()
            .filter(|a| a.payee_type == PayeeType::Voter)
            .collect())
    }

    /// Every voter's most recent allocation row, ascending by height.
    fn all_voters_last_allocation(&self) -> Result<Vec<Allocation>> {
        Ok(views::latest_per_address(self.allocations()?))
    }

    /// Distinct transaction ids submitted but not yet confirmed.
    fn unsettled_txids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .allocations()?
            .into_iter()
            .filter(|a| a.is_paid() && a.settled == 0)
            .map(|a| a.transaction_id)
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// Rows with a positive allotment and no payment, forged before `cutoff_unix`.
    fn unpaid_allocations(
        &self,
        cutoff_unix: i64,
        net: &NetworkParams,
    ) -> Result<Vec<UnpaidAllocation>> {
        let blocks = self.forged_blocks()?;
        Ok(views::unpaid(&blocks, self.allocations()?, cutoff_unix, net))
    }

    /// Ledger view at `height`, or at the highest forged height.
    fn ledger_at_height(
        &self,
        height: Option<u64>,
        net: &NetworkParams,
    ) -> Result<Vec<LedgerEntry>> {
        let height = match height {
            Some(h) => h,
            None => self.height()?,
        };
        let blocks: Vec<ForgedBlock> = self.forged_block(height)?.into_iter().collect();
        Ok(views::ledger_entries(&blocks, &self.allocations_at(height)?, net))
    }

    /// Ledger view over one round, or the highest forged round.
    fn ledger_at_round(&self, round: Option<u64>, net: &NetworkParams) -> Result<Vec<LedgerEntry>> {
        let blocks = self.forged_blocks()?;
        let round = match round.or_else(|| blocks.iter().map(|b| b.round).max()) {
            Some(r) => r,
            None => return Ok(Vec::new()),
        };
        let in_round: Vec<ForgedBlock> = blocks.into_iter().filter(|b| b.round == round).collect();
        let mut rows = Vec::new();
        for block in &in_round {
            rows.extend(self.allocations_at(block.height)?);
        }
        Ok(views::ledger_entries(&in_round, &rows, net))
    }

    fn last_paid_summary(&self) -> Result<Option<LastPaidSummary>> {
        Ok(views::last_paid(&self.forged_blocks()?, &self.allocations()?))
    }

    /// Totals for blocks forged after the last paid height.
    fn pending_summary(&self) -> Result<Option<PendingSummary>> {
        let blocks = self.forged_blocks()?;
        let allocations = self.allocations()?;
        Ok(views::pending(&blocks, &allocations))
    }

    /// Forging totals for blocks with unix time in `[start, end)`.
    fn forging_stats(&self, start: i64, end: i64, net: &NetworkParams) -> Result<ForgingStats> {
        let blocks = self.forged_blocks()?;
        Ok(views::forging_stats(&blocks, start, end, net))
    }

    fn voter_commitment(
        &self,
        start: i64,
        end: i64,
        net: &NetworkParams,
    ) -> Result<Vec<VoterCommitment>> {
        let blocks = self.forged_blocks()?;
        Ok(views::voter_commitment(&blocks, &self.allocations()?, start, end, net))
    }

    fn scan_addresses(
        &self,
        addresses: &[String],
        start: i64,
        end: i64,
        net: &NetworkParams,
    ) -> Result<Vec<AddressScan>> {
        let blocks = self.forged_blocks()?;
        Ok(views::scan_addresses(
            &blocks,
            &self.allocations()?,
            addresses,
            start,
            end,
            net,
        ))
    }

    /// Missed slots of `delegate` below `below_height` whose round has no
    /// forged block.
    fn missed_rounds(&self, delegate: &str, below_height: u64) -> Result<Vec<MissedBlock>> {
        let blocks = self.forged_blocks()?;
        Ok(views::missed_rounds(
            &blocks,
            self.missed_blocks()?,
            delegate,
            below_height,
        ))
    }
}

/// Mutating access to the ledger. Callers serialize through one writer.
pub trait LedgerStore: LedgerReader {
    /// Replace everything at or after the batch's lowest height/timestamp
    /// with the given rows, atomically.
    fn insert(
        &self,
        blocks: &[ForgedBlock],
        missed: &[MissedBlock],
        allocations: &[Allocation],
    ) -> Result<()>;

    /// Delete blocks and missed slots with `height >= height` or
    /// `timestamp >= timestamp`, and allocations with `height >= height`.
    fn purge_from(&self, height: u64, timestamp: u64) -> Result<()>;

    /// Delete every row with `height >= height`.
    fn rollback_to(&self, height: u64) -> Result<()>;

    /// Rewrite balance, vote percent, valid vote and allotment of unpaid
    /// voter rows at one height, and set the block's valid vote total to the
    /// sum of `allocations`.
    fn update_valid_vote(&self, allocations: &[Allocation]) -> Result<()>;

    /// Record a missed slot without touching other rows.
    fn record_missed(&self, missed: &MissedBlock) -> Result<()>;

    /// Stamp rows paid by `txid` as confirmed. Returns rows changed.
    fn settle(&self, txid: &str, timestamp: i64) -> Result<usize>;

    /// Return rows paid by `txid` to the unpaid pool. Returns rows changed.
    fn clear_transaction_id(&self, txid: &str) -> Result<usize>;

    /// Attach `txid` to the given rows. Returns rows changed.
    fn set_transaction_id(&self, txid: &str, keys: &[AllocationKey]) -> Result<usize>;

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Lowest (height, timestamp) of a batch, used as the replacement floor.
pub(crate) fn batch_floor(
    blocks: &[ForgedBlock],
    missed: &[MissedBlock],
    allocations: &[Allocation],
) -> Option<(u64, u64)> {
    if let Some(first) = blocks.iter().min_by_key(|b| b.height) {
        let ts = blocks.iter().map(|b| b.timestamp).min().unwrap_or(first.timestamp);
        return Some((first.height, ts));
    }
    let height = missed
        .iter()
        .map(|m| m.height)
        .chain(allocations.iter().map(|a| a.height))
        .min()?;
    let ts = missed.iter().map(|m| m.timestamp).min().unwrap_or(u64::MAX);
    Some((height, ts))
}

/// Sum of valid votes for an update batch, rejecting mixed heights.
pub(crate) fn update_batch_total(
    allocations: &[Allocation],
) -> Result<Option<(u64, forgeshare_types::Amount)>> {
    let Some(first) = allocations.first() else {
        return Ok(None);
    };
    if let Some(other) = allocations.iter().find(|a| a.height != first.height) {
        return Err(StorageError::MixedHeights(first.height, other.height));
    }
    Ok(Some((
        first.height,
        allocations.iter().map(|a| a.valid_vote).sum(),
    )))
}
