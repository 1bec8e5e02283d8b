use crate::{batch_floor, update_batch_total, LedgerReader, LedgerStore, Result, StorageError};
use forgeshare_types::{Allocation, AllocationKey, ForgedBlock, MissedBlock};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Default)]
struct Tables {
    forged: BTreeMap<u64, ForgedBlock>,
    /// Keyed like the sled tree: (timestamp, height).
    missed: BTreeMap<(u64, u64), MissedBlock>,
    allocations: BTreeMap<AllocationKey, Allocation>,
}

impl Tables {
    fn purge(&mut self, height: u64, timestamp: u64) {
        self.forged
            .retain(|_, b| b.height < height && b.timestamp < timestamp);
        self.missed
            .retain(|_, m| m.height < height && m.timestamp < timestamp);
        self.allocations.retain(|k, _| k.height < height);
    }
}

/// In-memory ledger with the same contract as the sled store.
///
/// Each mutation takes the write lock once, so readers never observe a
/// half-applied batch.
#[derive(Default, Clone)]
pub struct MemoryLedgerStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerReader for MemoryLedgerStore {
    fn height(&self) -> Result<u64> {
        Ok(self
            .tables
            .read()
            .forged
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0))
    }

    fn forged_block(&self, height: u64) -> Result<Option<ForgedBlock>> {
        Ok(self.tables.read().forged.get(&height).cloned())
    }

    fn forged_blocks(&self) -> Result<Vec<ForgedBlock>> {
        Ok(self.tables.read().forged.values().cloned().collect())
    }

    fn missed_blocks(&self) -> Result<Vec<MissedBlock>> {
        Ok(self.tables.read().missed.values().cloned().collect())
    }

    fn allocations_at(&self, height: u64) -> Result<Vec<Allocation>> {
        Ok(self
            .tables
            .read()
            .allocations
            .values()
            .filter(|a| a.height == height)
            .cloned()
            .collect())
    }

    fn allocations(&self) -> Result<Vec<Allocation>> {
        Ok(self.tables.read().allocations.values().cloned().collect())
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn insert(
        &self,
        blocks: &[ForgedBlock],
        missed: &[MissedBlock],
        allocations: &[Allocation],
    ) -> Result<()> {
        let Some((height, timestamp)) = batch_floor(blocks, missed, allocations) else {
            return Ok(());
        };
        let mut tables = self.tables.write();
        tables.purge(height, timestamp);
        for b in blocks {
            tables.forged.insert(b.height, b.clone());
        }
        for m in missed {
            tables.missed.insert((m.timestamp, m.height), m.clone());
        }
        for a in allocations {
            tables.allocations.insert(a.key(), a.clone());
        }
        Ok(())
    }

    fn purge_from(&self, height: u64, timestamp: u64) -> Result<()> {
        self.tables.write().purge(height, timestamp);
        Ok(())
    }

    fn rollback_to(&self, height: u64) -> Result<()> {
        self.tables.write().purge(height, u64::MAX);
        Ok(())
    }

    fn update_valid_vote(&self, allocations: &[Allocation]) -> Result<()> {
        let Some((height, total)) = update_batch_total(allocations)? else {
            return Ok(());
        };
        let mut tables = self.tables.write();
        if !tables.forged.contains_key(&height) {
            return Err(StorageError::BlockNotFound(height));
        }
        for update in allocations {
            if let Some(row) = tables.allocations.get_mut(&update.key()) {
                if row.is_paid() {
                    continue;
                }
                row.balance = update.balance;
                row.vote_percent = update.vote_percent;
                row.valid_vote = update.valid_vote;
                row.allotment = update.allotment;
            }
        }
        if let Some(block) = tables.forged.get_mut(&height) {
            block.valid_votes = total;
        }
        Ok(())
    }

    fn record_missed(&self, missed: &MissedBlock) -> Result<()> {
        self.tables
            .write()
            .missed
            .insert((missed.timestamp, missed.height), missed.clone());
        Ok(())
    }

    fn settle(&self, txid: &str, timestamp: i64) -> Result<usize> {
        let mut tables = self.tables.write();
        let mut changed = 0;
        for row in tables
            .allocations
            .values_mut()
            .filter(|a| a.transaction_id == txid && a.settled == 0)
        {
            row.settled = timestamp;
            changed += 1;
        }
        Ok(changed)
    }

    fn clear_transaction_id(&self, txid: &str) -> Result<usize> {
        let mut tables = self.tables.write();
        let mut changed = 0;
        for row in tables
            .allocations
            .values_mut()
            .filter(|a| a.transaction_id == txid)
        {
            row.transaction_id.clear();
            row.settled = 0;
            changed += 1;
        }
        Ok(changed)
    }

    fn set_transaction_id(&self, txid: &str, keys: &[AllocationKey]) -> Result<usize> {
        let mut tables = self.tables.write();
        let mut changed = 0;
        for key in keys {
            if let Some(row) = tables.allocations.get_mut(key) {
                row.transaction_id = txid.to_string();
                changed += 1;
            }
        }
        Ok(changed)
    }
}
