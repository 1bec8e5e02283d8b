use crate::{batch_floor, update_batch_total, LedgerReader, LedgerStore, Result, StorageError};
use forgeshare_types::{Allocation, AllocationKey, ForgedBlock, MissedBlock, PayeeType};
use parking_lot::Mutex;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Batch, Db, Transactional, Tree};
use std::path::Path;
use tracing::{debug, info};

const FORGED_TREE: &str = "forged_blocks";
const MISSED_TREE: &str = "missed_blocks";
const ALLOCATIONS_TREE: &str = "allocations";

/// Sled-backed ledger.
///
/// Key layout, all big-endian so lexical order matches numeric order:
/// - `forged_blocks`: `height`
/// - `missed_blocks`: `timestamp | height`
/// - `allocations`: `height | payee_type | address`
///
/// Values are JSON encoded records.
pub struct SledLedgerStore {
    db: Db,
    forged: Tree,
    missed: Tree,
    allocations: Tree,
    writer: Mutex<()>,
}

fn height_key(height: u64) -> [u8; 8] {
    height.to_be_bytes()
}

fn missed_key(m: &MissedBlock) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&m.timestamp.to_be_bytes());
    key.extend_from_slice(&m.height.to_be_bytes());
    key
}

fn allocation_key(key: &AllocationKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + key.address.len());
    out.extend_from_slice(&key.height.to_be_bytes());
    out.push(key.payee_type.as_u8());
    out.extend_from_slice(key.address.as_bytes());
    out
}

fn key_height(key: &[u8], tree: &'static str) -> Result<u64> {
    let bytes: [u8; 8] = key
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or(StorageError::CorruptKey(tree))?;
    Ok(u64::from_be_bytes(bytes))
}

fn abort<E: Into<StorageError>>(e: E) -> ConflictableTransactionError<StorageError> {
    ConflictableTransactionError::Abort(e.into())
}

fn unwrap_tx(e: TransactionError<StorageError>) -> StorageError {
    match e {
        TransactionError::Abort(inner) => inner,
        TransactionError::Storage(inner) => StorageError::Database(inner),
    }
}

impl SledLedgerStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)?;
        let store = Self::from_db(db)?;
        info!(target: "ledger", height = store.height()?, "Ledger opened");
        Ok(store)
    }

    /// Temporary in-memory database, removed on drop.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self> {
        let forged = db.open_tree(FORGED_TREE)?;
        let missed = db.open_tree(MISSED_TREE)?;
        let allocations = db.open_tree(ALLOCATIONS_TREE)?;
        Ok(Self {
            db,
            forged,
            missed,
            allocations,
            writer: Mutex::new(()),
        })
    }

    /// Keys of forged blocks with `height >= h || timestamp >= t`.
    ///
    /// Heights and timestamps grow together, so walking backwards from the
    /// tip can stop at the first block matching neither bound.
    fn forged_keys_from(&self, height: u64, timestamp: u64) -> Result<Vec<sled::IVec>> {
        let mut keys = Vec::new();
        for item in self.forged.iter().rev() {
            let (key, value) = item?;
            let block: ForgedBlock = serde_json::from_slice(&value)?;
            if block.height < height && block.timestamp < timestamp {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }

    fn missed_keys_from(&self, height: u64, timestamp: u64) -> Result<Vec<sled::IVec>> {
        let mut keys = Vec::new();
        for item in self.missed.iter() {
            let (key, value) = item?;
            let m: MissedBlock = serde_json::from_slice(&value)?;
            if m.height >= height || m.timestamp >= timestamp {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    fn allocation_keys_from(&self, height: u64) -> Result<Vec<sled::IVec>> {
        self.allocations
            .range(height_key(height)..)
            .keys()
            .map(|k| k.map_err(StorageError::from))
            .collect()
    }

    /// Remove the given keys and insert the given entries in one transaction
    /// across all three trees.
    fn replace(
        &self,
        removals: [Vec<sled::IVec>; 3],
        inserts: [Vec<(Vec<u8>, Vec<u8>)>; 3],
    ) -> Result<()> {
        let [forged_rm, missed_rm, alloc_rm] = removals;
        let [forged_in, missed_in, alloc_in] = inserts;
        (&self.forged, &self.missed, &self.allocations)
            .transaction(|(tx_forged, tx_missed, tx_alloc)| {
                for key in &forged_rm {
                    tx_forged.remove(key)?;
                }
                for key in &missed_rm {
                    tx_missed.remove(key)?;
                }
                for key in &alloc_rm {
                    tx_alloc.remove(key)?;
                }
                for (key, value) in &forged_in {
                    tx_forged.insert(key.as_slice(), value.as_slice())?;
                }
                for (key, value) in &missed_in {
                    tx_missed.insert(key.as_slice(), value.as_slice())?;
                }
                for (key, value) in &alloc_in {
                    tx_alloc.insert(key.as_slice(), value.as_slice())?;
                }
                Ok(())
            })
            .map_err(|e: TransactionError<()>| match e {
                TransactionError::Abort(()) => StorageError::Aborted("replace".into()),
                TransactionError::Storage(inner) => StorageError::Database(inner),
            })
    }

    /// Apply `edit` to every allocation row matching `filter`, as one batch.
    fn rewrite_allocations(
        &self,
        filter: impl Fn(&Allocation) -> bool,
        edit: impl Fn(&mut Allocation),
    ) -> Result<usize> {
        let mut batch = Batch::default();
        let mut changed = 0;
        for item in self.allocations.iter() {
            let (key, value) = item?;
            let mut row: Allocation = serde_json::from_slice(&value)?;
            if filter(&row) {
                edit(&mut row);
                batch.insert(key, serde_json::to_vec(&row)?);
                changed += 1;
            }
        }
        self.allocations.apply_batch(batch)?;
        Ok(changed)
    }

    fn decode_all<T: serde::de::DeserializeOwned>(tree: &Tree) -> Result<Vec<T>> {
        tree.iter()
            .map(|item| {
                let (_, value) = item?;
                Ok(serde_json::from_slice(&value)?)
            })
            .collect()
    }
}

impl LedgerReader for SledLedgerStore {
    fn height(&self) -> Result<u64> {
        match self.forged.last()? {
            Some((key, _)) => key_height(&key, FORGED_TREE),
            None => Ok(0),
        }
    }

    fn forged_block(&self, height: u64) -> Result<Option<ForgedBlock>> {
        self.forged
            .get(height_key(height))?
            .map(|v| serde_json::from_slice(&v))
            .transpose()
            .map_err(Into::into)
    }

    fn forged_blocks(&self) -> Result<Vec<ForgedBlock>> {
        Self::decode_all(&self.forged)
    }

    fn missed_blocks(&self) -> Result<Vec<MissedBlock>> {
        Self::decode_all(&self.missed)
    }

    fn allocations_at(&self, height: u64) -> Result<Vec<Allocation>> {
        self.allocations
            .scan_prefix(height_key(height))
            .map(|item| {
                let (_, value) = item?;
                Ok(serde_json::from_slice(&value)?)
            })
            .collect()
    }

    fn allocations(&self) -> Result<Vec<Allocation>> {
        Self::decode_all(&self.allocations)
    }

    fn all_voters_last_allocation(&self) -> Result<Vec<Allocation>> {
        // Newest first: the first voter row seen per address is its latest.
        let mut seen = std::collections::HashSet::new();
        let mut rows = Vec::new();
        for item in self.allocations.iter().rev() {
            let (key, value) = item?;
            if key.get(8) != Some(&PayeeType::Voter.as_u8()) {
                continue;
            }
            let row: Allocation = serde_json::from_slice(&value)?;
            if seen.insert(row.address.clone()) {
                rows.push(row);
            }
        }
        rows.reverse();
        Ok(rows)
    }
}

impl LedgerStore for SledLedgerStore {
    fn insert(
        &self,
        blocks: &[ForgedBlock],
        missed: &[MissedBlock],
        allocations: &[Allocation],
    ) -> Result<()> {
        let Some((height, timestamp)) = batch_floor(blocks, missed, allocations) else {
            return Ok(());
        };
        let forged_in = blocks
            .iter()
            .map(|b| Ok((height_key(b.height).to_vec(), serde_json::to_vec(b)?)))
            .collect::<Result<Vec<_>>>()?;
        let missed_in = missed
            .iter()
            .map(|m| Ok((missed_key(m), serde_json::to_vec(m)?)))
            .collect::<Result<Vec<_>>>()?;
        let alloc_in = allocations
            .iter()
            .map(|a| Ok((allocation_key(&a.key()), serde_json::to_vec(a)?)))
            .collect::<Result<Vec<_>>>()?;

        let _guard = self.writer.lock();
        let removals = [
            self.forged_keys_from(height, timestamp)?,
            self.missed_keys_from(height, timestamp)?,
            self.allocation_keys_from(height)?,
        ];
        debug!(
            target: "ledger",
            height,
            timestamp,
            replaced = removals[0].len(),
            blocks = blocks.len(),
            allocations = allocations.len(),
            "Inserting ledger batch"
        );
        self.replace(removals, [forged_in, missed_in, alloc_in])
    }

    fn purge_from(&self, height: u64, timestamp: u64) -> Result<()> {
        let _guard = self.writer.lock();
        let removals = [
            self.forged_keys_from(height, timestamp)?,
            self.missed_keys_from(height, timestamp)?,
            self.allocation_keys_from(height)?,
        ];
        info!(
            target: "ledger",
            height,
            timestamp,
            blocks = removals[0].len(),
            "Purging ledger"
        );
        self.replace(removals, [Vec::new(), Vec::new(), Vec::new()])
    }

    fn rollback_to(&self, height: u64) -> Result<()> {
        let _guard = self.writer.lock();
        let forged_rm = self
            .forged
            .range(height_key(height)..)
            .keys()
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut missed_rm = Vec::new();
        for item in self.missed.iter() {
            let (key, value) = item?;
            let m: MissedBlock = serde_json::from_slice(&value)?;
            if m.height >= height {
                missed_rm.push(key);
            }
        }
        let alloc_rm = self.allocation_keys_from(height)?;
        info!(target: "ledger", height, blocks = forged_rm.len(), "Rolling back ledger");
        self.replace([forged_rm, missed_rm, alloc_rm], [Vec::new(), Vec::new(), Vec::new()])?;
        self.flush()
    }

    fn update_valid_vote(&self, allocations: &[Allocation]) -> Result<()> {
        let Some((height, total)) = update_batch_total(allocations)? else {
            return Ok(());
        };
        let _guard = self.writer.lock();
        (&self.forged, &self.allocations)
            .transaction(|(tx_forged, tx_alloc)| {
                for update in allocations {
                    let key = allocation_key(&update.key());
                    let Some(raw) = tx_alloc.get(&key)? else {
                        continue;
                    };
                    let mut row: Allocation = serde_json::from_slice(&raw).map_err(abort)?;
                    if row.is_paid() {
                        continue;
                    }
                    row.balance = update.balance;
                    row.vote_percent = update.vote_percent;
                    row.valid_vote = update.valid_vote;
                    row.allotment = update.allotment;
                    tx_alloc.insert(key, serde_json::to_vec(&row).map_err(abort)?)?;
                }
                let key = height_key(height);
                let raw = tx_forged
                    .get(key)?
                    .ok_or_else(|| abort(StorageError::BlockNotFound(height)))?;
                let mut block: ForgedBlock = serde_json::from_slice(&raw).map_err(abort)?;
                block.valid_votes = total;
                tx_forged.insert(key.to_vec(), serde_json::to_vec(&block).map_err(abort)?)?;
                Ok(())
            })
            .map_err(unwrap_tx)
    }

    fn record_missed(&self, missed: &MissedBlock) -> Result<()> {
        let _guard = self.writer.lock();
        self.missed
            .insert(missed_key(missed), serde_json::to_vec(missed)?)?;
        Ok(())
    }

    fn settle(&self, txid: &str, timestamp: i64) -> Result<usize> {
        let _guard = self.writer.lock();
        self.rewrite_allocations(
            |a| a.transaction_id == txid && a.settled == 0,
            |a| a.settled = timestamp,
        )
    }

    fn clear_transaction_id(&self, txid: &str) -> Result<usize> {
        let _guard = self.writer.lock();
        self.rewrite_allocations(
            |a| a.transaction_id == txid,
            |a| {
                a.transaction_id.clear();
                a.settled = 0;
            },
        )
    }

    fn set_transaction_id(&self, txid: &str, keys: &[AllocationKey]) -> Result<usize> {
        let _guard = self.writer.lock();
        let mut batch = Batch::default();
        let mut changed = 0;
        for key in keys {
            let raw_key = allocation_key(key);
            let Some(raw) = self.allocations.get(&raw_key)? else {
                continue;
            };
            let mut row: Allocation = serde_json::from_slice(&raw)?;
            row.transaction_id = txid.to_string();
            batch.insert(raw_key, serde_json::to_vec(&row)?);
            changed += 1;
        }
        self.allocations.apply_batch(batch)?;
        Ok(changed)
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
