//! Catch-up from the chain into the ledger.

use crate::errors::SyncError;
use crate::oracle::ChainOracle;
use crate::read_pool::ReadPool;
use chrono::Utc;
use forgeshare_storage::LedgerStore;
use forgeshare_treasury::{AllocationCalculator, PlanBook, VoterBalance};
use forgeshare_types::{Amount, ChainBlock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    Idle,
    /// Real-time sync after one of our blocks was applied.
    Syncing,
    /// Initial catch-up after boot.
    CatchingUp,
}

/// The monitored block producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegateIdentity {
    pub username: String,
    pub address: String,
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// A sync was already running.
    Coalesced,
    Completed {
        stored_height: u64,
        blocks: usize,
        initial_sync_finished: bool,
    },
}

pub struct SyncCoordinator {
    oracle: Arc<dyn ChainOracle>,
    store: Arc<dyn LedgerStore>,
    pool: Arc<ReadPool>,
    plans: Arc<PlanBook>,
    calculator: AllocationCalculator,
    delegate: DelegateIdentity,
    page_size: u64,
    /// Height of the first plan that hands out anything.
    allocating_from: Option<u64>,
    state: SyncState,
    last_fetched: u64,
    initial_sync: bool,
}

impl SyncCoordinator {
    pub fn new(
        oracle: Arc<dyn ChainOracle>,
        store: Arc<dyn LedgerStore>,
        pool: Arc<ReadPool>,
        plans: Arc<PlanBook>,
        calculator: AllocationCalculator,
        delegate: DelegateIdentity,
        page_size: u64,
    ) -> Self {
        let allocating_from = plans.first_allocating_plan().map(|p| p.height);
        Self {
            oracle,
            store,
            pool,
            plans,
            calculator,
            delegate,
            page_size: page_size.max(1),
            allocating_from,
            state: SyncState::Idle,
            last_fetched: 0,
            initial_sync: false,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn is_initial_sync(&self) -> bool {
        self.initial_sync
    }

    pub fn last_fetched(&self) -> u64 {
        self.last_fetched
    }

    pub fn delegate(&self) -> &DelegateIdentity {
        &self.delegate
    }

    async fn last_forged(&self) -> Result<(u64, u64), SyncError> {
        Ok(self
            .oracle
            .last_forged_block(&self.delegate.public_key)
            .await?
            .map(|b| (b.height, b.timestamp))
            .unwrap_or((0, 0)))
    }

    /// Drop ledger rows above our actual last forged block.
    async fn repair_fork(&mut self, last_height: u64, last_timestamp: u64) -> Result<(), SyncError> {
        if last_height > 0 && self.oracle.block_at(last_height).await?.is_none() {
            return Err(SyncError::RollbackTargetMissing(last_height));
        }
        let stored = self.store.height()?;
        self.store.purge_from(last_height + 1, last_timestamp + 1)?;
        self.last_fetched = self.store.height()?;
        warn!(
            target: "sync",
            stored,
            last_forged = last_height,
            "Ledger ahead of chain, purged rows above last forged block"
        );
        Ok(())
    }

    /// Reconcile the stored ledger with the chain at boot.
    ///
    /// Returns true when an initial catch-up sync is required.
    pub async fn reconcile(&mut self) -> Result<bool, SyncError> {
        let (last_height, last_timestamp) = self.last_forged().await?;
        self.last_fetched = self.store.height()?;
        if self.last_fetched > last_height {
            self.repair_fork(last_height, last_timestamp).await?;
        }
        let stored = self.store.height()?;
        self.initial_sync = stored != last_height;
        info!(
            target: "sync",
            stored,
            last_forged = last_height,
            catch_up = self.initial_sync,
            "Ledger reconciled"
        );
        Ok(self.initial_sync)
    }

    /// Forget rows of a reverted block of ours.
    pub fn purge_reverted(&mut self, height: u64, timestamp: u64) -> Result<(), SyncError> {
        self.store.purge_from(height, timestamp)?;
        self.last_fetched = self.store.height()?;
        info!(target: "sync", height, "Purged ledger from reverted block");
        Ok(())
    }

    /// Process every block of ours the ledger has not seen yet.
    pub async fn sync(&mut self) -> Result<SyncOutcome, SyncError> {
        if self.state != SyncState::Idle {
            debug!(target: "sync", state = ?self.state, "Sync in progress, skipping");
            return Ok(SyncOutcome::Coalesced);
        }
        self.state = if self.initial_sync {
            SyncState::CatchingUp
        } else {
            SyncState::Syncing
        };
        let result = self.sync_pages().await;
        self.state = SyncState::Idle;
        result
    }

    async fn sync_pages(&mut self) -> Result<SyncOutcome, SyncError> {
        let mut blocks = 0;
        let mut initial_sync_finished = false;
        loop {
            let stored = self.store.height()?;
            let chain_height = self.oracle.latest_height().await?;
            let (last_height, last_timestamp) = self.last_forged().await?;

            if stored > last_height {
                self.repair_fork(last_height, last_timestamp).await?;
                continue;
            }

            if stored < last_height && self.last_fetched < chain_height {
                let page = self
                    .oracle
                    .blocks_from(self.last_fetched + 1, self.page_size)
                    .await?;
                let Some(tip) = page.last().map(|b| b.height) else {
                    debug!(target: "sync", chain_height, last_forged = last_height, stored, "Sync complete");
                    break;
                };
                let ours: Vec<ChainBlock> = page
                    .into_iter()
                    .filter(|b| b.generator_public_key == self.delegate.public_key)
                    .collect();
                if !ours.is_empty() {
                    blocks += self.process_blocks(&ours).await?;
                }
                // advance only past pages that were stored
                self.last_fetched = tip;
            } else {
                debug!(target: "sync", chain_height, last_forged = last_height, stored, "Sync complete");
                if self.initial_sync && stored == last_height {
                    self.initial_sync = false;
                    initial_sync_finished = true;
                    info!(target: "sync", height = stored, "Initial sync completed");
                }
                break;
            }
        }
        Ok(SyncOutcome::Completed {
            stored_height: self.store.height()?,
            blocks,
            initial_sync_finished,
        })
    }

    /// Allocate and store one page of our blocks in a single ledger write.
    async fn process_blocks(&self, blocks: &[ChainBlock]) -> Result<usize, SyncError> {
        let known: HashMap<String, (Amount, u64)> = self
            .pool
            .voters_last_allocation()
            .await?
            .into_iter()
            .map(|a| (a.address, (a.org_balance, a.height)))
            .collect();
        let net = self.plans.network();
        let booked = Utc::now().timestamp();

        let mut forged = Vec::with_capacity(blocks.len());
        let mut rows = Vec::new();
        for block in blocks {
            let round = net.round_of(block.height).round;
            if !self.allocating_from.map_or(false, |from| block.height >= from) {
                debug!(target: "sync", round, height = block.height, "Recorded block before first allocating plan");
                forged.push(self.calculator.bare_block(block, &self.delegate.username, round));
                continue;
            }
            let plan = self.plans.resolve(block.height, block.timestamp);
            let roll = self
                .oracle
                .voter_roll(block.height, &self.delegate.username, &self.delegate.public_key)
                .await?;

            let mut voters = Vec::with_capacity(roll.len());
            for record in roll {
                let (previous, since) = known
                    .get(&record.address)
                    .filter(|(_, height)| *height < block.height)
                    .copied()
                    .unwrap_or((Amount::ZERO, 0));
                let delta = self
                    .oracle
                    .net_balance_delta(since, block.height, &record.address, &record.public_key)
                    .await?;
                voters.push(VoterBalance {
                    address: record.address,
                    balance: previous.offset_floor(delta),
                    vote_percent: record.percent,
                });
            }

            let allocated = self.calculator.allocate(
                block,
                &self.delegate.username,
                round,
                &voters,
                &plan,
                booked,
            )?;
            debug!(
                target: "sync",
                round,
                height = block.height,
                reward = %block.reward,
                voters = voters.len(),
                valid_votes = %allocated.block.valid_votes,
                "Processed block"
            );
            forged.push(allocated.block);
            rows.extend(allocated.allocations);
        }

        self.store.insert(&forged, &[], &rows)?;
        if let (Some(first), Some(last)) = (forged.first(), forged.last()) {
            info!(
                target: "sync",
                from = first.height,
                to = last.height,
                blocks = forged.len(),
                "Stored forged blocks"
            );
        }
        Ok(forged.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::OracleError;
    use crate::mock::MockChain;
    use crate::oracle::{TxConfirmation, VoterRecord, Wallet};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use forgeshare_storage::{LedgerReader, MemoryLedgerStore};
    use forgeshare_types::{FeePolicy, NetworkParams, Payee, PayeeType, PlanDecl};

    const PK: &str = "pk-bp";

    fn plans() -> Arc<PlanBook> {
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

    fn coordinator(chain: &MockChain, store: &MemoryLedgerStore, page: u64) -> SyncCoordinator {
        coordinator_with(Arc::new(chain.clone()), store, page, plans())
    }

    fn coordinator_with(
        oracle: Arc<dyn ChainOracle>,
        store: &MemoryLedgerStore,
        page: u64,
        plans: Arc<PlanBook>,
    ) -> SyncCoordinator {
        let store = Arc::new(store.clone());
        let pool = Arc::new(ReadPool::new(store.clone(), 1, 1).unwrap());
        SyncCoordinator::new(
            oracle,
            store,
            pool,
            plans,
            AllocationCalculator::new(FeePolicy::default()),
            DelegateIdentity {
                username: "bp".into(),
                address: "addr-bp".into(),
                public_key: PK.into(),
            },
            page,
        )
    }

    /// Fails the first `failures` voter roll lookups.
    struct FlakyRolls {
        chain: MockChain,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl ChainOracle for FlakyRolls {
        async fn latest_height(&self) -> Result<u64, OracleError> {
            self.chain.latest_height().await
        }

        async fn block_at(&self, height: u64) -> Result<Option<ChainBlock>, OracleError> {
            self.chain.block_at(height).await
        }

        async fn last_forged_block(
            &self,
            generator_public_key: &str,
        ) -> Result<Option<ChainBlock>, OracleError> {
            self.chain.last_forged_block(generator_public_key).await
        }

        async fn blocks_from(&self, start: u64, limit: u64) -> Result<Vec<ChainBlock>, OracleError> {
            self.chain.blocks_from(start, limit).await
        }

        async fn voter_roll(
            &self,
            height: u64,
            delegate: &str,
            delegate_public_key: &str,
        ) -> Result<Vec<VoterRecord>, OracleError> {
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(OracleError::Unavailable("voter roll timed out".into()));
            }
            self.chain.voter_roll(height, delegate, delegate_public_key).await
        }

        async fn net_balance_delta(
            &self,
            since: u64,
            until: u64,
            address: &str,
            public_key: &str,
        ) -> Result<i128, OracleError> {
            self.chain
                .net_balance_delta(since, until, address, public_key)
                .await
        }

        async fn wallet_by_username(&self, username: &str) -> Result<Option<Wallet>, OracleError> {
            self.chain.wallet_by_username(username).await
        }

        async fn wallet_by_public_key(
            &self,
            public_key: &str,
        ) -> Result<Option<Wallet>, OracleError> {
            self.chain.wallet_by_public_key(public_key).await
        }

        async fn transaction_confirmation(
            &self,
            txid: &str,
        ) -> Result<Option<TxConfirmation>, OracleError> {
            self.chain.transaction_confirmation(txid).await
        }
    }

    fn chain() -> MockChain {
        let chain = MockChain::new();
        chain.forge_range(1, 30, "other", Amount(100_000_000));
        for h in [5, 12, 25] {
            chain.forge(h, PK, Amount(100_000_000));
        }
        chain.set_voters(
            1,
            vec![VoterRecord {
                address: "alice".into(),
                public_key: "pk-alice".into(),
                percent: 100.0,
            }],
        );
        chain.credit("alice", 3, 1_000);
        chain.credit("alice", 10, -400);
        chain
    }

    #[tokio::test]
    async fn catches_up_across_pages() {
        let chain = chain();
        let store = MemoryLedgerStore::new();
        let mut sync = coordinator(&chain, &store, 7);
        assert!(sync.reconcile().await.unwrap());
        assert_eq!(sync.state(), SyncState::Idle);

        let outcome = sync.sync().await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Completed {
                stored_height: 25,
                blocks: 3,
                initial_sync_finished: true,
            }
        );
        assert!(!sync.is_initial_sync());

        let balances: Vec<Amount> = [5, 12, 25]
            .iter()
            .map(|h| {
                store
                    .voter_allocations_at(Some(*h))
                    .unwrap()
                    .remove(0)
                    .balance
            })
            .collect();
        assert_eq!(balances, vec![Amount(1_000), Amount(600), Amount(600)]);
        let reserve = store
            .allocations_at(5)
            .unwrap()
            .into_iter()
            .find(|a| a.payee_type == PayeeType::Reserve)
            .unwrap();
        assert_eq!(reserve.allotment, Amount(50_000_000));
    }

    #[tokio::test]
    async fn blocks_before_first_allocating_plan_skip_voters() {
        let late = PlanDecl {
            height: Some(10),
            share: Some(50.0),
            reserves: Some(vec![Payee {
                address: "reserve".into(),
                share: 50.0,
            }]),
            ..Default::default()
        };
        let plans = Arc::new(PlanBook::new(vec![late], NetworkParams::default()).unwrap());
        let chain = chain();
        let store = MemoryLedgerStore::new();
        let mut sync = coordinator_with(Arc::new(chain.clone()), &store, 100, plans);
        sync.reconcile().await.unwrap();
        let outcome = sync.sync().await.unwrap();
        assert!(matches!(
            outcome,
            SyncOutcome::Completed {
                stored_height: 25,
                blocks: 3,
                initial_sync_finished: true,
            }
        ));

        let early = store.forged_block(5).unwrap().unwrap();
        assert_eq!(early.voter_count, 0);
        assert!(store.allocations_at(5).unwrap().is_empty());
        assert_eq!(early.valid_votes, Amount::ZERO);
        // no earlier row, so the balance is rebuilt from the full history
        let alice = store.voter_allocations_at(Some(12)).unwrap().remove(0);
        assert_eq!(alice.balance, Amount(600));
    }

    #[tokio::test]
    async fn page_that_failed_midway_is_fetched_again() {
        let chain = chain();
        let oracle = Arc::new(FlakyRolls {
            chain: chain.clone(),
            failures: AtomicUsize::new(1),
        });
        let store = MemoryLedgerStore::new();
        let mut sync = coordinator_with(oracle, &store, 100, plans());
        assert!(sync.reconcile().await.unwrap());

        assert!(matches!(sync.sync().await, Err(SyncError::Oracle(_))));
        assert_eq!(store.height().unwrap(), 0);
        assert_eq!(sync.last_fetched(), 0);
        assert!(sync.is_initial_sync());

        let outcome = sync.sync().await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Completed {
                stored_height: 25,
                blocks: 3,
                initial_sync_finished: true,
            }
        );
        assert!(!sync.is_initial_sync());
        assert_eq!(store.forged_blocks().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn reconcile_purges_rows_above_last_forged() {
        let chain = chain();
        let store = MemoryLedgerStore::new();
        let mut sync = coordinator(&chain, &store, 100);
        sync.reconcile().await.unwrap();
        sync.sync().await.unwrap();

        chain.revert_from(25);
        chain.forge(25, "other", Amount(100_000_000));
        let mut rebooted = coordinator(&chain, &store, 100);
        assert!(!rebooted.reconcile().await.unwrap());
        assert_eq!(store.height().unwrap(), 12);
        assert_eq!(rebooted.last_fetched(), 12);
    }

    #[tokio::test]
    async fn nothing_to_do_when_up_to_date() {
        let chain = chain();
        let store = MemoryLedgerStore::new();
        let mut sync = coordinator(&chain, &store, 100);
        sync.reconcile().await.unwrap();
        sync.sync().await.unwrap();
        let again = sync.sync().await.unwrap();
        assert_eq!(
            again,
            SyncOutcome::Completed {
                stored_height: 25,
                blocks: 0,
                initial_sync_finished: false,
            }
        );
    }

    #[tokio::test]
    async fn oracle_failure_leaves_coordinator_idle() {
        let chain = chain();
        let store = MemoryLedgerStore::new();
        let mut sync = coordinator(&chain, &store, 100);
        sync.reconcile().await.unwrap();
        chain.set_offline(true);
        assert!(matches!(sync.sync().await, Err(SyncError::Oracle(_))));
        assert_eq!(sync.state(), SyncState::Idle);
        assert!(sync.is_initial_sync());
    }
}
