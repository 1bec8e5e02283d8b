//! In-memory chain for tests and dry runs.

use crate::errors::OracleError;
use crate::oracle::{ChainOracle, TxConfirmation, VoterRecord, Wallet};
use async_trait::async_trait;
use forgeshare_types::{Amount, ChainBlock};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Seconds between mock blocks.
pub const MOCK_BLOCK_TIME: u64 = 8;

#[derive(Default)]
struct ChainState {
    blocks: BTreeMap<u64, ChainBlock>,
    /// Voter sets keyed by the height they take effect.
    voters: BTreeMap<u64, Vec<VoterRecord>>,
    deltas: HashMap<String, Vec<(u64, i128)>>,
    wallets: Vec<Wallet>,
    txs: HashMap<String, TxConfirmation>,
    offline: bool,
}

#[derive(Default, Clone)]
pub struct MockChain {
    state: Arc<RwLock<ChainState>>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_wallet(&self, address: &str, public_key: &str, username: Option<&str>) {
        self.state.write().wallets.push(Wallet {
            address: address.to_string(),
            public_key: public_key.to_string(),
            username: username.map(str::to_string),
        });
    }

    pub fn push_block(&self, block: ChainBlock) {
        self.state.write().blocks.insert(block.height, block);
    }

    /// Append a block at `height` with a default fee split.
    pub fn forge(&self, height: u64, generator_public_key: &str, reward: Amount) -> ChainBlock {
        let block = ChainBlock {
            id: format!("block-{height}"),
            height,
            timestamp: height * MOCK_BLOCK_TIME,
            generator_public_key: generator_public_key.to_string(),
            reward,
            fund_deduction: Amount::ZERO,
            total_fee: Amount::ZERO,
            burned_fee: Amount::ZERO,
        };
        self.push_block(block.clone());
        block
    }

    /// Fill `[from, to]` with blocks by `generator_public_key`.
    pub fn forge_range(&self, from: u64, to: u64, generator_public_key: &str, reward: Amount) {
        for height in from..=to {
            self.forge(height, generator_public_key, reward);
        }
    }

    /// Drop every block at or above `height`.
    pub fn revert_from(&self, height: u64) {
        let mut state = self.state.write();
        state.blocks.retain(|h, _| *h < height);
    }

    pub fn set_voters(&self, from_height: u64, voters: Vec<VoterRecord>) {
        self.state.write().voters.insert(from_height, voters);
    }

    /// Record a balance change for `address` at `height`.
    pub fn credit(&self, address: &str, height: u64, delta: i128) {
        self.state
            .write()
            .deltas
            .entry(address.to_string())
            .or_default()
            .push((height, delta));
    }

    pub fn confirm_tx(&self, txid: &str, block_height: u64) {
        let mut state = self.state.write();
        let timestamp = state
            .blocks
            .get(&block_height)
            .map(|b| b.timestamp)
            .unwrap_or(block_height * MOCK_BLOCK_TIME);
        state.txs.insert(
            txid.to_string(),
            TxConfirmation {
                block_height,
                timestamp,
            },
        );
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.write().offline = offline;
    }

    fn online(&self) -> Result<(), OracleError> {
        if self.state.read().offline {
            return Err(OracleError::Unavailable("mock chain offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainOracle for MockChain {
    async fn latest_height(&self) -> Result<u64, OracleError> {
        self.online()?;
        Ok(self.state.read().blocks.keys().next_back().copied().unwrap_or(0))
    }

    async fn block_at(&self, height: u64) -> Result<Option<ChainBlock>, OracleError> {
        self.online()?;
        Ok(self.state.read().blocks.get(&height).cloned())
    }

    async fn last_forged_block(
        &self,
        generator_public_key: &str,
    ) -> Result<Option<ChainBlock>, OracleError> {
        self.online()?;
        Ok(self
            .state
            .read()
            .blocks
            .values()
            .rev()
            .find(|b| b.generator_public_key == generator_public_key)
            .cloned())
    }

    async fn blocks_from(&self, start: u64, limit: u64) -> Result<Vec<ChainBlock>, OracleError> {
        self.online()?;
        Ok(self
            .state
            .read()
            .blocks
            .range(start..)
            .take(limit as usize)
            .map(|(_, b)| b.clone())
            .collect())
    }

    async fn voter_roll(
        &self,
        height: u64,
        _delegate: &str,
        _delegate_public_key: &str,
    ) -> Result<Vec<VoterRecord>, OracleError> {
        self.online()?;
        Ok(self
            .state
            .read()
            .voters
            .range(..=height)
            .next_back()
            .map(|(_, v)| v.clone())
            .unwrap_or_default())
    }

    async fn net_balance_delta(
        &self,
        since: u64,
        until: u64,
        address: &str,
        _public_key: &str,
    ) -> Result<i128, OracleError> {
        self.online()?;
        Ok(self
            .state
            .read()
            .deltas
            .get(address)
            .map(|d| {
                d.iter()
                    .filter(|(h, _)| *h > since && *h <= until)
                    .map(|(_, delta)| delta)
                    .sum::<i128>()
            })
            .unwrap_or(0))
    }

    async fn wallet_by_username(&self, username: &str) -> Result<Option<Wallet>, OracleError> {
        self.online()?;
        Ok(self
            .state
            .read()
            .wallets
            .iter()
            .find(|w| w.username.as_deref() == Some(username))
            .cloned())
    }

    async fn wallet_by_public_key(
        &self,
        public_key: &str,
    ) -> Result<Option<Wallet>, OracleError> {
        self.online()?;
        Ok(self
            .state
            .read()
            .wallets
            .iter()
            .find(|w| w.public_key == public_key)
            .cloned())
    }

    async fn transaction_confirmation(
        &self,
        txid: &str,
    ) -> Result<Option<TxConfirmation>, OracleError> {
        self.online()?;
        Ok(self.state.read().txs.get(txid).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn balance_delta_is_half_open() {
        let chain = MockChain::new();
        chain.credit("alice", 5, 100);
        chain.credit("alice", 10, -30);
        assert_eq!(chain.net_balance_delta(0, 10, "alice", "").await.unwrap(), 70);
        assert_eq!(chain.net_balance_delta(5, 10, "alice", "").await.unwrap(), -30);
        assert_eq!(chain.net_balance_delta(10, 20, "alice", "").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn voter_roll_uses_latest_set() {
        let chain = MockChain::new();
        let voter = |a: &str| VoterRecord {
            address: a.into(),
            public_key: format!("pk-{a}"),
            percent: 100.0,
        };
        chain.set_voters(1, vec![voter("alice")]);
        chain.set_voters(10, vec![voter("alice"), voter("bob")]);
        assert_eq!(chain.voter_roll(9, "bp", "pk").await.unwrap().len(), 1);
        assert_eq!(chain.voter_roll(10, "bp", "pk").await.unwrap().len(), 2);
        assert!(chain.voter_roll(0, "bp", "pk").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn last_forged_and_offline() {
        let chain = MockChain::new();
        chain.forge(1, "other", Amount(1));
        chain.forge(2, "pk", Amount(1));
        chain.forge(3, "other", Amount(1));
        let last = chain.last_forged_block("pk").await.unwrap().unwrap();
        assert_eq!(last.height, 2);
        assert_eq!(chain.latest_height().await.unwrap(), 3);

        chain.set_offline(true);
        assert!(chain.latest_height().await.is_err());
    }
}
