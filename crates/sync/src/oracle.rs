//! Read-only view of the host chain.

use crate::errors::OracleError;
use async_trait::async_trait;
use forgeshare_types::ChainBlock;
use serde::{Deserialize, Serialize};

/// One voter of a delegate at a given height.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoterRecord {
    pub address: String,
    pub public_key: String,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub address: String,
    pub public_key: String,
    pub username: Option<String>,
}

/// Where and when a transaction was forged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxConfirmation {
    pub block_height: u64,
    /// Chain epochstamp of the containing block.
    pub timestamp: u64,
}

#[async_trait]
pub trait ChainOracle: Send + Sync {
    /// Height of the highest indexed block.
    async fn latest_height(&self) -> Result<u64, OracleError>;

    async fn block_at(&self, height: u64) -> Result<Option<ChainBlock>, OracleError>;

    async fn last_forged_block(
        &self,
        generator_public_key: &str,
    ) -> Result<Option<ChainBlock>, OracleError>;

    /// Up to `limit` blocks starting at `start`, ascending.
    async fn blocks_from(&self, start: u64, limit: u64) -> Result<Vec<ChainBlock>, OracleError>;

    /// Voters of the delegate owning `delegate_public_key` as of `height`.
    async fn voter_roll(
        &self,
        height: u64,
        delegate: &str,
        delegate_public_key: &str,
    ) -> Result<Vec<VoterRecord>, OracleError>;

    /// Inbound minus outbound transfers and fees for `address` over
    /// heights `(since, until]`.
    async fn net_balance_delta(
        &self,
        since: u64,
        until: u64,
        address: &str,
        public_key: &str,
    ) -> Result<i128, OracleError>;

    async fn wallet_by_username(&self, username: &str) -> Result<Option<Wallet>, OracleError>;

    async fn wallet_by_public_key(&self, public_key: &str)
        -> Result<Option<Wallet>, OracleError>;

    async fn transaction_confirmation(
        &self,
        txid: &str,
    ) -> Result<Option<TxConfirmation>, OracleError>;
}
