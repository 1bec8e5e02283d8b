use serde::{Deserialize, Serialize};

/// Earned-fee handling for the allocation formulas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeePolicy {
    /// Earned fees join the net reward shared by every payee class.
    pub share_earned_fees: bool,
    /// When fees are not shared, the first reserve receives them.
    pub reserve_gets_fees: bool,
}

/// Runtime settings of the ledger engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Username of the monitored block producer.
    pub delegate: String,
    pub share_earned_fees: bool,
    pub reserve_gets_fees: bool,
    /// Consumed by the payment collaborator only.
    pub reserve_pays_fees: bool,
    pub post_init_instant_pay: bool,
    pub antibot: bool,
    pub whitelist: Vec<String>,
    /// Rounds after the last forged block during which anti-bot reacts.
    pub antibot_round_window: u64,
    /// Blocks fetched per sync page.
    pub sync_page_size: u64,
    pub index_poll_interval_ms: u64,
    pub index_poll_attempts: u32,
    pub read_workers: usize,
    pub read_retries: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            delegate: String::new(),
            share_earned_fees: false,
            reserve_gets_fees: false,
            reserve_pays_fees: true,
            post_init_instant_pay: false,
            antibot: true,
            whitelist: Vec::new(),
            antibot_round_window: 1,
            sync_page_size: 10_000,
            index_poll_interval_ms: 100,
            index_poll_attempts: 100,
            read_workers: 4,
            read_retries: 2,
        }
    }
}

impl EngineSettings {
    pub fn fee_policy(&self) -> FeePolicy {
        FeePolicy {
            share_earned_fees: self.share_earned_fees,
            reserve_gets_fees: self.reserve_gets_fees,
        }
    }
}
