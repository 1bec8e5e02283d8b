use serde::{Deserialize, Serialize};

/// Unix time of the reference chain's genesis epoch (2022-03-28T18:00:00Z).
pub const DEFAULT_GENESIS_UNIX: i64 = 1_648_490_400;

/// Number of block producers forging in one round.
pub const DEFAULT_ROUND_SIZE: u64 = 53;

/// Static chain parameters needed to interpret heights and timestamps.
///
/// Block timestamps are epoch stamps: seconds since the chain's genesis
/// epoch. Heights start at 1 and rounds are fixed-size groups of consecutive
/// heights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkParams {
    pub genesis_unix: i64,
    pub round_size: u64,
    pub atomic_decimals: u32,
}

impl Default for NetworkParams {
    fn default() -> Self {
        Self {
            genesis_unix: DEFAULT_GENESIS_UNIX,
            round_size: DEFAULT_ROUND_SIZE,
            atomic_decimals: crate::amount::ATOMIC_DECIMALS,
        }
    }
}

/// Round number and first height of that round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundInfo {
    pub round: u64,
    pub round_height: u64,
}

impl NetworkParams {
    pub fn round_of(&self, height: u64) -> RoundInfo {
        let size = self.round_size.max(1);
        if height == 0 {
            return RoundInfo {
                round: 0,
                round_height: 0,
            };
        }
        let round = (height - 1) / size + 1;
        RoundInfo {
            round,
            round_height: (round - 1) * size + 1,
        }
    }

    /// Convert a chain epoch stamp into unix seconds.
    pub fn unix_time(&self, epochstamp: u64) -> i64 {
        self.genesis_unix.saturating_add(epochstamp as i64)
    }

    /// Convert unix seconds into a chain epoch stamp, clamped at genesis.
    pub fn epochstamp(&self, unix: i64) -> u64 {
        unix.saturating_sub(self.genesis_unix).max(0) as u64
    }
}
