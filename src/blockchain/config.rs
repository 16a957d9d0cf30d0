use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::crypto::Address;

/// Errors raised when a configuration bundle is internally inconsistent
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid difficulty bounds: min {min}, initial {initial}, max {max}")]
    DifficultyBounds { min: u32, initial: u32, max: u32 },

    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

/// A SHA-256 digest rendered as hex has this many nibbles
pub const MAX_HEX_NIBBLES: u32 = 64;

/// What happens to the fee of an accepted transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeePolicy {
    /// Fees leave circulation
    Burn,

    /// Fees are credited to the miner of the including block
    Miner,
}

/// Parameters consumed by the chain, the difficulty controller and the miner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Difficulty of the genesis block and the first adjustment window
    pub initial_difficulty: u32,

    /// Lower bound for retargeting
    pub min_difficulty: u32,

    /// Upper bound for retargeting
    pub max_difficulty: u32,

    /// Target seconds between blocks
    pub target_block_time: u64,

    /// Number of blocks per difficulty window
    pub adjustment_interval: u64,

    /// Reward minted at height 0
    pub initial_reward: u64,

    /// Floor applied after halvings
    pub minimum_reward: u64,

    /// Blocks between reward halvings
    pub halving_interval: u64,

    /// Parallel nonce search workers
    pub worker_count: usize,

    /// Address credited by the coinbase unless the miner supplies its own
    pub treasury_address: Address,

    /// Exclusive upper bound of the nonce space
    pub max_nonce: u64,

    /// Seconds a template is searched before it is rebuilt
    pub retemplate_interval_secs: u64,

    /// Fee routing for accepted transactions
    pub fee_policy: FeePolicy,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig {
            initial_difficulty: 4,
            min_difficulty: 1,
            max_difficulty: MAX_HEX_NIBBLES,
            target_block_time: 10,
            adjustment_interval: 2016,
            initial_reward: 5_000_000_000,
            minimum_reward: 0,
            halving_interval: 210_000,
            worker_count: num_cpus::get().max(1),
            treasury_address: Address("treasury".to_string()),
            max_nonce: u64::MAX,
            retemplate_interval_secs: 30,
            fee_policy: FeePolicy::Burn,
        }
    }
}

impl ChainConfig {
    /// Checks that the bundle can drive a chain
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_difficulty == 0
            || self.min_difficulty > self.initial_difficulty
            || self.initial_difficulty > self.max_difficulty
            || self.max_difficulty > MAX_HEX_NIBBLES
        {
            return Err(ConfigError::DifficultyBounds {
                min: self.min_difficulty,
                initial: self.initial_difficulty,
                max: self.max_difficulty,
            });
        }

        if self.target_block_time == 0 {
            return Err(ConfigError::InvalidValue("target_block_time must be positive".to_string()));
        }
        if self.adjustment_interval == 0 {
            return Err(ConfigError::InvalidValue("adjustment_interval must be positive".to_string()));
        }
        if self.halving_interval == 0 {
            return Err(ConfigError::InvalidValue("halving_interval must be positive".to_string()));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::InvalidValue("worker_count must be positive".to_string()));
        }
        if self.max_nonce == 0 {
            return Err(ConfigError::InvalidValue("max_nonce must be positive".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ChainConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_inverted_difficulty_bounds() {
        let config = ChainConfig {
            min_difficulty: 5,
            initial_difficulty: 3,
            ..ChainConfig::default()
        };

        assert!(matches!(config.validate(), Err(ConfigError::DifficultyBounds { .. })));
    }

    #[test]
    fn test_rejects_zero_min_difficulty() {
        let config = ChainConfig {
            min_difficulty: 0,
            initial_difficulty: 0,
            ..ChainConfig::default()
        };

        assert!(matches!(config.validate(), Err(ConfigError::DifficultyBounds { .. })));
    }

    #[test]
    fn test_rejects_zero_window() {
        let config = ChainConfig {
            adjustment_interval: 0,
            ..ChainConfig::default()
        };

        assert!(config.validate().is_err());
    }
}
