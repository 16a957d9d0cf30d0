use super::config::ChainConfig;

/// Reward minted by the coinbase of the block at `height`.
///
/// Halves every `halving_interval` blocks and never drops below
/// `minimum_reward`.
pub fn block_reward(config: &ChainConfig, height: u64) -> u64 {
    let halvings = height / config.halving_interval.max(1);
    let halved = if halvings >= u64::from(u64::BITS) {
        0
    } else {
        config.initial_reward >> halvings
    };

    halved.max(config.minimum_reward)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ChainConfig {
        ChainConfig {
            initial_reward: 50,
            minimum_reward: 0,
            halving_interval: 10,
            ..ChainConfig::default()
        }
    }

    #[test]
    fn test_reward_halves_at_interval() {
        let config = config();
        assert_eq!(block_reward(&config, 0), 50);
        assert_eq!(block_reward(&config, 9), 50);
        assert_eq!(block_reward(&config, 10), 25);
        assert_eq!(block_reward(&config, 20), 12);
    }

    #[test]
    fn test_reward_reaches_zero_without_panicking() {
        let config = config();
        assert_eq!(block_reward(&config, 10 * 63), 0);
        assert_eq!(block_reward(&config, 10 * 64), 0);
        assert_eq!(block_reward(&config, u64::MAX), 0);
    }

    #[test]
    fn test_minimum_reward_floor() {
        let config = ChainConfig {
            minimum_reward: 3,
            ..config()
        };
        assert_eq!(block_reward(&config, 40), 3);
        assert_eq!(block_reward(&config, 0), 50);
    }
}
