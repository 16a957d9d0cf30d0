use log::{info, warn};
use thiserror::Error;

use super::block::Block;
use super::config::ChainConfig;

/// Largest factor one retarget may move the difficulty by
pub const MAX_ADJUSTMENT_FACTOR: u128 = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DifficultyError {
    #[error("Difficulty history unavailable at height {height}: {reason}")]
    HistoryUnavailable { height: u64, reason: String },
}

/// Derives the difficulty required at each height from chain history.
///
/// Difficulty is constant inside a window of `adjustment_interval` blocks and
/// only recomputed for the first block of a new window. All arithmetic is
/// integral so every replica derives the same value.
#[derive(Debug, Clone)]
pub struct DifficultyController {
    initial: u32,
    min: u32,
    max: u32,
    target_block_time: u64,
    interval: u64,
}

impl DifficultyController {
    pub fn new(config: &ChainConfig) -> Self {
        DifficultyController {
            initial: config.initial_difficulty,
            min: config.min_difficulty,
            max: config.max_difficulty,
            target_block_time: config.target_block_time,
            interval: config.adjustment_interval.max(1),
        }
    }

    /// Whether the block at `height` opens a new window
    pub fn is_adjustment_height(&self, height: u64) -> bool {
        height > 0 && height % self.interval == 0
    }

    /// Difficulty the block at `height` must carry, given the blocks before it
    pub fn required_difficulty(&self, chain: &[Block], height: u64) -> u32 {
        if height == 0 {
            return self.initial;
        }

        let current = chain
            .get((height - 1) as usize)
            .map(|block| block.difficulty)
            .unwrap_or(self.initial);

        if !self.is_adjustment_height(height) {
            return current;
        }

        match self.retarget(chain, height, current) {
            Ok(next) => {
                if next != current {
                    info!("Difficulty retarget at height {}: {} -> {}", height, current, next);
                }
                next
            }
            Err(err) => {
                warn!("{}; keeping difficulty {}", err, current);
                current
            }
        }
    }

    /// Recomputes the difficulty from the window ending just before `height`
    pub fn retarget(&self, chain: &[Block], height: u64, current: u32) -> Result<u32, DifficultyError> {
        let window_start = height.checked_sub(self.interval).ok_or_else(|| DifficultyError::HistoryUnavailable {
            height,
            reason: "window starts before genesis".to_string(),
        })?;

        let first = chain.get(window_start as usize);
        let last = chain.get((height - 1) as usize);
        let (first, last) = match (first, last) {
            (Some(first), Some(last)) => (first, last),
            _ => {
                return Err(DifficultyError::HistoryUnavailable {
                    height,
                    reason: format!("blocks {}..{} not available", window_start, height),
                })
            }
        };

        let actual = last.timestamp.saturating_sub(first.timestamp);
        if actual <= 0 {
            return Err(DifficultyError::HistoryUnavailable {
                height,
                reason: format!("non-positive window duration {}s", actual),
            });
        }

        Ok(self.adjust(current, actual as u64))
    }

    /// `round(current / clamp(actual / expected, 1/4, 4))`, then bounded.
    ///
    /// Rounding is half-up on the exact rational. The rounded value is kept
    /// within `[ceil(current / 4), current * 4]` before the configured bounds
    /// apply.
    pub fn adjust(&self, current: u32, actual_secs: u64) -> u32 {
        let old = u128::from(current);
        let expected = u128::from(self.interval) * u128::from(self.target_block_time);
        let actual = u128::from(actual_secs.max(1));

        let (num, den) = if actual * MAX_ADJUSTMENT_FACTOR < expected {
            (old * MAX_ADJUSTMENT_FACTOR, 1)
        } else if actual > expected * MAX_ADJUSTMENT_FACTOR {
            (old, MAX_ADJUSTMENT_FACTOR)
        } else {
            (old * expected, actual)
        };

        // Rounding can overshoot the factor-four band for small values
        let floor = (old + MAX_ADJUSTMENT_FACTOR - 1) / MAX_ADJUSTMENT_FACTOR;
        let rounded = ((2 * num + den) / (2 * den)).clamp(floor, old * MAX_ADJUSTMENT_FACTOR);
        rounded.clamp(u128::from(self.min), u128::from(self.max)) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::Address;

    fn controller(initial: u32, min: u32, max: u32) -> DifficultyController {
        DifficultyController::new(&ChainConfig {
            initial_difficulty: initial,
            min_difficulty: min,
            max_difficulty: max,
            target_block_time: 10,
            adjustment_interval: 4,
            ..ChainConfig::default()
        })
    }

    fn chain_with_spacing(len: u64, spacing: i64, difficulty: u32) -> Vec<Block> {
        (0..len)
            .map(|h| {
                Block::new(
                    h,
                    1_000 + h as i64 * spacing,
                    String::new(),
                    difficulty,
                    Address("m".into()),
                    0,
                    Vec::new(),
                )
            })
            .collect()
    }

    #[test]
    fn test_half_time_doubles_difficulty() {
        let c = controller(4, 1, 64);
        // expected = 4 * 10 = 40s, actual = 20s
        assert_eq!(c.adjust(4, 20), 8);
    }

    #[test]
    fn test_on_target_keeps_difficulty() {
        let c = controller(4, 1, 64);
        assert_eq!(c.adjust(4, 40), 4);
    }

    #[test]
    fn test_change_is_bounded_by_factor_four() {
        let c = controller(4, 1, 64);
        assert_eq!(c.adjust(4, 1), 16);
        assert_eq!(c.adjust(8, 40 * 100), 2);

        for old in 1..=16u32 {
            for actual in [1u64, 5, 9, 10, 11, 39, 40, 80, 159, 160, 161, 10_000] {
                let new = c.adjust(old, actual);
                assert!(new <= old * 4, "old {} actual {} new {}", old, actual, new);
                assert!(new * 4 >= old, "old {} actual {} new {}", old, actual, new);
                assert!((1..=64).contains(&new));
            }
        }
    }

    #[test]
    fn test_slow_window_never_drops_more_than_four_times() {
        let c = controller(5, 1, 64);
        // 5 / 4 = 1.25 would round to 1
        assert_eq!(c.adjust(5, 4000), 2);
        assert_eq!(c.adjust(6, 4000), 2);
        assert_eq!(c.adjust(1, 4000), 1);
    }

    #[test]
    fn test_result_is_clamped_to_bounds() {
        let c = controller(4, 3, 6);
        assert_eq!(c.adjust(4, 1), 6);
        assert_eq!(c.adjust(4, 10_000), 3);
    }

    #[test]
    fn test_rounding_is_half_up() {
        let c = controller(4, 1, 64);
        // 3 * 40 / 48 = 2.5
        assert_eq!(c.adjust(3, 48), 3);
        // 3 * 40 / 50 = 2.4
        assert_eq!(c.adjust(3, 50), 2);
    }

    #[test]
    fn test_required_difficulty_constant_inside_window() {
        let c = controller(4, 1, 64);
        let chain = chain_with_spacing(3, 1, 4);
        assert_eq!(c.required_difficulty(&chain, 0), 4);
        assert_eq!(c.required_difficulty(&chain, 3), 4);
    }

    #[test]
    fn test_required_difficulty_retargets_at_boundary() {
        let c = controller(4, 1, 64);
        // blocks 0..4 spaced 5s apart: actual = ts(3) - ts(0) = 15s vs 40s expected
        let chain = chain_with_spacing(4, 5, 4);
        assert_eq!(c.required_difficulty(&chain, 4), 11);
    }

    #[test]
    fn test_non_positive_duration_keeps_difficulty() {
        let c = controller(4, 1, 64);
        let chain = chain_with_spacing(4, 0, 4);

        assert!(matches!(
            c.retarget(&chain, 4, 4),
            Err(DifficultyError::HistoryUnavailable { height: 4, .. })
        ));
        assert_eq!(c.required_difficulty(&chain, 4), 4);
    }

    #[test]
    fn test_missing_history_keeps_difficulty() {
        let c = controller(4, 1, 64);
        let chain = chain_with_spacing(2, 5, 5);
        assert!(c.retarget(&chain, 4, 5).is_err());
        assert_eq!(c.required_difficulty(&chain, 4), 4);
    }
}
