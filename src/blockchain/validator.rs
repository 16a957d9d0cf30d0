use thiserror::Error;

use super::account::AccountError;
use super::block::{leading_zero_nibbles, Block, GENESIS_PREVIOUS_HASH};
use super::config::ChainConfig;
use super::difficulty::DifficultyController;
use super::merkle::merkle_root_hex;
use super::reward::block_reward;

/// Reasons a block is rejected
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid height: expected {expected}, got {got}")]
    InvalidHeight { expected: u64, got: u64 },

    #[error("Previous hash mismatch: expected {expected}, got {got}")]
    PreviousHashMismatch { expected: String, got: String },

    #[error("Merkle root mismatch: expected {expected}, got {got}")]
    MerkleRootMismatch { expected: String, got: String },

    #[error("Insufficient proof of work: {zeros} leading zero nibbles, difficulty {difficulty}")]
    InsufficientWork { zeros: u32, difficulty: u32 },

    #[error("Difficulty mismatch: expected {expected}, got {got}")]
    DifficultyMismatch { expected: u32, got: u32 },

    #[error("Cached hash mismatch: expected {expected}, got {got}")]
    HashMismatch { expected: String, got: String },

    #[error("Invalid coinbase: {0}")]
    InvalidCoinbase(String),

    #[error("Invalid transaction {id}: {reason}")]
    InvalidTransaction { id: String, reason: String },

    #[error("Ledger rejected block transactions: {0}")]
    LedgerRejected(AccountError),
}

/// Checks a block against the chain it would extend. Never mutates state.
#[derive(Debug, Clone)]
pub struct BlockValidator {
    config: ChainConfig,
    difficulty: DifficultyController,
}

impl BlockValidator {
    pub fn new(config: &ChainConfig) -> Self {
        BlockValidator {
            config: config.clone(),
            difficulty: DifficultyController::new(config),
        }
    }

    pub fn difficulty_controller(&self) -> &DifficultyController {
        &self.difficulty
    }

    /// Validates `block` as the successor of `chain.last()`
    pub fn validate(&self, block: &Block, chain: &[Block]) -> Result<(), ValidationError> {
        // (a) linkage by height
        let expected_height = chain.last().map_or(0, |head| head.height + 1);
        if block.height != expected_height {
            return Err(ValidationError::InvalidHeight {
                expected: expected_height,
                got: block.height,
            });
        }

        // (b) linkage by hash
        let expected_previous = chain
            .last()
            .map_or_else(|| GENESIS_PREVIOUS_HASH.to_string(), Block::calculate_hash);
        if block.previous_hash != expected_previous {
            return Err(ValidationError::PreviousHashMismatch {
                expected: expected_previous,
                got: block.previous_hash.clone(),
            });
        }

        // (c) merkle root
        let expected_root = merkle_root_hex(&block.transactions);
        if block.merkle_root != expected_root {
            return Err(ValidationError::MerkleRootMismatch {
                expected: expected_root,
                got: block.merkle_root.clone(),
            });
        }

        // (d) proof of work
        let header_hash = block.header_hash();
        let zeros = leading_zero_nibbles(&header_hash);
        if zeros < block.difficulty {
            return Err(ValidationError::InsufficientWork {
                zeros,
                difficulty: block.difficulty,
            });
        }

        // (e) difficulty schedule
        let required = self.difficulty.required_difficulty(chain, block.height);
        if block.difficulty != required {
            return Err(ValidationError::DifficultyMismatch {
                expected: required,
                got: block.difficulty,
            });
        }

        let recomputed = hex::encode(header_hash);
        if block.hash != recomputed {
            return Err(ValidationError::HashMismatch {
                expected: recomputed,
                got: block.hash.clone(),
            });
        }

        self.validate_transactions(block)
    }

    fn validate_transactions(&self, block: &Block) -> Result<(), ValidationError> {
        let coinbase = block
            .coinbase()
            .ok_or_else(|| ValidationError::InvalidCoinbase("first transaction must be the coinbase".to_string()))?;

        let expected_reward = block_reward(&self.config, block.height);
        if block.reward != expected_reward {
            return Err(ValidationError::InvalidCoinbase(format!(
                "reward {} does not match schedule {}",
                block.reward, expected_reward
            )));
        }
        if coinbase.amount != block.reward || coinbase.to != block.miner {
            return Err(ValidationError::InvalidCoinbase(format!(
                "coinbase pays {} to {}, block declares {} to {}",
                coinbase.amount, coinbase.to, block.reward, block.miner
            )));
        }

        for tx in &block.transactions[1..] {
            if tx.is_coinbase() || tx.from.is_coinbase() {
                return Err(ValidationError::InvalidCoinbase(format!(
                    "additional coinbase transaction {}",
                    tx.id
                )));
            }
        }

        for tx in &block.transactions {
            tx.validate_basic().map_err(|e| ValidationError::InvalidTransaction {
                id: tx.id.clone(),
                reason: e.to_string(),
            })?;
        }

        Ok(())
    }
}
