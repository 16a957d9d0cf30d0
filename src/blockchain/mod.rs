// Blockchain module
//
// This module contains the block producer and the ledger it maintains:
// - Block, transaction and cryptography types
// - Merkle roots, difficulty retargeting and the reward schedule
// - Parallel nonce search and the miner driving it
// - Block validation, account state and durable storage

pub mod account;
pub mod block;
pub mod chain;
pub mod config;
pub mod crypto;
pub mod difficulty;
pub mod merkle;
pub mod miner;
pub mod pow;
pub mod reward;
pub mod storage;
pub mod transaction;
pub mod validator;

// Re-export main components for easier access
pub use account::{Account, AccountError, Ledger};
pub use block::Block;
pub use chain::{Blockchain, BlockchainError, SupplyStats};
pub use config::{ChainConfig, FeePolicy};
pub use crypto::{Address, DigitalSignature, SignatureVerifier, Wallet};
pub use miner::{Miner, MinerMetrics, MinerState};
pub use transaction::Transaction;
