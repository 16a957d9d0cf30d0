use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use super::account::{AccountError, Ledger, LedgerEffect};
use super::block::{Block, GENESIS_PREVIOUS_HASH};
use super::config::{ChainConfig, ConfigError, FeePolicy};
use super::crypto::{Address, Ed25519Verifier, SignatureVerifier};
use super::pow::{CancellationToken, NoncePool, SearchCounters, SearchOutcome};
use super::reward::block_reward;
use super::storage::{BlockchainStorage, StorageError};
use super::transaction::{Transaction, TransactionError};
use super::validator::{BlockValidator, ValidationError};

/// Fixed genesis timestamp so every node rebuilds the same genesis block
pub const GENESIS_TIMESTAMP: i64 = 1_700_000_000;

/// Errors that can occur during blockchain operations
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),

    #[error("Account error: {0}")]
    AccountError(#[from] AccountError),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Config error: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("Block rejected: {0}")]
    BlockRejected(#[from] ValidationError),

    #[error("Duplicate transaction: {0}")]
    DuplicateTransaction(String),

    #[error("Commit failed, chain halted: {0}")]
    CommitFailed(StorageError),

    #[error("Chain halted after a failed commit")]
    Halted,

    #[error("Genesis mining failed: {0}")]
    GenesisFailed(String),

    #[error("Invalid chain: {0}")]
    InvalidChain(String),
}

impl BlockchainError {
    /// Errors after which the node must stop producing blocks
    pub fn is_fatal(&self) -> bool {
        matches!(self, BlockchainError::CommitFailed(_) | BlockchainError::Halted)
    }
}

/// Cumulative minting and burning since genesis
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SupplyStats {
    pub minted: u64,
    pub burned: u64,
}

impl SupplyStats {
    /// What the sum of all balances must equal
    pub fn expected_circulating(&self) -> u64 {
        self.minted.saturating_sub(self.burned)
    }

    fn after(&self, effect: &LedgerEffect) -> SupplyStats {
        SupplyStats {
            minted: self.minted.saturating_add(effect.minted),
            burned: self.burned.saturating_add(effect.burned),
        }
    }
}

/// The append-only block sequence together with the ledger it produced
pub struct Blockchain {
    config: ChainConfig,

    /// The chain of blocks
    chain: RwLock<Vec<Block>>,

    /// Transactions waiting for a block, in arrival order
    pending_transactions: Mutex<Vec<Transaction>>,

    ledger: Ledger,

    supply: RwLock<SupplyStats>,

    validator: BlockValidator,

    verifier: Arc<dyn SignatureVerifier>,

    /// Storage for blockchain data
    storage: Option<BlockchainStorage>,

    halted: AtomicBool,
}

impl std::fmt::Debug for Blockchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blockchain")
            .field("height", &self.height())
            .field("pending", &self.pending_transactions.lock().len())
            .field("halted", &self.is_halted())
            .finish()
    }
}

impl Blockchain {
    /// Creates an in-memory blockchain with a freshly mined genesis block
    pub fn new(config: ChainConfig) -> Result<Self, BlockchainError> {
        let blockchain = Self::empty(config, None)?;
        blockchain.append(blockchain.genesis_block()?, false)?;
        Ok(blockchain)
    }

    /// Opens the chain stored at `storage_path`, replaying every block.
    ///
    /// An empty store gets a genesis block.
    pub fn with_storage<P: AsRef<Path>>(storage_path: P, config: ChainConfig) -> Result<Self, BlockchainError> {
        let storage = BlockchainStorage::new(storage_path)?;
        Self::from_storage(storage, config)
    }

    pub fn from_storage(storage: BlockchainStorage, config: ChainConfig) -> Result<Self, BlockchainError> {
        let blocks = storage.get_all_blocks()?;
        let blockchain = Self::empty(config, Some(storage))?;

        if blocks.is_empty() {
            info!("No existing blockchain found in storage, creating genesis block");
            blockchain.append(blockchain.genesis_block()?, true)?;
            return Ok(blockchain);
        }

        let count = blocks.len();
        for block in blocks {
            let height = block.height;
            blockchain
                .append(block, false)
                .map_err(|e| BlockchainError::InvalidChain(format!("stored block {} failed replay: {}", height, e)))?;
        }
        info!("Replayed {} blocks from storage", count);

        blockchain.check_storage_consistency();
        Ok(blockchain)
    }

    fn empty(config: ChainConfig, storage: Option<BlockchainStorage>) -> Result<Self, BlockchainError> {
        config.validate()?;

        Ok(Blockchain {
            validator: BlockValidator::new(&config),
            config,
            chain: RwLock::new(Vec::new()),
            pending_transactions: Mutex::new(Vec::new()),
            ledger: Ledger::new(),
            supply: RwLock::new(SupplyStats::default()),
            verifier: Arc::new(Ed25519Verifier),
            storage,
            halted: AtomicBool::new(false),
        })
    }

    /// Replaces the signature capability used when admitting transactions
    pub fn with_verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Mines the genesis block with a single worker so the nonce is reproducible
    fn genesis_block(&self) -> Result<Block, BlockchainError> {
        let treasury = self.config.treasury_address.clone();
        let reward = block_reward(&self.config, 0);
        let coinbase = Transaction::new_coinbase(treasury.clone(), reward, 0, GENESIS_TIMESTAMP);
        let block = Block::new(
            0,
            GENESIS_TIMESTAMP,
            GENESIS_PREVIOUS_HASH.to_string(),
            self.config.initial_difficulty,
            treasury,
            reward,
            vec![coinbase],
        );

        let pool = NoncePool::sequential(self.config.max_nonce);
        match pool.search(
            &block.template(),
            block.difficulty,
            &CancellationToken::new(),
            &SearchCounters::default(),
            None,
        ) {
            SearchOutcome::Found { nonce, .. } => Ok(block.seal(nonce)),
            other => Err(BlockchainError::GenesisFailed(format!("{:?}", other))),
        }
    }

    fn check_storage_consistency(&self) {
        let Some(storage) = &self.storage else {
            return;
        };

        let head = self.head();
        match storage.get_block_height() {
            Ok(Some(height)) if Some(height) != head.as_ref().map(|b| b.height) => {
                warn!("Stored height {} differs from replayed head", height);
            }
            Err(err) => warn!("Failed to read stored height: {}", err),
            _ => {}
        }
        if let (Ok(hash), Some(head)) = (storage.get_latest_block_hash(), head.as_ref()) {
            if hash != head.hash {
                warn!("Stored head hash {} differs from replayed head {}", hash, head.hash);
            }
        }
        if let Ok(Some(stored)) = storage.get_supply() {
            if stored != self.supply() {
                warn!("Stored supply {:?} differs from replayed supply {:?}", stored, self.supply());
            }
        }

        match storage.get_all_accounts() {
            Ok(accounts) => {
                let mismatched = accounts
                    .iter()
                    .filter(|stored| self.ledger.balance(&stored.address) != stored.balance)
                    .count();
                if mismatched > 0 {
                    warn!("{} stored accounts differ from the replayed ledger", mismatched);
                }
            }
            Err(err) => warn!("Failed to load accounts from storage: {}", err),
        }
    }

    /// Validates `block`, applies it to the ledger, optionally persists it and
    /// appends it, as one step under the chain write lock
    fn append(&self, block: Block, persist: bool) -> Result<LedgerEffect, BlockchainError> {
        if self.is_halted() {
            return Err(BlockchainError::Halted);
        }

        let mut chain = self.chain.write();
        self.validator.validate(&block, &chain)?;

        let fee_recipient = match self.config.fee_policy {
            FeePolicy::Burn => None,
            FeePolicy::Miner => Some(block.miner.clone()),
        };

        let mut supply = self.supply.write();
        let storage = if persist { self.storage.as_ref() } else { None };

        // Held across the ledger merge so nonce accounting never sees an
        // applied transaction that is still queued
        let mut pending = self.pending_transactions.lock();

        let effect = self
            .ledger
            .apply_block(&block.transactions, fee_recipient.as_ref(), |accounts| {
                let Some(storage) = storage else {
                    return Ok(());
                };
                let next_supply = supply.after(&LedgerEffect {
                    minted: block.reward,
                    burned: if fee_recipient.is_some() { 0 } else { block.total_fees() },
                    fees_paid: 0,
                });
                storage.commit_block(&block, accounts, &next_supply).map_err(|err| {
                    self.halt(&err);
                    BlockchainError::CommitFailed(err)
                })
            })
            .map_err(|err| match err {
                BlockchainError::AccountError(err) => BlockchainError::BlockRejected(ValidationError::LedgerRejected(err)),
                other => other,
            })?;

        *supply = supply.after(&effect);
        drop(supply);

        let included: Vec<&str> = block.transactions.iter().map(|tx| tx.id.as_str()).collect();
        pending.retain(|tx| !included.contains(&tx.id.as_str()));
        drop(pending);

        info!(
            "Appended block {} ({}) with {} transactions at difficulty {}",
            block.height,
            block.hash,
            block.transactions.len(),
            block.difficulty
        );

        chain.push(block);
        Ok(effect)
    }

    fn halt(&self, cause: &StorageError) {
        error!("Block commit failed, halting chain: {}", cause);
        self.halted.store(true, Ordering::SeqCst);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Validates and appends a mined block
    pub fn submit_block(&self, block: Block) -> Result<LedgerEffect, BlockchainError> {
        let height = block.height;
        self.append(block, true).map_err(|err| {
            if let BlockchainError::BlockRejected(reason) = &err {
                warn!("Block {} rejected: {}", height, reason);
            }
            err
        })
    }

    /// Assembles an unmined block on top of the current head.
    ///
    /// Pending transactions that no longer apply are evicted.
    pub fn build_template(&self, miner: &Address, timestamp: i64) -> Block {
        let chain = self.chain.read();
        let height = chain.len() as u64;
        let previous_hash = chain
            .last()
            .map_or_else(|| GENESIS_PREVIOUS_HASH.to_string(), |head| head.hash.clone());
        let timestamp = chain.last().map_or(timestamp, |head| timestamp.max(head.timestamp));
        let difficulty = self
            .validator
            .difficulty_controller()
            .required_difficulty(&chain, height);
        let reward = block_reward(&self.config, height);

        let fee_recipient = match self.config.fee_policy {
            FeePolicy::Burn => None,
            FeePolicy::Miner => Some(miner),
        };

        let mut pending = self.pending_transactions.lock();
        let (accepted, rejected) = self.ledger.select_applicable(&pending, fee_recipient);
        if !rejected.is_empty() {
            for (tx, reason) in &rejected {
                warn!("Evicting pending transaction {}: {}", tx.id, reason);
            }
            pending.retain(|tx| !rejected.iter().any(|(r, _)| r.id == tx.id));
        }
        drop(pending);

        let mut transactions = Vec::with_capacity(accepted.len() + 1);
        transactions.push(Transaction::new_coinbase(miner.clone(), reward, height, timestamp));
        transactions.extend(accepted);

        debug!(
            "Built template for height {} with {} transactions at difficulty {}",
            height,
            transactions.len(),
            difficulty
        );

        Block::new(height, timestamp, previous_hash, difficulty, miner.clone(), reward, transactions)
    }

    /// Queues a signed transaction for inclusion.
    ///
    /// Returns the height of the block expected to include it.
    pub fn add_transaction(&self, transaction: Transaction) -> Result<u64, BlockchainError> {
        if transaction.is_coinbase() || transaction.from.is_coinbase() {
            return Err(TransactionError::InvalidSenderAddress("coinbase transactions are minted by blocks".to_string()).into());
        }
        transaction.validate_basic()?;

        if !transaction.verify_signature(self.verifier.as_ref())? {
            return Err(TransactionError::InvalidSignature.into());
        }

        let mut pending = self.pending_transactions.lock();
        if pending.iter().any(|tx| tx.id == transaction.id) {
            return Err(BlockchainError::DuplicateTransaction(transaction.id));
        }

        let queued: Vec<&Transaction> = pending.iter().filter(|tx| tx.from == transaction.from).collect();
        let expected = self.ledger.next_nonce(&transaction.from) + queued.len() as u64;
        if transaction.nonce != expected {
            return Err(AccountError::InvalidNonce {
                expected,
                got: transaction.nonce,
            }
            .into());
        }

        let committed: u64 = queued
            .iter()
            .filter_map(|tx| tx.total_debit())
            .fold(0u64, u64::saturating_add);
        let required = committed.saturating_add(transaction.total_debit().unwrap_or(u64::MAX));
        let available = self.ledger.balance(&transaction.from);
        if available < required {
            return Err(AccountError::InsufficientBalance { required, available }.into());
        }

        debug!("Queued transaction {} from {}", transaction.id, transaction.from);
        pending.push(transaction);
        drop(pending);

        Ok(self.height().map_or(0, |h| h + 1))
    }

    /// Nonce the next transaction from `address` must carry, counting queued ones
    pub fn next_nonce(&self, address: &Address) -> u64 {
        let pending = self.pending_transactions.lock();
        let queued = pending.iter().filter(|tx| &tx.from == address).count() as u64;
        self.ledger.next_nonce(address) + queued
    }

    /// Gets the last block in the chain
    pub fn head(&self) -> Option<Block> {
        self.chain.read().last().cloned()
    }

    pub fn height(&self) -> Option<u64> {
        self.chain.read().last().map(|block| block.height)
    }

    pub fn block(&self, height: u64) -> Option<Block> {
        self.chain.read().get(height as usize).cloned()
    }

    /// Gets the entire blockchain
    pub fn chain(&self) -> Vec<Block> {
        self.chain.read().clone()
    }

    /// Difficulty the next block must carry
    pub fn next_difficulty(&self) -> u32 {
        let chain = self.chain.read();
        self.validator
            .difficulty_controller()
            .required_difficulty(&chain, chain.len() as u64)
    }

    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.pending_transactions.lock().clone()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// Cumulative minted and burned amounts
    pub fn supply(&self) -> SupplyStats {
        *self.supply.read()
    }

    /// Supply counters together with the sum of balances, read at one height
    pub fn supply_snapshot(&self) -> (SupplyStats, u64) {
        let supply = self.supply.read();
        (*supply, self.ledger.total_supply())
    }

    #[cfg(test)]
    pub(crate) fn storage(&self) -> Option<&BlockchainStorage> {
        self.storage.as_ref()
    }

    /// Re-validates every block and replays the ledger from scratch
    pub fn verify_chain(&self) -> Result<(), BlockchainError> {
        let chain = self.chain.read();
        let ledger = Ledger::new();
        let fee_policy = self.config.fee_policy;

        for (index, block) in chain.iter().enumerate() {
            self.validator.validate(block, &chain[..index])?;
            let fee_recipient = match fee_policy {
                FeePolicy::Burn => None,
                FeePolicy::Miner => Some(&block.miner),
            };
            ledger.apply_block::<AccountError, _>(&block.transactions, fee_recipient, |_| Ok(()))?;
        }

        if ledger.accounts().iter().any(|account| account.balance != self.ledger.balance(&account.address)) {
            return Err(BlockchainError::InvalidChain("replayed ledger differs from live ledger".to_string()));
        }

        let supply = self.supply();
        if ledger.total_supply() != supply.expected_circulating() {
            return Err(BlockchainError::InvalidChain(format!(
                "total supply {} differs from minted {} minus burned {}",
                ledger.total_supply(),
                supply.minted,
                supply.burned
            )));
        }

        Ok(())
    }

    /// Validates the blockchain
    pub fn is_valid(&self) -> bool {
        match self.verify_chain() {
            Ok(()) => true,
            Err(err) => {
                warn!("Chain verification failed: {}", err);
                false
            }
        }
    }
}
