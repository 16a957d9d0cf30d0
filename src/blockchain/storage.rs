use std::path::Path;

use log::warn;
use serde::de::DeserializeOwned;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use thiserror::Error;

use super::account::Account;
use super::block::Block;
use super::chain::SupplyStats;
use super::crypto::{Address, Wallet};

const LATEST_BLOCK_HASH_KEY: &str = "latest_block_hash";
const BLOCK_HEIGHT_KEY: &str = "block_height";
const SUPPLY_KEY: &str = "supply";
const NODE_KEY: &str = "node_key";

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Commit aborted")]
    CommitAborted,

    #[error("Item not found: {0}")]
    NotFound(String),
}

/// Durable block and account records.
///
/// Blocks are keyed by big-endian height so iteration follows the chain.
/// Records are JSON; metadata scalars use bincode.
pub struct BlockchainStorage {
    /// The database instance
    db: Db,

    /// Tree for blocks
    blocks: Tree,

    /// Tree for accounts
    accounts: Tree,

    /// Tree for metadata
    metadata: Tree,

    #[cfg(test)]
    fail_commits: std::sync::atomic::AtomicBool,
}

impl std::fmt::Debug for BlockchainStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockchainStorage").finish()
    }
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec(value).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    serde_json::from_slice(bytes).map_err(|e| StorageError::DeserializationError(e.to_string()))
}

impl BlockchainStorage {
    /// Opens (or creates) the database at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::from_db(sled::open(path)?)
    }

    /// A database removed when dropped
    pub fn temporary() -> Result<Self, StorageError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        let blocks = db.open_tree("blocks")?;
        let accounts = db.open_tree("accounts")?;
        let metadata = db.open_tree("metadata")?;

        Ok(Self {
            db,
            blocks,
            accounts,
            metadata,
            #[cfg(test)]
            fail_commits: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Writes a block, the accounts it touched and the new supply counters in
    /// one transaction, then flushes to disk
    pub fn commit_block(&self, block: &Block, accounts: &[Account], supply: &SupplyStats) -> Result<(), StorageError> {
        #[cfg(test)]
        if self.fail_commits.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StorageError::CommitAborted);
        }

        let block_key = block.height.to_be_bytes();
        let block_value = encode_json(block)?;
        let account_values = accounts
            .iter()
            .map(|account| Ok((account.address.0.clone(), encode_json(account)?)))
            .collect::<Result<Vec<_>, StorageError>>()?;
        let height_value =
            bincode::serialize(&block.height).map_err(|e| StorageError::SerializationError(e.to_string()))?;
        let supply_value = encode_json(supply)?;

        let result: Result<(), TransactionError<()>> = (&self.blocks, &self.accounts, &self.metadata).transaction(
            |(blocks, accounts, metadata)| {
                blocks.insert(&block_key[..], block_value.clone())?;
                for (key, value) in &account_values {
                    accounts.insert(key.as_bytes(), value.clone())?;
                }
                metadata.insert(LATEST_BLOCK_HASH_KEY, block.hash.as_bytes())?;
                metadata.insert(BLOCK_HEIGHT_KEY, height_value.clone())?;
                metadata.insert(SUPPLY_KEY, supply_value.clone())?;
                Ok::<(), ConflictableTransactionError<()>>(())
            },
        );

        result.map_err(|err| match err {
            TransactionError::Storage(e) => StorageError::DatabaseError(e),
            TransactionError::Abort(()) => StorageError::CommitAborted,
        })?;

        self.flush()
    }

    /// Gets a block by height
    pub fn get_block(&self, height: u64) -> Result<Block, StorageError> {
        match self.blocks.get(height.to_be_bytes())? {
            Some(value) => decode_json(&value),
            None => Err(StorageError::NotFound(format!("Block at height {} not found", height))),
        }
    }

    /// Gets all blocks in height order
    pub fn get_all_blocks(&self) -> Result<Vec<Block>, StorageError> {
        self.collect_tree(&self.blocks, "block")
    }

    /// Gets an account by its address
    pub fn get_account(&self, address: &Address) -> Result<Option<Account>, StorageError> {
        match self.accounts.get(address.0.as_bytes())? {
            Some(value) => decode_json(&value).map(Some),
            None => Ok(None),
        }
    }

    /// Gets all accounts from storage
    pub fn get_all_accounts(&self) -> Result<Vec<Account>, StorageError> {
        self.collect_tree(&self.accounts, "account")
    }

    /// Gets the latest block hash
    pub fn get_latest_block_hash(&self) -> Result<String, StorageError> {
        match self.metadata.get(LATEST_BLOCK_HASH_KEY)? {
            Some(value) => Ok(String::from_utf8_lossy(&value).to_string()),
            None => Err(StorageError::NotFound("Latest block hash not found".to_string())),
        }
    }

    /// Gets the height of the last committed block, if any
    pub fn get_block_height(&self) -> Result<Option<u64>, StorageError> {
        match self.metadata.get(BLOCK_HEIGHT_KEY)? {
            Some(value) => {
                let height: u64 = bincode::deserialize(&value)
                    .map_err(|e| StorageError::DeserializationError(e.to_string()))?;
                Ok(Some(height))
            }
            None => Ok(None),
        }
    }

    /// Gets the supply counters recorded with the last commit
    pub fn get_supply(&self) -> Result<Option<SupplyStats>, StorageError> {
        match self.metadata.get(SUPPLY_KEY)? {
            Some(value) => decode_json(&value).map(Some),
            None => Ok(None),
        }
    }

    /// Loads the node's signing key, generating and storing one on first start.
    ///
    /// The key lives beside the chain so the address holding the genesis
    /// allocation and earlier rewards stays spendable across restarts.
    pub fn load_or_create_wallet(&self) -> Result<Wallet, StorageError> {
        if let Some(secret) = self.metadata.get(NODE_KEY)? {
            return Wallet::from_secret_key(&secret)
                .map_err(|e| StorageError::DeserializationError(format!("node key: {}", e)));
        }

        let wallet = Wallet::new();
        self.metadata.insert(NODE_KEY, wallet.export_secret_key())?;
        self.flush()?;
        Ok(wallet)
    }

    /// Flushes all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    fn collect_tree<T: DeserializeOwned>(&self, tree: &Tree, kind: &str) -> Result<Vec<T>, StorageError> {
        let mut items = Vec::new();
        let mut deserialization_errors = Vec::new();

        for result in tree.iter() {
            let (key, value) = result?;
            match decode_json::<T>(&value) {
                Ok(item) => items.push(item),
                Err(e) => {
                    let key_str = hex::encode(key.as_ref());
                    deserialization_errors.push(format!("Failed to deserialize {} {}: {}", kind, key_str, e));
                }
            }
        }

        if !deserialization_errors.is_empty() {
            if items.is_empty() {
                return Err(StorageError::DeserializationError(format!(
                    "Failed to deserialize any {}: {}",
                    kind,
                    deserialization_errors.join(", ")
                )));
            }
            warn!("Some {} records could not be deserialized: {}", kind, deserialization_errors.join(", "));
        }

        Ok(items)
    }
}

#[cfg(test)]
impl BlockchainStorage {
    /// Opens `path`, waiting for an earlier handle to release sled's file lock
    pub(crate) fn open_when_released<P: AsRef<Path>>(path: P) -> Self {
        let mut attempts = 0;
        loop {
            match Self::new(path.as_ref()) {
                Ok(storage) => return storage,
                Err(err) if attempts < 100 => {
                    attempts += 1;
                    log::debug!("Waiting for storage lock: {}", err);
                    std::thread::sleep(std::time::Duration::from_millis(20));
                }
                Err(err) => panic!("storage never became available: {}", err),
            }
        }
    }

    /// Makes every following commit fail as a disk error would
    pub(crate) fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::block::GENESIS_PREVIOUS_HASH;
    use crate::blockchain::transaction::Transaction;

    fn block(height: u64) -> Block {
        let miner = Address("miner".into());
        Block::new(
            height,
            1_700_000_000 + height as i64,
            GENESIS_PREVIOUS_HASH.to_string(),
            1,
            miner.clone(),
            50,
            vec![Transaction::new_coinbase(miner, 50, height, 1_700_000_000)],
        )
    }

    #[test]
    fn test_commit_and_read_back() {
        let storage = BlockchainStorage::temporary().unwrap();
        let mut account = Account::new(Address("miner".into()));
        account.deposit(50).unwrap();
        let supply = SupplyStats { minted: 50, burned: 0 };

        storage.commit_block(&block(0), &[account.clone()], &supply).unwrap();

        assert_eq!(storage.get_block(0).unwrap(), block(0));
        assert_eq!(storage.get_account(&account.address).unwrap(), Some(account));
        assert_eq!(storage.get_account(&Address("nobody".into())).unwrap(), None);
        assert_eq!(storage.get_block_height().unwrap(), Some(0));
        assert_eq!(storage.get_latest_block_hash().unwrap(), block(0).hash);
        assert_eq!(storage.get_supply().unwrap(), Some(supply));
        assert!(matches!(storage.get_block(1), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_blocks_iterate_in_height_order() {
        let storage = BlockchainStorage::temporary().unwrap();
        let supply = SupplyStats::default();
        for height in [0u64, 1, 2, 256, 3] {
            storage.commit_block(&block(height), &[], &supply).unwrap();
        }

        let heights: Vec<u64> = storage.get_all_blocks().unwrap().iter().map(|b| b.height).collect();
        assert_eq!(heights, vec![0, 1, 2, 3, 256]);
    }

    #[test]
    fn test_empty_storage() {
        let storage = BlockchainStorage::temporary().unwrap();
        assert!(storage.get_all_blocks().unwrap().is_empty());
        assert_eq!(storage.get_block_height().unwrap(), None);
        assert!(storage.get_latest_block_hash().is_err());
    }

    #[test]
    fn test_node_key_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        let address = {
            let storage = BlockchainStorage::open_when_released(dir.path());
            let first = storage.load_or_create_wallet().unwrap();
            let again = storage.load_or_create_wallet().unwrap();
            assert_eq!(first.address(), again.address());
            first.address().clone()
        };

        let storage = BlockchainStorage::open_when_released(dir.path());
        assert_eq!(storage.load_or_create_wallet().unwrap().address(), &address);
    }

    #[test]
    fn test_failing_commit_writes_nothing() {
        let storage = BlockchainStorage::temporary().unwrap();
        storage.fail_commits(true);

        assert!(matches!(
            storage.commit_block(&block(0), &[], &SupplyStats::default()),
            Err(StorageError::CommitAborted)
        ));
        assert!(storage.get_all_blocks().unwrap().is_empty());
    }
}
