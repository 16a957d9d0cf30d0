use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use utoipa::ToSchema;

use super::crypto::Address;
use super::merkle::merkle_root_hex;
use super::transaction::{absorb_field, Transaction};

/// Previous-hash of the genesis block
pub const GENESIS_PREVIOUS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Represents a block in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Block {
    /// Version of the block structure
    #[serde(default = "default_version")]
    pub version: u32,

    /// Height of the block in the chain, genesis is 0
    pub height: u64,

    /// Producer wall clock, in seconds since the epoch
    pub timestamp: i64,

    /// Header hash of the previous block
    pub previous_hash: String,

    /// Merkle root over `transactions`
    pub merkle_root: String,

    /// Required leading zero hex nibbles of the header hash
    pub difficulty: u32,

    /// Proof of work
    pub nonce: u64,

    /// Address credited with the reward
    pub miner: Address,

    /// Amount minted by this block
    pub reward: u64,

    /// Ordered transactions, the coinbase first
    pub transactions: Vec<Transaction>,

    /// Header hash (calculated)
    pub hash: String,
}

/// Default version for blocks
fn default_version() -> u32 {
    1
}

/// Header fields with everything but the nonce already absorbed
#[derive(Clone)]
pub struct HeaderTemplate {
    state: Sha256,
}

impl HeaderTemplate {
    /// Header digest for a candidate nonce
    #[inline]
    pub fn hash_with_nonce(&self, nonce: u64) -> [u8; 32] {
        let mut hasher = self.state.clone();
        hasher.update(nonce.to_le_bytes());
        hasher.finalize().into()
    }
}

/// Counts leading zero hex nibbles of a digest
pub fn leading_zero_nibbles(hash: &[u8]) -> u32 {
    let mut count = 0;
    for byte in hash {
        if *byte == 0 {
            count += 2;
            continue;
        }
        if byte >> 4 == 0 {
            count += 1;
        }
        break;
    }
    count
}

/// Whether a digest satisfies `difficulty`
#[inline]
pub fn meets_difficulty(hash: &[u8], difficulty: u32) -> bool {
    leading_zero_nibbles(hash) >= difficulty
}

impl Block {
    /// Creates an unmined block (nonce 0) over `transactions`
    pub fn new(
        height: u64,
        timestamp: i64,
        previous_hash: String,
        difficulty: u32,
        miner: Address,
        reward: u64,
        transactions: Vec<Transaction>,
    ) -> Self {
        let block = Block {
            version: default_version(),
            height,
            timestamp,
            previous_hash,
            merkle_root: merkle_root_hex(&transactions),
            difficulty,
            nonce: 0,
            miner,
            reward,
            transactions,
            hash: String::new(),
        };

        let hash = block.calculate_hash();
        Block { hash, ..block }
    }

    /// Pre-absorbs every header field except the nonce
    pub fn template(&self) -> HeaderTemplate {
        let mut state = Sha256::new();
        state.update(self.version.to_le_bytes());
        state.update(self.height.to_le_bytes());
        state.update(self.timestamp.to_le_bytes());
        absorb_field(&mut state, self.previous_hash.as_bytes());
        absorb_field(&mut state, self.merkle_root.as_bytes());
        state.update(self.difficulty.to_le_bytes());
        absorb_field(&mut state, self.miner.0.as_bytes());
        state.update(self.reward.to_le_bytes());
        HeaderTemplate { state }
    }

    /// Header digest for the current nonce
    pub fn header_hash(&self) -> [u8; 32] {
        self.template().hash_with_nonce(self.nonce)
    }

    /// Calculates the hash of the block as a hexadecimal string
    pub fn calculate_hash(&self) -> String {
        hex::encode(self.header_hash())
    }

    /// Fixes the nonce found by the search and refreshes the cached hash
    pub fn seal(mut self, nonce: u64) -> Self {
        self.nonce = nonce;
        self.hash = self.calculate_hash();
        self
    }

    /// Whether the header hash satisfies the block's own difficulty
    pub fn meets_own_difficulty(&self) -> bool {
        meets_difficulty(&self.header_hash(), self.difficulty)
    }

    /// The reward transaction, if the block starts with one
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinbase())
    }

    /// Sum of fees paid by the non-coinbase transactions
    pub fn total_fees(&self) -> u64 {
        self.transactions
            .iter()
            .filter(|tx| !tx.is_coinbase())
            .map(|tx| tx.fee)
            .fold(0u64, u64::saturating_add)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> Block {
        let transactions = vec![
            Transaction::new_coinbase(Address("miner".to_string()), 50, 1, 1_700_000_000),
            Transaction::new(Address("a".into()), Address("b".into()), 10, 2, 1),
        ];
        Block::new(1, 1_700_000_000, GENESIS_PREVIOUS_HASH.to_string(), 1, Address("miner".into()), 50, transactions)
    }

    #[test]
    fn test_new_block() {
        let block = sample_block();

        assert_eq!(block.height, 1);
        assert_eq!(block.nonce, 0);
        assert_eq!(block.hash.len(), 64);
        assert_eq!(block.merkle_root, merkle_root_hex(&block.transactions));
        assert_eq!(block.total_fees(), 2);
        assert!(block.coinbase().is_some());
    }

    #[test]
    fn test_hash_covers_nonce_and_fields() {
        let block = sample_block();
        let sealed = block.clone().seal(7);
        assert_ne!(block.hash, sealed.hash);
        assert_eq!(sealed.hash, sealed.calculate_hash());

        let mut other = block.clone();
        other.reward += 1;
        assert_ne!(block.calculate_hash(), other.calculate_hash());
    }

    #[test]
    fn test_template_matches_full_hash() {
        let block = sample_block().seal(42);
        assert_eq!(block.template().hash_with_nonce(42), block.header_hash());
    }

    #[test]
    fn test_leading_zero_nibbles() {
        assert_eq!(leading_zero_nibbles(&[0xff, 0x00]), 0);
        assert_eq!(leading_zero_nibbles(&[0x0f, 0x00]), 1);
        assert_eq!(leading_zero_nibbles(&[0x00, 0x10]), 2);
        assert_eq!(leading_zero_nibbles(&[0x00, 0x01]), 3);
        assert_eq!(leading_zero_nibbles(&[0x00; 32]), 64);

        assert!(meets_difficulty(&[0x00, 0x0a], 3));
        assert!(!meets_difficulty(&[0x00, 0x1a], 3));
        assert!(meets_difficulty(&[0xff], 0));
    }
}
