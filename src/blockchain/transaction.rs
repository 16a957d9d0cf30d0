use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use super::crypto::{Address, CryptoError, DigitalSignature, SignatureVerifier, Wallet};

/// Errors that can occur during transaction operations
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid sender address: {0}")]
    InvalidSenderAddress(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Transaction already signed")]
    AlreadySigned,

    #[error("Transaction not signed")]
    NotSigned,

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
}

/// Kind of value movement a transaction performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Transfer,
    Reward,
    /// Moves value to a contract address; execution happens outside the ledger
    Contract,
}

impl TransactionType {
    fn tag(self) -> u8 {
        match self {
            TransactionType::Transfer => 0,
            TransactionType::Reward => 1,
            TransactionType::Contract => 2,
        }
    }
}

/// Represents a transaction in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Transaction {
    /// Version of the transaction structure
    #[serde(default = "default_version")]
    pub version: u32,

    /// Unique identifier for the transaction
    pub id: String,

    /// Sender's address
    pub from: Address,

    /// Recipient's address
    pub to: Address,

    /// Amount being transferred
    pub amount: u64,

    /// Transaction fee
    pub fee: u64,

    /// Per-sender sequence number, the first transaction of an account uses 1
    pub nonce: u64,

    #[serde(rename = "type")]
    pub tx_type: TransactionType,

    /// Digital signature of the transaction
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<DigitalSignature>,

    /// Timestamp when the transaction was created
    #[schema(value_type = String, example = "2023-01-01T12:00:00Z")]
    pub timestamp: DateTime<Utc>,
}

/// Default version for transactions
fn default_version() -> u32 {
    1
}

/// Absorbs a variable-length field so adjacent fields cannot alias each other
pub(crate) fn absorb_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

impl Transaction {
    /// Creates a new unsigned transfer
    pub fn new(from: Address, to: Address, amount: u64, fee: u64, nonce: u64) -> Self {
        Transaction {
            version: default_version(),
            id: Uuid::new_v4().to_string(),
            from,
            to,
            amount,
            fee,
            nonce,
            tx_type: TransactionType::Transfer,
            signature: None,
            timestamp: Utc::now(),
        }
    }

    /// Creates a new unsigned contract call carrying `amount` to the contract address
    pub fn new_contract_call(from: Address, contract: Address, amount: u64, fee: u64, nonce: u64) -> Self {
        Transaction {
            tx_type: TransactionType::Contract,
            ..Transaction::new(from, contract, amount, fee, nonce)
        }
    }

    /// Creates the reward transaction of the block at `height`.
    ///
    /// The id and timestamp derive from the block, so rebuilding the same
    /// block yields the same coinbase.
    pub fn new_coinbase(recipient: Address, amount: u64, height: u64, block_timestamp: i64) -> Self {
        Transaction {
            version: default_version(),
            id: format!("coinbase-{}", height),
            from: Address::coinbase(),
            to: recipient,
            amount,
            fee: 0,
            nonce: 0,
            tx_type: TransactionType::Reward,
            signature: None,
            timestamp: DateTime::<Utc>::from_timestamp(block_timestamp, 0).unwrap_or_default(),
        }
    }

    /// Canonical digest of the transaction, excluding the signature
    pub fn hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.version.to_le_bytes());
        absorb_field(&mut hasher, self.id.as_bytes());
        absorb_field(&mut hasher, self.from.0.as_bytes());
        absorb_field(&mut hasher, self.to.0.as_bytes());
        hasher.update(self.amount.to_le_bytes());
        hasher.update(self.fee.to_le_bytes());
        hasher.update(self.nonce.to_le_bytes());
        absorb_field(&mut hasher, self.timestamp.to_rfc3339().as_bytes());
        hasher.update([self.tx_type.tag()]);
        hasher.finalize().into()
    }

    /// Signs the transaction with a wallet
    pub fn sign(&mut self, wallet: &Wallet) -> Result<(), TransactionError> {
        if self.signature.is_some() {
            return Err(TransactionError::AlreadySigned);
        }

        if wallet.address() != &self.from {
            return Err(TransactionError::InvalidSenderAddress(
                "Wallet address does not match sender address".to_string(),
            ));
        }

        self.signature = Some(wallet.sign(&self.hash()));
        Ok(())
    }

    /// Checks the signature through the supplied capability
    pub fn verify_signature(&self, verifier: &dyn SignatureVerifier) -> Result<bool, TransactionError> {
        let signature = self.signature.as_ref().ok_or(TransactionError::NotSigned)?;
        Ok(verifier.verify(&self.from, &self.hash(), signature)?)
    }

    /// Checks if the transaction is a coinbase transaction
    pub fn is_coinbase(&self) -> bool {
        self.from.is_coinbase() && self.tx_type == TransactionType::Reward
    }

    /// Amount plus fee, `None` on overflow
    pub fn total_debit(&self) -> Option<u64> {
        self.amount.checked_add(self.fee)
    }

    /// Stateless checks applied before a transaction reaches the ledger
    pub fn validate_basic(&self) -> Result<(), TransactionError> {
        match self.tx_type {
            TransactionType::Reward => {
                if !self.from.is_coinbase() {
                    return Err(TransactionError::InvalidSenderAddress(
                        "Reward transactions must come from coinbase".to_string(),
                    ));
                }
                if self.fee != 0 {
                    return Err(TransactionError::InvalidAmount("Reward transactions carry no fee".to_string()));
                }
            }
            TransactionType::Transfer | TransactionType::Contract => {
                if self.from.is_coinbase() {
                    return Err(TransactionError::InvalidSenderAddress(
                        "Only reward transactions may come from coinbase".to_string(),
                    ));
                }
                if self.tx_type == TransactionType::Transfer && self.amount == 0 {
                    return Err(TransactionError::InvalidAmount("Transfer amount must be positive".to_string()));
                }
                if self.total_debit().is_none() {
                    return Err(TransactionError::InvalidAmount("Amount plus fee overflows".to_string()));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::Ed25519Verifier;

    #[test]
    fn test_new_transaction() {
        let sender_wallet = Wallet::new();
        let recipient_wallet = Wallet::new();

        let transaction = Transaction::new(
            sender_wallet.address().clone(),
            recipient_wallet.address().clone(),
            105,
            1,
            1,
        );

        assert_eq!(transaction.from, *sender_wallet.address());
        assert_eq!(transaction.to, *recipient_wallet.address());
        assert_eq!(transaction.amount, 105);
        assert_eq!(transaction.tx_type, TransactionType::Transfer);
        assert!(!transaction.id.is_empty());
        assert!(transaction.signature.is_none());
    }

    #[test]
    fn test_sign_transaction() {
        let sender_wallet = Wallet::new();
        let recipient_wallet = Wallet::new();

        let mut transaction = Transaction::new(
            sender_wallet.address().clone(),
            recipient_wallet.address().clone(),
            10,
            1,
            1,
        );

        transaction.sign(&sender_wallet).unwrap();
        assert!(transaction.verify_signature(&Ed25519Verifier).unwrap());

        // Signing twice is refused
        assert!(matches!(transaction.sign(&sender_wallet), Err(TransactionError::AlreadySigned)));

        // Tampering breaks the signature
        transaction.amount = 11;
        assert!(!transaction.verify_signature(&Ed25519Verifier).unwrap());
    }

    #[test]
    fn test_sign_with_foreign_wallet_fails() {
        let sender_wallet = Wallet::new();
        let other_wallet = Wallet::new();
        let mut transaction = Transaction::new(sender_wallet.address().clone(), Address("bob".into()), 1, 0, 1);

        assert!(transaction.sign(&other_wallet).is_err());
    }

    #[test]
    fn test_coinbase_transaction() {
        let transaction = Transaction::new_coinbase(Address("miner".to_string()), 50, 7, 1_700_000_000);

        assert_eq!(transaction.from, Address::coinbase());
        assert_eq!(transaction.id, "coinbase-7");
        assert_eq!(transaction.fee, 0);
        assert!(transaction.is_coinbase());
        assert!(transaction.validate_basic().is_ok());

        let again = Transaction::new_coinbase(Address("miner".to_string()), 50, 7, 1_700_000_000);
        assert_eq!(transaction.hash(), again.hash());
    }

    #[test]
    fn test_validate_basic_rejects_zero_transfer() {
        let tx = Transaction::new(Address("a".into()), Address("b".into()), 0, 1, 1);
        assert!(matches!(tx.validate_basic(), Err(TransactionError::InvalidAmount(_))));

        let call = Transaction::new_contract_call(Address("a".into()), Address("c".into()), 0, 1, 1);
        assert!(call.validate_basic().is_ok());
    }

    #[test]
    fn test_hash_excludes_signature() {
        let wallet = Wallet::new();
        let mut tx = Transaction::new(wallet.address().clone(), Address("b".into()), 5, 0, 1);
        let before = tx.hash();
        tx.sign(&wallet).unwrap();
        assert_eq!(before, tx.hash());
    }
}
