use chrono::{DateTime, Utc};
use log::debug;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use std::collections::HashMap;

use super::crypto::Address;
use super::transaction::{Transaction, TransactionType};

/// Errors that can occur during account operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AccountError {
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: u64, available: u64 },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid nonce: expected {expected}, got {got}")]
    InvalidNonce { expected: u64, got: u64 },

    #[error("Balance overflow for account {0}")]
    BalanceOverflow(String),
}

/// Represents an account in the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Account {
    /// Version of the account structure
    #[serde(default = "default_version")]
    pub version: u32,

    /// The account's address
    pub address: Address,

    /// The account's balance
    pub balance: u64,

    /// Number of accepted transactions sent from this account
    pub nonce: u64,

    #[schema(value_type = String, example = "2023-01-01T12:00:00Z")]
    pub created: DateTime<Utc>,

    #[schema(value_type = String, example = "2023-01-01T12:00:00Z")]
    pub last_updated: DateTime<Utc>,
}

/// Default version for accounts
fn default_version() -> u32 {
    1
}

impl Account {
    /// Creates an empty account
    pub fn new(address: Address) -> Self {
        let now = Utc::now();
        Account {
            version: default_version(),
            address,
            balance: 0,
            nonce: 0,
            created: now,
            last_updated: now,
        }
    }

    /// Increases the account's balance
    pub fn deposit(&mut self, amount: u64) -> Result<(), AccountError> {
        if amount == 0 {
            return Err(AccountError::InvalidAmount("Amount must be positive".to_string()));
        }

        self.balance = self
            .balance
            .checked_add(amount)
            .ok_or_else(|| AccountError::BalanceOverflow(self.address.0.clone()))?;
        self.last_updated = Utc::now();
        Ok(())
    }

    /// Decreases the account's balance
    pub fn withdraw(&mut self, amount: u64) -> Result<(), AccountError> {
        if amount == 0 {
            return Err(AccountError::InvalidAmount("Amount must be positive".to_string()));
        }

        if self.balance < amount {
            return Err(AccountError::InsufficientBalance {
                required: amount,
                available: self.balance,
            });
        }

        self.balance -= amount;
        self.last_updated = Utc::now();
        Ok(())
    }

    /// Increments the account's nonce
    pub fn increment_nonce(&mut self) {
        self.nonce += 1;
        self.last_updated = Utc::now();
    }

    /// Sequence number the next transaction from this account must carry
    pub fn next_nonce(&self) -> u64 {
        self.nonce + 1
    }
}

/// Supply movement caused by applying transactions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEffect {
    /// Amount created by coinbase transactions
    pub minted: u64,

    /// Fees removed from circulation
    pub burned: u64,

    /// Fees credited to a fee recipient
    pub fees_paid: u64,
}

impl LedgerEffect {
    fn absorb(&mut self, other: LedgerEffect) {
        self.minted = self.minted.saturating_add(other.minted);
        self.burned = self.burned.saturating_add(other.burned);
        self.fees_paid = self.fees_paid.saturating_add(other.fees_paid);
    }
}

/// Staged changes over a borrowed account map. Nothing reaches the ledger
/// until the caller merges `touched`.
struct Overlay<'a> {
    base: &'a HashMap<Address, Account>,
    touched: HashMap<Address, Account>,
}

impl<'a> Overlay<'a> {
    fn new(base: &'a HashMap<Address, Account>) -> Self {
        Overlay {
            base,
            touched: HashMap::new(),
        }
    }

    fn get(&self, address: &Address) -> Option<&Account> {
        self.touched.get(address).or_else(|| self.base.get(address))
    }

    fn get_mut(&mut self, address: &Address) -> &mut Account {
        let base = self.base;
        self.touched
            .entry(address.clone())
            .or_insert_with(|| base.get(address).cloned().unwrap_or_else(|| Account::new(address.clone())))
    }

    /// Runs `op`; on failure the listed addresses are put back as they were
    fn atomically<T>(
        &mut self,
        addresses: &[&Address],
        op: impl FnOnce(&mut Self) -> Result<T, AccountError>,
    ) -> Result<T, AccountError> {
        let saved: Vec<(Address, Option<Account>)> = addresses
            .iter()
            .map(|addr| ((*addr).clone(), self.touched.get(*addr).cloned()))
            .collect();

        let result = op(self);
        if result.is_err() {
            for (addr, prior) in saved {
                match prior {
                    Some(account) => {
                        self.touched.insert(addr, account);
                    }
                    None => {
                        self.touched.remove(&addr);
                    }
                }
            }
        }
        result
    }

    /// Debits `amount + fee` from `from`, credits `amount` to `to` and routes the fee
    fn move_value(
        &mut self,
        from: &Address,
        to: &Address,
        amount: u64,
        fee: u64,
        fee_recipient: Option<&Address>,
    ) -> Result<LedgerEffect, AccountError> {
        let total = amount
            .checked_add(fee)
            .ok_or_else(|| AccountError::InvalidAmount("Amount plus fee overflows".to_string()))?;

        let available = self.get(from).map_or(0, |account| account.balance);
        if available < total {
            return Err(AccountError::InsufficientBalance {
                required: total,
                available,
            });
        }

        if total > 0 {
            self.get_mut(from).withdraw(total)?;
        }
        if amount > 0 {
            self.get_mut(to).deposit(amount)?;
        }

        let mut effect = LedgerEffect::default();
        if fee > 0 {
            match fee_recipient {
                Some(recipient) => {
                    self.get_mut(recipient).deposit(fee)?;
                    effect.fees_paid = fee;
                }
                None => effect.burned = fee,
            }
        }

        Ok(effect)
    }

    fn process(&mut self, tx: &Transaction, fee_recipient: Option<&Address>) -> Result<LedgerEffect, AccountError> {
        if tx.is_coinbase() {
            if tx.amount > 0 {
                self.get_mut(&tx.to).deposit(tx.amount)?;
            } else {
                self.get_mut(&tx.to);
            }
            return Ok(LedgerEffect {
                minted: tx.amount,
                ..LedgerEffect::default()
            });
        }

        if tx.from.is_coinbase() || tx.tx_type == TransactionType::Reward {
            return Err(AccountError::InvalidAmount(format!(
                "transaction {} mints outside the coinbase",
                tx.id
            )));
        }
        if tx.tx_type == TransactionType::Transfer && tx.amount == 0 {
            return Err(AccountError::InvalidAmount("Transfer amount must be positive".to_string()));
        }

        let expected = self.get(&tx.from).map_or(0, |account| account.nonce) + 1;
        if tx.nonce != expected {
            return Err(AccountError::InvalidNonce {
                expected,
                got: tx.nonce,
            });
        }

        let effect = self.move_value(&tx.from, &tx.to, tx.amount, tx.fee, fee_recipient)?;
        self.get_mut(&tx.from).increment_nonce();
        Ok(effect)
    }

    fn process_atomically(
        &mut self,
        tx: &Transaction,
        fee_recipient: Option<&Address>,
    ) -> Result<LedgerEffect, AccountError> {
        let mut involved = vec![&tx.from, &tx.to];
        if let Some(recipient) = fee_recipient {
            involved.push(recipient);
        }
        self.atomically(&involved, |overlay| overlay.process(tx, fee_recipient))
    }
}

/// Holds per-address balance and nonce state.
///
/// Every mutation takes the write lock for its whole duration; queries share
/// the read lock.
#[derive(Debug, Default)]
pub struct Ledger {
    accounts: RwLock<HashMap<Address, Account>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `op` against a staged overlay under the write lock and merges it on success
    fn mutate<T>(&self, op: impl FnOnce(&mut Overlay<'_>) -> Result<T, AccountError>) -> Result<T, AccountError> {
        let mut accounts = self.accounts.write();
        let (touched, value) = {
            let mut overlay = Overlay::new(&accounts);
            let value = op(&mut overlay)?;
            (overlay.touched, value)
        };
        accounts.extend(touched);
        Ok(value)
    }

    /// Returns the existing account or inserts an empty one
    pub fn create_account(&self, address: &Address) -> Account {
        let mut accounts = self.accounts.write();
        accounts
            .entry(address.clone())
            .or_insert_with(|| Account::new(address.clone()))
            .clone()
    }

    /// Increases a balance; the nonce is untouched
    pub fn credit(&self, address: &Address, amount: u64) -> Result<Account, AccountError> {
        self.mutate(|overlay| {
            let account = overlay.get_mut(address);
            account.deposit(amount)?;
            Ok(account.clone())
        })
    }

    /// Decreases a balance, failing if it would go negative
    pub fn debit(&self, address: &Address, amount: u64) -> Result<Account, AccountError> {
        self.mutate(|overlay| {
            let account = overlay.get_mut(address);
            account.withdraw(amount)?;
            Ok(account.clone())
        })
    }

    /// Moves `amount` from `from` to `to` and burns `fee`; all or nothing
    pub fn transfer(&self, from: &Address, to: &Address, amount: u64, fee: u64) -> Result<LedgerEffect, AccountError> {
        if amount == 0 {
            return Err(AccountError::InvalidAmount("Transfer amount must be positive".to_string()));
        }
        self.mutate(|overlay| overlay.move_value(from, to, amount, fee, None))
    }

    /// Applies one transaction with the fee burned.
    ///
    /// Non-coinbase transactions must carry the sender's next nonce; the nonce
    /// advances only when the transfer succeeds.
    pub fn process_transaction(&self, tx: &Transaction) -> Result<LedgerEffect, AccountError> {
        self.mutate(|overlay| overlay.process(tx, None))
    }

    /// Applies a block's transactions as one unit.
    ///
    /// `commit` receives the final state of every touched account while the
    /// write lock is still held; if it fails, or any transaction fails, the
    /// ledger is left exactly as it was.
    pub fn apply_block<E, F>(
        &self,
        transactions: &[Transaction],
        fee_recipient: Option<&Address>,
        commit: F,
    ) -> Result<LedgerEffect, E>
    where
        E: From<AccountError>,
        F: FnOnce(&[Account]) -> Result<(), E>,
    {
        let mut accounts = self.accounts.write();

        let (touched, effect) = {
            let mut overlay = Overlay::new(&accounts);
            let mut effect = LedgerEffect::default();
            for tx in transactions {
                let tx_effect = overlay.process(tx, fee_recipient).map_err(|err| {
                    debug!("Transaction {} failed during block application: {}", tx.id, err);
                    err
                })?;
                effect.absorb(tx_effect);
            }
            (overlay.touched, effect)
        };

        let mut changed: Vec<Account> = touched.values().cloned().collect();
        changed.sort_by(|a, b| a.address.cmp(&b.address));
        commit(&changed)?;

        accounts.extend(touched);
        Ok(effect)
    }

    /// Dry run used when assembling a block: keeps the in-order subsequence of
    /// `transactions` that applies cleanly and reports the rest.
    pub fn select_applicable(
        &self,
        transactions: &[Transaction],
        fee_recipient: Option<&Address>,
    ) -> (Vec<Transaction>, Vec<(Transaction, AccountError)>) {
        let accounts = self.accounts.read();
        let mut overlay = Overlay::new(&accounts);

        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        for tx in transactions {
            match overlay.process_atomically(tx, fee_recipient) {
                Ok(_) => accepted.push(tx.clone()),
                Err(err) => rejected.push((tx.clone(), err)),
            }
        }

        (accepted, rejected)
    }

    /// Looks up an account without creating it
    pub fn account(&self, address: &Address) -> Result<Account, AccountError> {
        self.accounts
            .read()
            .get(address)
            .cloned()
            .ok_or_else(|| AccountError::AccountNotFound(address.0.clone()))
    }

    /// Balance of `address`, zero for unknown accounts
    pub fn balance(&self, address: &Address) -> u64 {
        self.accounts.read().get(address).map_or(0, |account| account.balance)
    }

    /// Nonce the next transaction from `address` must carry
    pub fn next_nonce(&self, address: &Address) -> u64 {
        self.accounts.read().get(address).map_or(0, |account| account.nonce) + 1
    }

    /// Snapshot of every account, ordered by address
    pub fn accounts(&self) -> Vec<Account> {
        let mut accounts: Vec<Account> = self.accounts.read().values().cloned().collect();
        accounts.sort_by(|a, b| a.address.cmp(&b.address));
        accounts
    }

    /// Sum of all balances
    pub fn total_supply(&self) -> u64 {
        self.accounts
            .read()
            .values()
            .map(|account| account.balance)
            .fold(0u64, u64::saturating_add)
    }

    pub fn len(&self) -> usize {
        self.accounts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn addr(s: &str) -> Address {
        Address(s.to_string())
    }

    fn funded(address: &str, amount: u64) -> Ledger {
        let ledger = Ledger::new();
        ledger.credit(&addr(address), amount).unwrap();
        ledger
    }

    #[test]
    fn test_account_creation_is_idempotent() {
        let ledger = Ledger::new();
        let first = ledger.create_account(&addr("alice"));
        ledger.credit(&addr("alice"), 10).unwrap();
        let second = ledger.create_account(&addr("alice"));

        assert_eq!(first.balance, 0);
        assert_eq!(first.nonce, 0);
        assert_eq!(second.balance, 10);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_deposit_and_withdraw() {
        let mut account = Account::new(addr("test_address"));

        account.deposit(100).unwrap();
        assert_eq!(account.balance, 100);

        account.withdraw(50).unwrap();
        assert_eq!(account.balance, 50);

        assert!(matches!(account.withdraw(100), Err(AccountError::InsufficientBalance { .. })));
        assert!(matches!(account.deposit(0), Err(AccountError::InvalidAmount(_))));
    }

    #[test]
    fn test_unknown_account_reads_as_zero() {
        let ledger = Ledger::new();
        assert_eq!(ledger.balance(&addr("ghost")), 0);
        assert!(matches!(ledger.account(&addr("ghost")), Err(AccountError::AccountNotFound(_))));
        assert_eq!(ledger.next_nonce(&addr("ghost")), 1);
    }

    #[test]
    fn test_transfer_burns_fee() {
        let ledger = funded("A", 1000);
        ledger.credit(&addr("B"), 5).unwrap();
        let supply_before = ledger.total_supply();

        let effect = ledger.transfer(&addr("A"), &addr("B"), 600, 50).unwrap();

        assert_eq!(ledger.balance(&addr("A")), 350);
        assert_eq!(ledger.balance(&addr("B")), 605);
        assert_eq!(effect.burned, 50);
        assert_eq!(ledger.total_supply(), supply_before - 50);
    }

    #[test]
    fn test_failed_transfer_leaves_accounts_unchanged() {
        let ledger = funded("A", 100);

        let result = ledger.transfer(&addr("A"), &addr("B"), 90, 20);
        assert_eq!(
            result,
            Err(AccountError::InsufficientBalance { required: 110, available: 100 })
        );
        assert_eq!(ledger.balance(&addr("A")), 100);
        assert!(ledger.account(&addr("B")).is_err());

        assert!(matches!(ledger.transfer(&addr("A"), &addr("B"), 0, 1), Err(AccountError::InvalidAmount(_))));
    }

    #[test]
    fn test_debit_insufficient_balance() {
        let ledger = funded("A", 10);
        assert!(matches!(ledger.debit(&addr("A"), 11), Err(AccountError::InsufficientBalance { .. })));
        assert_eq!(ledger.debit(&addr("A"), 4).unwrap().balance, 6);
    }

    #[test]
    fn test_process_transaction_enforces_nonce_sequence() {
        let ledger = funded("A", 100);

        let tx = Transaction::new(addr("A"), addr("B"), 10, 1, 1);
        ledger.process_transaction(&tx).unwrap();
        assert_eq!(ledger.account(&addr("A")).unwrap().nonce, 1);
        assert_eq!(ledger.balance(&addr("A")), 89);

        // Replaying the same nonce fails and moves nothing
        let replay = Transaction::new(addr("A"), addr("B"), 10, 1, 1);
        assert_eq!(
            ledger.process_transaction(&replay),
            Err(AccountError::InvalidNonce { expected: 2, got: 1 })
        );
        assert_eq!(ledger.balance(&addr("A")), 89);
        assert_eq!(ledger.balance(&addr("B")), 10);

        let skipped = Transaction::new(addr("A"), addr("B"), 10, 1, 3);
        assert!(matches!(ledger.process_transaction(&skipped), Err(AccountError::InvalidNonce { .. })));
    }

    #[test]
    fn test_failed_transfer_does_not_advance_nonce() {
        let ledger = funded("A", 5);
        let tx = Transaction::new(addr("A"), addr("B"), 10, 0, 1);

        assert!(ledger.process_transaction(&tx).is_err());
        assert_eq!(ledger.account(&addr("A")).unwrap().nonce, 0);
    }

    #[test]
    fn test_coinbase_only_credits_recipient() {
        let ledger = Ledger::new();
        let coinbase = Transaction::new_coinbase(addr("miner"), 50, 0, 0);

        let effect = ledger.process_transaction(&coinbase).unwrap();

        assert_eq!(effect.minted, 50);
        assert_eq!(ledger.balance(&addr("miner")), 50);
        assert!(ledger.account(&Address::coinbase()).is_err());
    }

    #[test]
    fn test_apply_block_is_all_or_nothing() {
        let ledger = funded("A", 100);
        let txs = vec![
            Transaction::new_coinbase(addr("miner"), 50, 1, 0),
            Transaction::new(addr("A"), addr("B"), 60, 0, 1),
            Transaction::new(addr("A"), addr("B"), 60, 0, 2),
        ];

        let result: Result<LedgerEffect, AccountError> = ledger.apply_block(&txs, None, |_| Ok(()));
        assert!(matches!(result, Err(AccountError::InsufficientBalance { .. })));
        assert_eq!(ledger.balance(&addr("A")), 100);
        assert_eq!(ledger.balance(&addr("miner")), 0);
        assert_eq!(ledger.account(&addr("A")).unwrap().nonce, 0);
    }

    #[test]
    fn test_apply_block_rolls_back_when_commit_fails() {
        let ledger = Ledger::new();
        let txs = vec![Transaction::new_coinbase(addr("miner"), 50, 0, 0)];

        let result: Result<LedgerEffect, AccountError> =
            ledger.apply_block(&txs, None, |_| Err(AccountError::InvalidAmount("disk full".to_string())));
        assert!(result.is_err());
        assert_eq!(ledger.total_supply(), 0);
    }

    #[test]
    fn test_apply_block_routes_fees_and_reports_touched_accounts() {
        let ledger = funded("A", 100);
        let txs = vec![
            Transaction::new_coinbase(addr("miner"), 50, 1, 0),
            Transaction::new(addr("A"), addr("B"), 10, 5, 1),
        ];

        let mut seen = Vec::new();
        let effect: LedgerEffect = ledger
            .apply_block::<AccountError, _>(&txs, Some(&addr("miner")), |accounts| {
                seen = accounts.iter().map(|a| a.address.0.clone()).collect();
                Ok(())
            })
            .unwrap();

        assert_eq!(effect, LedgerEffect { minted: 50, burned: 0, fees_paid: 5 });
        assert_eq!(ledger.balance(&addr("miner")), 55);
        assert_eq!(ledger.balance(&addr("A")), 85);
        assert_eq!(seen, vec!["A", "B", "miner"]);
    }

    #[test]
    fn test_select_applicable_skips_failing_transactions() {
        let ledger = funded("A", 100);
        let txs = vec![
            Transaction::new(addr("A"), addr("B"), 60, 0, 1),
            Transaction::new(addr("A"), addr("B"), 60, 0, 2),
            Transaction::new(addr("A"), addr("B"), 30, 0, 2),
        ];

        let (accepted, rejected) = ledger.select_applicable(&txs, None);

        assert_eq!(accepted.len(), 2);
        assert_eq!(accepted[1].amount, 30);
        assert_eq!(rejected.len(), 1);
        assert!(matches!(rejected[0].1, AccountError::InsufficientBalance { .. }));
        // dry run leaves the ledger alone
        assert_eq!(ledger.balance(&addr("A")), 100);
    }

    #[test]
    fn test_concurrent_transfers_never_overdraw() {
        let ledger = Arc::new(funded("A", 1000));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    let to = Address(format!("R{}", i));
                    let mut ok = 0u64;
                    for _ in 0..50 {
                        if ledger.transfer(&addr("A"), &to, 7, 1).is_ok() {
                            ok += 1;
                        }
                        assert!(ledger.balance(&addr("A")) <= 1000);
                    }
                    ok
                })
            })
            .collect();

        let succeeded: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(succeeded, 1000 / 8);
        assert_eq!(ledger.balance(&addr("A")), 1000 - succeeded * 8);
        assert_eq!(ledger.total_supply(), 1000 - succeeded);
    }
}
