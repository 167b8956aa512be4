//! In-memory account storage using DashMap for concurrent access

use borsh::{BorshDeserialize, BorshSerialize};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// 32-byte account address
#[derive(
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
)]
pub struct Address(pub [u8; 32]);

impl Address {
    /// Deterministic address for a human-readable name (tests, genesis)
    pub fn from_label(label: &str) -> Self {
        Self(*blake3::hash(label.as_bytes()).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Account {
    pub balance: u64,
    pub nonce: u64,
}

/// Thread-safe in-memory account storage
///
/// Readers (status endpoints, tests) can look at balances while the
/// reconciliation task owns all writes.
#[derive(Clone, Default)]
pub struct AccountStore {
    accounts: Arc<DashMap<Address, Account>>,
}

impl AccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_account(&self, address: &Address) -> Option<Account> {
        self.accounts.get(address).map(|r| r.value().clone())
    }

    pub fn store_account(&self, address: Address, account: Account) {
        self.accounts.insert(address, account);
    }

    pub fn remove_account(&self, address: &Address) -> Option<Account> {
        self.accounts.remove(address).map(|(_, v)| v)
    }

    pub fn account_exists(&self, address: &Address) -> bool {
        self.accounts.contains_key(address)
    }

    /// Balance of an account (0 if it doesn't exist)
    pub fn balance(&self, address: &Address) -> u64 {
        self.accounts.get(address).map(|a| a.balance).unwrap_or(0)
    }

    /// Next nonce an account must use (0 if it doesn't exist)
    pub fn nonce(&self, address: &Address) -> u64 {
        self.accounts.get(address).map(|a| a.nonce).unwrap_or(0)
    }

    /// All accounts, ordered by address
    pub fn sorted_accounts(&self) -> Vec<(Address, Account)> {
        let mut accounts: Vec<_> = self
            .accounts
            .iter()
            .map(|r| (*r.key(), r.value().clone()))
            .collect();
        accounts.sort_by_key(|(address, _)| *address);
        accounts
    }

    /// Hash of every account, independent of insertion order
    pub fn state_digest(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        for (address, account) in self.sorted_accounts() {
            hasher.update(address.as_bytes());
            hasher.update(&account.balance.to_le_bytes());
            hasher.update(&account.nonce.to_le_bytes());
        }
        *hasher.finalize().as_bytes()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn clear(&self) {
        self.accounts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_and_get() {
        let store = AccountStore::new();
        let owner = Address::from_label("Owner");
        store.store_account(
            owner,
            Account {
                balance: 1000,
                nonce: 3,
            },
        );

        assert_eq!(store.balance(&owner), 1000);
        assert_eq!(store.nonce(&owner), 3);
        assert_eq!(store.balance(&Address::from_label("Nobody")), 0);
    }

    #[test]
    fn test_digest_ignores_insertion_order() {
        let a = Address::from_label("a");
        let b = Address::from_label("b");

        let first = AccountStore::new();
        first.store_account(a, Account { balance: 1, nonce: 0 });
        first.store_account(b, Account { balance: 2, nonce: 0 });

        let second = AccountStore::new();
        second.store_account(b, Account { balance: 2, nonce: 0 });
        second.store_account(a, Account { balance: 1, nonce: 0 });

        assert_eq!(first.state_digest(), second.state_digest());

        second.store_account(a, Account { balance: 5, nonce: 0 });
        assert_ne!(first.state_digest(), second.state_digest());
    }

    #[test]
    fn test_address_display_is_base58() {
        let address = Address([0u8; 32]);
        assert_eq!(address.to_string(), "11111111111111111111111111111111");
        assert_eq!(Address::from_label("x"), Address::from_label("x"));
    }
}
