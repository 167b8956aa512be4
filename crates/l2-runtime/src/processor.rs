//! L2 Transaction Processor
//!
//! `ExecutionEngine` is what the reconciler drives: apply a payload, keep the
//! returned delta, and hand it back to `revert` if the payload turns out not
//! to be part of the anchored history.

use crate::account_store::{Account, AccountStore, Address};
use borsh::{BorshDeserialize, BorshSerialize};
use std::fmt::Debug;

/// Result of applying one payload
#[derive(Debug, Clone)]
pub struct Execution<D> {
    pub success: bool,
    /// Undo information; reverting it restores the state before `apply`
    pub delta: D,
    pub error: Option<String>,
}

/// Deterministic state machine driven by sequenced payloads
///
/// Payloads that fail still occupy their sequence number; they report
/// `success = false` and a delta that reverts to a no-op.
pub trait ExecutionEngine: Send {
    type Delta: Clone + Debug + Send;

    fn apply(&mut self, payload: &[u8]) -> Execution<Self::Delta>;

    /// Undo a previous `apply`. Deltas are reverted newest first.
    fn revert(&mut self, delta: &Self::Delta);

    /// Digest of the current state
    fn state_digest(&self) -> [u8; 32];
}

/// Transfer transaction carried as a feed payload
#[derive(BorshSerialize, BorshDeserialize, Clone, Debug, PartialEq, Eq)]
pub struct Transfer {
    pub from: Address,
    pub to: Address,
    pub amount: u64,
    /// Must equal the sender's current nonce
    pub nonce: u64,
}

impl Transfer {
    pub fn new(from: Address, to: Address, amount: u64, nonce: u64) -> Self {
        Self {
            from,
            to,
            amount,
            nonce,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("Transfer serialization should not fail")
    }

    pub fn decode(payload: &[u8]) -> Result<Self, TransferError> {
        borsh::from_slice(payload).map_err(|e| TransferError::Malformed(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("Malformed transfer: {0}")]
    Malformed(String),

    #[error("Bad nonce for {address}: expected {expected}, got {got}")]
    BadNonce {
        address: Address,
        expected: u64,
        got: u64,
    },

    #[error("Insufficient funds in {address}: balance {balance}, needed {needed}")]
    InsufficientFunds {
        address: Address,
        balance: u64,
        needed: u64,
    },
}

/// Prior state of every account a transfer touched, oldest write first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerDelta {
    previous: Vec<(Address, Option<Account>)>,
}

impl LedgerDelta {
    pub fn is_empty(&self) -> bool {
        self.previous.is_empty()
    }
}

/// Reference execution engine: balance transfers with sender nonces
pub struct TransferLedger {
    store: AccountStore,
}

impl TransferLedger {
    pub fn new(store: AccountStore) -> Self {
        Self { store }
    }

    /// Ledger seeded with initial balances
    pub fn with_genesis(balances: &[(Address, u64)]) -> Self {
        let store = AccountStore::new();
        for (address, balance) in balances {
            store.store_account(
                *address,
                Account {
                    balance: *balance,
                    nonce: 0,
                },
            );
        }
        Self::new(store)
    }

    pub fn store(&self) -> &AccountStore {
        &self.store
    }

    pub fn balance(&self, address: &Address) -> u64 {
        self.store.balance(address)
    }

    fn execute(&self, transfer: &Transfer) -> Result<LedgerDelta, TransferError> {
        let sender = self.store.get_account(&transfer.from);
        let mut updated_sender = sender.clone().unwrap_or_default();

        if updated_sender.nonce != transfer.nonce {
            return Err(TransferError::BadNonce {
                address: transfer.from,
                expected: updated_sender.nonce,
                got: transfer.nonce,
            });
        }
        if updated_sender.balance < transfer.amount {
            return Err(TransferError::InsufficientFunds {
                address: transfer.from,
                balance: updated_sender.balance,
                needed: transfer.amount,
            });
        }

        let mut delta = LedgerDelta::default();
        delta.previous.push((transfer.from, sender));
        updated_sender.balance -= transfer.amount;
        updated_sender.nonce += 1;
        self.store.store_account(transfer.from, updated_sender);

        // Read after the debit so a self-transfer nets out
        let recipient = self.store.get_account(&transfer.to);
        let mut updated_recipient = recipient.clone().unwrap_or_default();
        delta.previous.push((transfer.to, recipient));
        updated_recipient.balance = updated_recipient.balance.saturating_add(transfer.amount);
        self.store.store_account(transfer.to, updated_recipient);

        Ok(delta)
    }
}

impl ExecutionEngine for TransferLedger {
    type Delta = LedgerDelta;

    fn apply(&mut self, payload: &[u8]) -> Execution<LedgerDelta> {
        let result = Transfer::decode(payload).and_then(|transfer| self.execute(&transfer));
        match result {
            Ok(delta) => Execution {
                success: true,
                delta,
                error: None,
            },
            Err(e) => {
                tracing::debug!("Transfer failed: {}", e);
                Execution {
                    success: false,
                    delta: LedgerDelta::default(),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    fn revert(&mut self, delta: &LedgerDelta) {
        for (address, previous) in delta.previous.iter().rev() {
            match previous {
                Some(account) => self.store.store_account(*address, account.clone()),
                None => {
                    self.store.remove_account(address);
                }
            }
        }
    }

    fn state_digest(&self) -> [u8; 32] {
        self.store.state_digest()
    }
}
