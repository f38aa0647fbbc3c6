use crate::types::hash::Hash;
use crate::virtual_machine::vm::Word;
use borsh::{BorshDeserialize, BorshSerialize};
use std::collections::BTreeMap;

/// Account state as committed in the world-state root.
///
/// Contracts are accounts with non-empty `code`. Storage slots holding zero
/// are removed so that equal logical state always encodes identically.
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Account {
    /// Number of transactions sent from this account.
    pub(crate) nonce: u64,
    pub(crate) balance: u128,
    pub(crate) code: Vec<u8>,
    pub(crate) storage: BTreeMap<Word, Word>,
}

impl Account {
    /// Creates a new externally owned account with the given balance.
    pub fn new(balance: u128) -> Self {
        Self {
            balance,
            ..Self::default()
        }
    }

    pub fn balance(&self) -> u128 {
        self.balance
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn is_contract(&self) -> bool {
        !self.code.is_empty()
    }

    pub fn storage(&self, key: Word) -> Word {
        self.storage.get(&key).copied().unwrap_or(0)
    }

    pub(crate) fn set_storage(&mut self, key: Word, value: Word) {
        if value == 0 {
            self.storage.remove(&key);
        } else {
            self.storage.insert(key, value);
        }
    }

    /// True for an account indistinguishable from one that was never touched.
    pub fn is_empty(&self) -> bool {
        self.nonce == 0 && self.balance == 0 && self.code.is_empty() && self.storage.is_empty()
    }

    /// Domain-separated digest used as the account's state-tree leaf.
    pub fn value_hash(&self) -> Hash {
        Hash::tagged(b"ACCOUNT", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_creates_eoa_with_balance() {
        let account = Account::new(1_000_000);
        assert_eq!(account.balance(), 1_000_000);
        assert_eq!(account.nonce(), 0);
        assert!(!account.is_contract());
        assert!(!account.is_empty());
        assert!(Account::default().is_empty());
    }

    #[test]
    fn zero_storage_writes_are_removed() {
        let mut account = Account::default();
        account.set_storage(4, 9);
        assert_eq!(account.storage(4), 9);
        account.set_storage(4, 0);
        assert_eq!(account.storage(4), 0);
        assert_eq!(account, Account::default());
    }

    #[test]
    fn value_hash_tracks_every_field() {
        let base = Account::new(10);
        let mut nonce = base.clone();
        nonce.nonce = 1;
        let mut code = base.clone();
        code.code = vec![0];
        let mut storage = base.clone();
        storage.set_storage(1, 1);

        let hashes = [base.value_hash(), nonce.value_hash(), code.value_hash(), storage.value_hash()];
        for i in 0..hashes.len() {
            for j in i + 1..hashes.len() {
                assert_ne!(hashes[i], hashes[j]);
            }
        }
    }
}
