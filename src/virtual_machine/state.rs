//! State access for contract execution, plus the write-buffering overlay.
//!
//! [`ContractState`] is what the interpreter sees of the world. The VM never
//! writes to it directly: every run goes through an [`OverlayState`] whose
//! buffered writes reach the base only when the call tree returns normally.

use crate::types::address::Address;
use crate::virtual_machine::vm::Word;
use std::collections::BTreeMap;

pub trait ContractState {
    /// Code deployed at `address`, or `None` for accounts without code.
    fn code(&self, address: &Address) -> Option<Vec<u8>>;
    /// Storage slot of `contract`, zero when unset.
    fn storage_get(&self, contract: &Address, key: Word) -> Word;
    fn storage_set(&mut self, contract: &Address, key: Word, value: Word);
    fn balance(&self, address: &Address) -> u128;
    fn set_balance(&mut self, address: &Address, amount: u128);

    /// Moves `amount` between accounts. Returns `false`, changing nothing, if
    /// `from` cannot cover it or `to` would overflow.
    fn transfer(&mut self, from: &Address, to: &Address, amount: u128) -> bool {
        let from_balance = self.balance(from);
        if from_balance < amount {
            return false;
        }
        if from == to || amount == 0 {
            return true;
        }
        let Some(to_balance) = self.balance(to).checked_add(amount) else {
            return false;
        };
        self.set_balance(from, from_balance - amount);
        self.set_balance(to, to_balance);
        true
    }
}

/// Copy-on-write view over a base state.
///
/// Reads fall through to the base for anything not yet written. Dropping the
/// overlay discards every write; [`OverlayState::commit`] applies them.
pub struct OverlayState<'a, S: ContractState + ?Sized> {
    base: &'a mut S,
    storage: BTreeMap<(Address, Word), Word>,
    balances: BTreeMap<Address, u128>,
}

impl<'a, S: ContractState + ?Sized> OverlayState<'a, S> {
    pub fn new(base: &'a mut S) -> Self {
        Self {
            base,
            storage: BTreeMap::new(),
            balances: BTreeMap::new(),
        }
    }

    pub fn is_dirty(&self) -> bool {
        !self.storage.is_empty() || !self.balances.is_empty()
    }

    /// Writes every buffered change through to the base, in key order.
    pub fn commit(self) {
        for ((contract, key), value) in self.storage {
            self.base.storage_set(&contract, key, value);
        }
        for (address, balance) in self.balances {
            self.base.set_balance(&address, balance);
        }
    }
}

impl<S: ContractState + ?Sized> ContractState for OverlayState<'_, S> {
    fn code(&self, address: &Address) -> Option<Vec<u8>> {
        self.base.code(address)
    }

    fn storage_get(&self, contract: &Address, key: Word) -> Word {
        match self.storage.get(&(*contract, key)) {
            Some(value) => *value,
            None => self.base.storage_get(contract, key),
        }
    }

    fn storage_set(&mut self, contract: &Address, key: Word, value: Word) {
        self.storage.insert((*contract, key), value);
    }

    fn balance(&self, address: &Address) -> u128 {
        match self.balances.get(address) {
            Some(balance) => *balance,
            None => self.base.balance(address),
        }
    }

    fn set_balance(&mut self, address: &Address, amount: u128) {
        self.balances.insert(*address, amount);
    }
}
