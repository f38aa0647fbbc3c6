//! World state: accounts plus the validator registry, and its commitment.
//!
//! The chain keeps one immutable [`WorldState`] per recent block. Execution
//! never mutates a state in place: transactions run on a [`StateOverlay`]
//! and hand back a [`StateDelta`] that the block executor folds into a fresh
//! copy.

use crate::consensus::validator::ValidatorSet;
use crate::core::account::Account;
use crate::core::params::ChainParams;
use crate::core::receipt::{ExecutionStatus, Log};
use crate::types::address::Address;
use crate::types::hash::Hash;
use crate::virtual_machine::state::ContractState;
use crate::virtual_machine::vm::Word;
use sparse_merkle_tree::blake2b::Blake2bHasher;
use sparse_merkle_tree::default_store::DefaultStore;
use sparse_merkle_tree::traits::Value;
use sparse_merkle_tree::{H256, SparseMerkleTree};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("state commitment failed: {0}")]
    Commitment(String),
    #[error("invalid genesis: {0}")]
    Genesis(String),
}

/// Leaf of the state tree: the digest of an account or of the validator set.
#[derive(Default, Clone)]
pub struct StateLeaf(pub Hash);

impl Value for StateLeaf {
    fn to_h256(&self) -> H256 {
        H256::from(self.0.0)
    }

    fn zero() -> Self {
        Self(Hash::zero())
    }
}

type StateTree = SparseMerkleTree<Blake2bHasher, StateLeaf, DefaultStore<StateLeaf>>;

fn h256_to_hash(h256: &H256) -> Hash {
    Hash::from_slice(h256.as_slice()).unwrap_or_else(Hash::zero)
}

fn account_key(address: &Address) -> H256 {
    H256::from(Hash::tagged(b"ACCT", address).0)
}

fn validators_key() -> H256 {
    H256::from(Hash::sha3().chain(b"VALIDATOR_SET").finalize().0)
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorldState {
    accounts: BTreeMap<Address, Account>,
    validators: ValidatorSet,
}

impl WorldState {
    /// Builds the genesis state: funded accounts and, under proof of stake,
    /// the initial bonded validators. Genesis stake is minted, not debited.
    pub fn genesis(params: &ChainParams) -> Result<Self, StateError> {
        let mut state = WorldState::default();
        for alloc in &params.genesis.allocations {
            let account = state.accounts.entry(alloc.address).or_default();
            account.balance = account
                .balance
                .checked_add(alloc.balance)
                .ok_or_else(|| StateError::Genesis(format!("balance overflow for {}", alloc.address)))?;
        }
        if params.stake().is_some() {
            for v in &params.genesis.validators {
                state
                    .validators
                    .bond(v.address, v.stake)
                    .map_err(StateError::Genesis)?;
            }
        }
        Ok(state)
    }

    pub fn account(&self, address: &Address) -> Option<&Account> {
        self.accounts.get(address)
    }

    pub fn balance(&self, address: &Address) -> u128 {
        self.accounts.get(address).map_or(0, Account::balance)
    }

    /// Next nonce the account must use.
    pub fn nonce(&self, address: &Address) -> u64 {
        self.accounts.get(address).map_or(0, Account::nonce)
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    pub fn accounts(&self) -> impl Iterator<Item = (&Address, &Account)> {
        self.accounts.iter()
    }

    /// Folds a transaction's changes into this state. Accounts that end up
    /// empty are removed so that equal states have equal roots.
    pub fn apply_delta(&mut self, delta: StateDelta) {
        for (address, account) in delta.accounts {
            if account.is_empty() {
                self.accounts.remove(&address);
            } else {
                self.accounts.insert(address, account);
            }
        }
        if let Some(validators) = delta.validators {
            self.validators = validators;
        }
    }

    /// Sparse-Merkle root over every account digest plus the validator set.
    pub fn state_root(&self) -> Result<Hash, StateError> {
        let mut leaves: Vec<(H256, StateLeaf)> = self
            .accounts
            .iter()
            .map(|(address, account)| (account_key(address), StateLeaf(account.value_hash())))
            .collect();
        if !self.validators.is_empty() {
            leaves.push((validators_key(), StateLeaf(self.validators.digest())));
        }

        let mut tree = StateTree::new(H256::zero(), DefaultStore::default());
        tree.update_all(leaves)
            .map_err(|e| StateError::Commitment(format!("{e:?}")))?;
        Ok(h256_to_hash(tree.root()))
    }

    /// Accounts that differ from `parent`; `None` marks a removed account.
    pub fn changed_accounts(&self, parent: &WorldState) -> Vec<(Address, Option<Account>)> {
        let mut changes = Vec::new();
        for (address, account) in &self.accounts {
            if parent.accounts.get(address) != Some(account) {
                changes.push((*address, Some(account.clone())));
            }
        }
        for address in parent.accounts.keys() {
            if !self.accounts.contains_key(address) {
                changes.push((*address, None));
            }
        }
        changes
    }
}

/// What one transaction did: touched accounts plus its execution outcome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateDelta {
    pub accounts: BTreeMap<Address, Account>,
    pub validators: Option<ValidatorSet>,
    pub status: ExecutionStatus,
    /// Intrinsic plus execution gas.
    pub gas_used: u64,
    pub return_value: Word,
    pub logs: Vec<Log>,
}

/// Copy-on-write view over a [`WorldState`].
///
/// Cloning an overlay is the checkpoint mechanism: the executor clones before
/// running a transaction body and falls back to the clone if the body faults.
#[derive(Clone)]
pub struct StateOverlay<'a> {
    base: &'a WorldState,
    accounts: BTreeMap<Address, Account>,
    validators: Option<ValidatorSet>,
}

impl<'a> StateOverlay<'a> {
    pub fn new(base: &'a WorldState) -> Self {
        Self {
            base,
            accounts: BTreeMap::new(),
            validators: None,
        }
    }

    pub fn account(&self, address: &Address) -> Option<&Account> {
        self.accounts
            .get(address)
            .or_else(|| self.base.account(address))
    }

    pub fn account_mut(&mut self, address: &Address) -> &mut Account {
        let base = self.base;
        self.accounts
            .entry(*address)
            .or_insert_with(|| base.account(address).cloned().unwrap_or_default())
    }

    pub fn nonce(&self, address: &Address) -> u64 {
        self.account(address).map_or(0, Account::nonce)
    }

    pub fn validators(&self) -> &ValidatorSet {
        self.validators.as_ref().unwrap_or(&self.base.validators)
    }

    pub fn validators_mut(&mut self) -> &mut ValidatorSet {
        let base = self.base;
        self.validators
            .get_or_insert_with(|| base.validators.clone())
    }

    /// Adds `amount` to a balance, failing on overflow.
    pub fn credit(&mut self, address: &Address, amount: u128) -> Option<()> {
        let account = self.account_mut(address);
        account.balance = account.balance.checked_add(amount)?;
        Some(())
    }

    /// Removes `amount` from a balance, failing if it is not covered.
    pub fn debit(&mut self, address: &Address, amount: u128) -> Option<()> {
        let account = self.account_mut(address);
        account.balance = account.balance.checked_sub(amount)?;
        Some(())
    }

    pub fn into_delta(
        self,
        status: ExecutionStatus,
        gas_used: u64,
        return_value: Word,
        logs: Vec<Log>,
    ) -> StateDelta {
        StateDelta {
            accounts: self.accounts,
            validators: self.validators,
            status,
            gas_used,
            return_value,
            logs,
        }
    }
}

impl ContractState for StateOverlay<'_> {
    fn code(&self, address: &Address) -> Option<Vec<u8>> {
        self.account(address)
            .filter(|a| a.is_contract())
            .map(|a| a.code().to_vec())
    }

    fn storage_get(&self, contract: &Address, key: Word) -> Word {
        self.account(contract).map_or(0, |a| a.storage(key))
    }

    fn storage_set(&mut self, contract: &Address, key: Word, value: Word) {
        self.account_mut(contract).set_storage(key, value);
    }

    fn balance(&self, address: &Address) -> u128 {
        self.account(address).map_or(0, Account::balance)
    }

    fn set_balance(&mut self, address: &Address, amount: u128) {
        self.account_mut(address).balance = amount;
    }
}
