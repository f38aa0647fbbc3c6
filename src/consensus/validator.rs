//! Stake registry for proof of stake.
//!
//! The registry lives inside the world state, so bonding, unbonding and
//! slashing go through ordinary transactions and are covered by the state
//! root. Iteration is in address order, which keeps weighted selection
//! identical on every node.

use crate::core::block::{ConsensusProof, Header};
use crate::types::address::Address;
use crate::types::hash::Hash;
use borsh::{BorshDeserialize, BorshSerialize};
use std::collections::BTreeMap;

pub const INITIAL_REPUTATION: u8 = 50;
pub const MAX_REPUTATION: u8 = 100;
const BPS_DENOMINATOR: u128 = 10_000;

/// Stake waiting out the unbonding period.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Unbonding {
    pub amount: u128,
    /// First block height at which the amount returns to the balance.
    pub release_height: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Validator {
    pub address: Address,
    /// Bonded stake; this is the selection weight.
    pub stake: u128,
    pub unbonding: Vec<Unbonding>,
    /// 0..=100. Starts at 50, grows by one per produced block, drops to 0 on slashing.
    pub reputation: u8,
    pub blocks_produced: u64,
    /// Set once proven to have double-signed. Slashed validators are never selected.
    pub slashed: bool,
}

impl Validator {
    fn new(address: Address) -> Self {
        Self {
            address,
            stake: 0,
            unbonding: Vec::new(),
            reputation: INITIAL_REPUTATION,
            blocks_produced: 0,
            slashed: false,
        }
    }

    fn is_empty(&self) -> bool {
        self.stake == 0 && self.unbonding.is_empty() && !self.slashed
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ValidatorSet {
    validators: BTreeMap<Address, Validator>,
}

impl ValidatorSet {
    pub fn get(&self, address: &Address) -> Option<&Validator> {
        self.validators.get(address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Validator> {
        self.validators.values()
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn stake_of(&self, address: &Address) -> u128 {
        self.validators.get(address).map_or(0, |v| v.stake)
    }

    /// Adds `amount` to the stake of `address`, registering it if needed.
    pub fn bond(&mut self, address: Address, amount: u128) -> Result<(), String> {
        let validator = self
            .validators
            .entry(address)
            .or_insert_with(|| Validator::new(address));
        if validator.slashed {
            return Err(format!("validator {address} is slashed"));
        }
        validator.stake = validator
            .stake
            .checked_add(amount)
            .ok_or_else(|| "stake overflow".to_string())?;
        Ok(())
    }

    /// Moves `amount` of bonded stake into the unbonding queue.
    pub fn begin_unbond(
        &mut self,
        address: &Address,
        amount: u128,
        release_height: u64,
    ) -> Result<(), String> {
        let validator = self
            .validators
            .get_mut(address)
            .ok_or_else(|| format!("{address} is not a validator"))?;
        if validator.stake < amount {
            return Err(format!(
                "cannot unbond {amount}, only {} bonded",
                validator.stake
            ));
        }
        validator.stake -= amount;
        validator.unbonding.push(Unbonding {
            amount,
            release_height,
        });
        Ok(())
    }

    /// Removes every unbonding entry due at `height`, returning the amounts
    /// to credit per address, in address order.
    pub fn release_matured(&mut self, height: u64) -> Vec<(Address, u128)> {
        let mut released = Vec::new();
        for validator in self.validators.values_mut() {
            let mut due = 0u128;
            validator.unbonding.retain(|entry| {
                if entry.release_height <= height {
                    due = due.saturating_add(entry.amount);
                    false
                } else {
                    true
                }
            });
            if due > 0 {
                released.push((validator.address, due));
            }
        }
        self.validators.retain(|_, v| !v.is_empty());
        released
    }

    /// Burns `bps` basis points of bonded and unbonding stake, zeroes the
    /// reputation and marks the validator slashed. Returns the amount burned.
    pub fn slash(&mut self, address: &Address, bps: u32) -> Result<u128, String> {
        let validator = self
            .validators
            .get_mut(address)
            .ok_or_else(|| format!("{address} is not a validator"))?;
        if validator.slashed {
            return Err(format!("validator {address} is already slashed"));
        }
        let penalty = |amount: u128| amount.saturating_mul(u128::from(bps)) / BPS_DENOMINATOR;
        let mut burned = penalty(validator.stake);
        validator.stake -= burned;
        for entry in &mut validator.unbonding {
            let cut = penalty(entry.amount);
            entry.amount -= cut;
            burned = burned.saturating_add(cut);
        }
        validator.reputation = 0;
        validator.slashed = true;
        Ok(burned)
    }

    /// Credits a produced block to `address`.
    pub fn record_proposal(&mut self, address: &Address) {
        if let Some(validator) = self.validators.get_mut(address) {
            validator.blocks_produced += 1;
            validator.reputation = validator.reputation.saturating_add(1).min(MAX_REPUTATION);
        }
    }

    /// Validators allowed to propose: not slashed and bonded at least `min_stake`.
    pub fn eligible(&self, min_stake: u128) -> impl Iterator<Item = &Validator> {
        self.validators
            .values()
            .filter(move |v| !v.slashed && v.stake >= min_stake && v.stake > 0)
    }

    pub fn total_eligible_stake(&self, min_stake: u128) -> u128 {
        self.eligible(min_stake)
            .fold(0u128, |acc, v| acc.saturating_add(v.stake))
    }

    /// Digest committed into the state root.
    pub fn digest(&self) -> Hash {
        Hash::tagged(b"VALIDATORS", self)
    }
}

/// Two distinct headers signed by the same validator for the same height.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct DoubleSignEvidence {
    pub first: Header,
    pub second: Header,
}

impl DoubleSignEvidence {
    /// Checks the evidence and returns the offending validator's address.
    pub fn verify(&self, chain_id: u64) -> Result<Address, String> {
        if self.first.index != self.second.index {
            return Err("headers are for different heights".into());
        }
        if self.first.hash(chain_id) == self.second.hash(chain_id) {
            return Err("headers are identical".into());
        }
        let (a, b) = match (&self.first.proof, &self.second.proof) {
            (
                ConsensusProof::Stake {
                    validator: a,
                    signature: sig_a,
                },
                ConsensusProof::Stake {
                    validator: b,
                    signature: sig_b,
                },
            ) => ((a, sig_a), (b, sig_b)),
            _ => return Err("both headers must carry stake proofs".into()),
        };
        if a.0.address != b.0.address {
            return Err("headers were sealed by different validators".into());
        }
        for (header, (key, sig)) in [(&self.first, a), (&self.second, b)] {
            let seal = header
                .seal_hash(chain_id)
                .ok_or_else(|| "missing seal".to_string())?;
            if !key.verify(seal.as_slice(), sig) {
                return Err("invalid seal signature".into());
            }
        }
        Ok(a.0.address)
    }
}
