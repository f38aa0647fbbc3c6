//! Proof of stake: stake-weighted proposer selection seeded by the parent hash.

use crate::consensus::validator::ValidatorSet;
use crate::consensus::{Consensus, ConsensusError, ProofContext, proof_kind};
use crate::core::block::{Block, ConsensusProof, Header};
use crate::core::params::StakeParams;
use crate::crypto::key_pair::{PrivateKey, SerializableSignature};
use crate::types::address::Address;
use crate::types::hash::Hash;
use std::sync::atomic::AtomicBool;

const BPS_DENOMINATOR: u128 = 10_000;

/// Picks the proposer for `height` with probability proportional to stake.
///
/// The draw is `H("POS_SELECT" || seed || height) mod total_stake`, walked
/// over eligible validators in address order, so every node holding the same
/// registry and seed (the parent hash) gets the same answer.
pub fn select_validator(
    validators: &ValidatorSet,
    min_stake: u128,
    height: u64,
    seed: &Hash,
) -> Option<Address> {
    let total = validators.total_eligible_stake(min_stake);
    if total == 0 {
        return None;
    }
    let digest = Hash::sha3()
        .chain(b"POS_SELECT")
        .chain(seed)
        .chain(height.to_le_bytes())
        .finalize();
    let mut word = [0u8; 16];
    word.copy_from_slice(&digest.0[..16]);
    let draw = u128::from_le_bytes(word) % total;

    let mut cumulative = 0u128;
    for validator in validators.eligible(min_stake) {
        cumulative = cumulative.saturating_add(validator.stake);
        if draw < cumulative {
            return Some(validator.address);
        }
    }
    None
}

/// Proposer reward: `stake * reward_bps / 10_000`, at least 1 for a staked proposer.
pub fn reward(params: &StakeParams, stake: u128) -> u128 {
    if stake == 0 {
        return 0;
    }
    (stake.saturating_mul(u128::from(params.reward_bps)) / BPS_DENOMINATOR).max(1)
}

#[derive(Debug, Clone)]
pub struct ProofOfStake {
    params: StakeParams,
}

impl ProofOfStake {
    pub fn new(params: StakeParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &StakeParams {
        &self.params
    }

    /// Proposer expected on top of `ctx.parent`.
    pub fn expected_proposer(&self, ctx: &ProofContext<'_>) -> Result<Address, ConsensusError> {
        select_validator(
            ctx.parent_state.validators(),
            self.params.min_stake,
            ctx.height(),
            &ctx.parent.hash(ctx.chain_id),
        )
        .ok_or(ConsensusError::NoEligibleValidator)
    }

    /// Checks that `header` is sealed by the selected, unslashed validator and
    /// returns that validator's address.
    pub fn validate(&self, header: &Header, ctx: &ProofContext<'_>) -> Result<Address, ConsensusError> {
        let ConsensusProof::Stake {
            validator,
            signature,
        } = &header.proof
        else {
            return Err(ConsensusError::WrongProofKind {
                expected: "stake",
                found: proof_kind(&header.proof),
            });
        };
        let claimed = validator.address;
        if ctx
            .parent_state
            .validators()
            .get(&claimed)
            .is_some_and(|v| v.slashed)
        {
            return Err(ConsensusError::SlashedValidator(claimed));
        }
        let expected = self.expected_proposer(ctx)?;
        if claimed != expected {
            return Err(ConsensusError::WrongValidator {
                expected,
                got: claimed,
            });
        }
        let seal = header
            .seal_hash(ctx.chain_id)
            .ok_or(ConsensusError::InvalidSignature)?;
        if !validator.verify(seal.as_slice(), signature) {
            return Err(ConsensusError::InvalidSignature);
        }
        Ok(claimed)
    }
}

impl Consensus for ProofOfStake {
    fn name(&self) -> &'static str {
        "stake"
    }

    fn verify_proof(&self, block: &Block, ctx: &ProofContext<'_>) -> Result<(), ConsensusError> {
        let proposer = self.validate(&block.header, ctx)?;
        if let Some(coinbase) = block.coinbase() {
            if coinbase.sender() != proposer {
                return Err(ConsensusError::CoinbaseMismatch {
                    proposer,
                    coinbase: coinbase.sender(),
                });
            }
        }
        Ok(())
    }

    fn block_weight(&self, header: &Header, ctx: &ProofContext<'_>) -> u128 {
        self.proposer(header)
            .map_or(0, |p| ctx.parent_state.validators().stake_of(&p))
    }

    fn block_reward(&self, producer: &Address, ctx: &ProofContext<'_>) -> u128 {
        reward(&self.params, ctx.parent_state.validators().stake_of(producer))
    }

    fn proposer(&self, header: &Header) -> Option<Address> {
        match &header.proof {
            ConsensusProof::Stake { validator, .. } => Some(validator.address),
            _ => None,
        }
    }

    fn prepare(
        &self,
        producer: &PrivateKey,
        ctx: &ProofContext<'_>,
    ) -> Result<ConsensusProof, ConsensusError> {
        let expected = self.expected_proposer(ctx)?;
        let address = producer.address();
        if address != expected {
            return Err(ConsensusError::WrongValidator {
                expected,
                got: address,
            });
        }
        Ok(ConsensusProof::Stake {
            validator: producer.public_key(),
            signature: SerializableSignature::empty(),
        })
    }

    fn seal(
        &self,
        header: &mut Header,
        producer: &PrivateKey,
        chain_id: u64,
        _cancel: &AtomicBool,
    ) -> Result<(), ConsensusError> {
        header.proof = ConsensusProof::Stake {
            validator: producer.public_key(),
            signature: SerializableSignature::empty(),
        };
        let seal = header
            .seal_hash(chain_id)
            .ok_or(ConsensusError::InvalidSignature)?;
        header.proof = ConsensusProof::Stake {
            validator: producer.public_key(),
            signature: producer.sign(seal.as_slice()),
        };
        Ok(())
    }
}
