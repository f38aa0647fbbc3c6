//! Pluggable block production and validation.
//!
//! The chain only talks to [`Consensus`]: it asks for a proof check, a block
//! weight for fork choice and the reward the coinbase must pay. Producers use
//! the same object to prepare and seal candidates.

pub mod pos;
pub mod pow;
pub mod validator;

use crate::core::block::{Block, ConsensusProof, Header};
use crate::core::params::{ChainParams, ConsensusParams};
use crate::core::state::WorldState;
use crate::crypto::key_pair::PrivateKey;
use crate::types::address::Address;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use thiserror::Error;

pub use pos::ProofOfStake;
pub use pow::ProofOfWork;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsensusError {
    #[error("block carries a {found} proof, chain expects {expected}")]
    WrongProofKind {
        expected: &'static str,
        found: &'static str,
    },
    #[error("difficulty {got} does not match required {expected}")]
    WrongDifficulty { expected: u32, got: u32 },
    #[error("hash has {actual} leading zero bits, {required} required")]
    InsufficientWork { required: u32, actual: u32 },
    #[error("no eligible validator")]
    NoEligibleValidator,
    #[error("validator {got} is not the selected proposer {expected}")]
    WrongValidator { expected: Address, got: Address },
    #[error("validator {0} is slashed")]
    SlashedValidator(Address),
    #[error("invalid block seal signature")]
    InvalidSignature,
    #[error("coinbase sender {coinbase} is not the proposer {proposer}")]
    CoinbaseMismatch { proposer: Address, coinbase: Address },
    #[error("sealing cancelled")]
    Cancelled,
}

/// Chain context a proof is checked or produced against.
#[derive(Clone, Copy, Debug)]
pub struct ProofContext<'a> {
    pub chain_id: u64,
    /// Header of the parent block.
    pub parent: &'a Header,
    /// World state after the parent block.
    pub parent_state: &'a WorldState,
    /// Ancestors newest first, starting with the parent. At least
    /// [`Consensus::history_window`] long unless the chain is shorter.
    pub ancestors: &'a [Header],
}

impl ProofContext<'_> {
    /// Height of the block being checked or produced.
    pub fn height(&self) -> u64 {
        self.parent.index + 1
    }
}

pub trait Consensus: Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Number of ancestor headers the proof rules look at.
    fn history_window(&self) -> usize {
        1
    }

    /// Checks the block's consensus proof against its parent.
    fn verify_proof(&self, block: &Block, ctx: &ProofContext<'_>) -> Result<(), ConsensusError>;

    /// Contribution of a verified header to its branch's total weight.
    fn block_weight(&self, header: &Header, ctx: &ProofContext<'_>) -> u128;

    /// Amount the coinbase of a block produced by `producer` must pay.
    fn block_reward(&self, producer: &Address, ctx: &ProofContext<'_>) -> u128;

    /// Validator to credit with the proposal, if the mechanism tracks one.
    fn proposer(&self, _header: &Header) -> Option<Address> {
        None
    }

    /// Unsealed proof for a new block on top of `ctx.parent`.
    fn prepare(
        &self,
        producer: &PrivateKey,
        ctx: &ProofContext<'_>,
    ) -> Result<ConsensusProof, ConsensusError>;

    /// Completes the proof of a fully built header. May run for a long time
    /// (mining) and must return `Cancelled` soon after `cancel` is set.
    fn seal(
        &self,
        header: &mut Header,
        producer: &PrivateKey,
        chain_id: u64,
        cancel: &AtomicBool,
    ) -> Result<(), ConsensusError>;
}

pub(crate) fn proof_kind(proof: &ConsensusProof) -> &'static str {
    match proof {
        ConsensusProof::Genesis => "genesis",
        ConsensusProof::Work { .. } => "work",
        ConsensusProof::Stake { .. } => "stake",
    }
}

/// Builds the engine selected by `params`.
pub fn from_params(params: &ChainParams) -> Arc<dyn Consensus> {
    match &params.consensus {
        ConsensusParams::Work(work) => Arc::new(ProofOfWork::new(work.clone())),
        ConsensusParams::Stake(stake) => Arc::new(ProofOfStake::new(stake.clone())),
    }
}
