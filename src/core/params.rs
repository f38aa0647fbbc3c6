//! Chain parameters: the typed configuration every component reads from.
//!
//! Development presets (`dev_pow`, `dev_pos`) pin every constant the tests
//! rely on, including the fork-choice finality depth.

use crate::types::address::Address;
use crate::types::hash::Hash;
use borsh::{BorshDeserialize, BorshSerialize};
use thiserror::Error;

/// Default number of canonical blocks a reorg may discard.
pub const DEFAULT_FINALITY_DEPTH: u64 = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("difficulty must be at least 1 and at most 255, got {0}")]
    Difficulty(u32),
    #[error("finality depth must be at least 1")]
    FinalityDepth,
    #[error("basis points must not exceed 10000, got {0}")]
    BasisPoints(u32),
    #[error("proof of stake requires at least one genesis validator with min stake")]
    NoValidators,
    #[error("mempool capacity must be at least 1")]
    MempoolCapacity,
    #[error("{0} must be non-zero")]
    Zero(&'static str),
}

/// Proof-of-work parameters.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct WorkParams {
    /// Leading zero bits required of block 1.
    pub initial_difficulty: u32,
    pub min_difficulty: u32,
    /// Desired spacing between blocks, used by retargeting.
    pub target_block_time_secs: u64,
    /// Blocks between difficulty adjustments. Zero disables retargeting.
    pub retarget_interval: u64,
    pub initial_subsidy: u128,
    /// Blocks between subsidy halvings. Zero means a fixed subsidy.
    pub halving_interval: u64,
    /// Worker threads used by the background miner.
    pub miner_threads: usize,
}

/// Proof-of-stake parameters.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct StakeParams {
    /// Minimum bonded stake for a validator to be eligible.
    pub min_stake: u128,
    /// Blocks between an unstake request and funds returning to balance.
    pub unbonding_period_blocks: u64,
    /// Share of stake burned on a proven double-sign, in basis points.
    pub slash_bps: u32,
    /// Proposer reward as a share of its stake, in basis points.
    pub reward_bps: u32,
}

#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub enum ConsensusParams {
    Work(WorkParams),
    Stake(StakeParams),
}

/// Fork-choice and finality parameters.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct ForkChoiceParams {
    /// Reorganizations deeper than this are refused and raised as an alert.
    pub finality_depth: u64,
}

/// Gas accounting and block size limits.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct GasParams {
    /// A transaction's fee must cover `gas_limit * min_gas_price`.
    pub min_gas_price: u128,
    /// Cap on the sum of `gas_limit` over one block.
    pub max_block_gas: u64,
    /// Cap on a single transaction's `gas_limit`.
    pub max_tx_gas: u64,
    /// Cap on non-coinbase transactions per block.
    pub max_block_txs: usize,
}

#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct MempoolParams {
    pub capacity: usize,
    pub max_per_sender: usize,
    /// Minimum fee-per-gas increase, in percent, for a same-nonce replacement.
    pub replacement_bump_pct: u32,
}

#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct GenesisAllocation {
    pub address: Address,
    pub balance: u128,
}

#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct GenesisValidator {
    pub address: Address,
    pub stake: u128,
}

#[derive(Clone, Debug, Default, BorshSerialize, BorshDeserialize)]
pub struct GenesisSpec {
    pub timestamp: u64,
    pub allocations: Vec<GenesisAllocation>,
    /// Initial bonded validators. Only meaningful under proof of stake.
    pub validators: Vec<GenesisValidator>,
}

/// Chain-wide parameters.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct ChainParams {
    /// Domain separator for signatures and hashes.
    pub chain_id: u64,
    pub consensus: ConsensusParams,
    pub fork_choice: ForkChoiceParams,
    pub gas: GasParams,
    pub mempool: MempoolParams,
    pub genesis: GenesisSpec,
}

impl ChainParams {
    fn dev(consensus: ConsensusParams, genesis: GenesisSpec) -> Self {
        Self {
            chain_id: 1337,
            consensus,
            fork_choice: ForkChoiceParams {
                finality_depth: DEFAULT_FINALITY_DEPTH,
            },
            gas: GasParams {
                min_gas_price: 1,
                max_block_gas: 10_000_000,
                max_tx_gas: 8_000_000,
                max_block_txs: 500,
            },
            mempool: MempoolParams {
                capacity: 4096,
                max_per_sender: 64,
                replacement_bump_pct: 10,
            },
            genesis,
        }
    }

    /// Proof-of-work devnet: difficulty 8, 50-unit subsidy halving every 210 000 blocks.
    pub fn dev_pow(allocations: Vec<GenesisAllocation>) -> Self {
        Self::dev(
            ConsensusParams::Work(WorkParams {
                initial_difficulty: 8,
                min_difficulty: 1,
                target_block_time_secs: 10,
                retarget_interval: 0,
                initial_subsidy: 50,
                halving_interval: 210_000,
                miner_threads: 2,
            }),
            GenesisSpec {
                timestamp: 0,
                allocations,
                validators: Vec::new(),
            },
        )
    }

    /// Proof-of-stake devnet with a 10-block unbonding period and 5% slashing.
    pub fn dev_pos(
        allocations: Vec<GenesisAllocation>,
        validators: Vec<GenesisValidator>,
    ) -> Self {
        Self::dev(
            ConsensusParams::Stake(StakeParams {
                min_stake: 100,
                unbonding_period_blocks: 10,
                slash_bps: 500,
                reward_bps: 10,
            }),
            GenesisSpec {
                timestamp: 0,
                allocations,
                validators,
            },
        )
    }

    /// Rejects parameter sets the chain cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fork_choice.finality_depth == 0 {
            return Err(ConfigError::FinalityDepth);
        }
        if self.mempool.capacity == 0 {
            return Err(ConfigError::MempoolCapacity);
        }
        if self.gas.max_block_gas == 0 {
            return Err(ConfigError::Zero("max_block_gas"));
        }
        if self.gas.max_block_txs == 0 {
            return Err(ConfigError::Zero("max_block_txs"));
        }
        match &self.consensus {
            ConsensusParams::Work(work) => {
                for d in [work.initial_difficulty, work.min_difficulty] {
                    if d == 0 || d > 255 {
                        return Err(ConfigError::Difficulty(d));
                    }
                }
                if work.miner_threads == 0 {
                    return Err(ConfigError::Zero("miner_threads"));
                }
            }
            ConsensusParams::Stake(stake) => {
                for bps in [stake.slash_bps, stake.reward_bps] {
                    if bps > 10_000 {
                        return Err(ConfigError::BasisPoints(bps));
                    }
                }
                let eligible = self
                    .genesis
                    .validators
                    .iter()
                    .any(|v| v.stake >= stake.min_stake);
                if !eligible {
                    return Err(ConfigError::NoValidators);
                }
            }
        }
        Ok(())
    }

    pub fn work(&self) -> Option<&WorkParams> {
        match &self.consensus {
            ConsensusParams::Work(w) => Some(w),
            ConsensusParams::Stake(_) => None,
        }
    }

    pub fn stake(&self) -> Option<&StakeParams> {
        match &self.consensus {
            ConsensusParams::Stake(s) => Some(s),
            ConsensusParams::Work(_) => None,
        }
    }

    /// Domain-separated digest of the parameters. Nodes with different
    /// digests are on different networks.
    pub fn hash(&self) -> Hash {
        Hash::tagged(b"CHAIN_PARAMS", self)
    }
}
