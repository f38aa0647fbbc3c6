//! Proof of work: leading-zero-bit puzzles over the block hash.

use crate::consensus::{Consensus, ConsensusError, ProofContext, proof_kind};
use crate::core::block::{Block, ConsensusProof, Header};
use crate::core::params::WorkParams;
use crate::crypto::key_pair::PrivateKey;
use crate::types::address::Address;
use crate::types::hash::HashBuilder;
use crate::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};

/// Largest difficulty a 256-bit hash can satisfy.
pub const MAX_DIFFICULTY: u32 = 255;

/// Nonces tried between cancellation checks.
const CANCEL_CHECK_INTERVAL: u64 = 1024;

/// Returns the difficulty in a header's work proof.
pub fn difficulty_of(header: &Header) -> Option<u32> {
    match header.proof {
        ConsensusProof::Work { difficulty, .. } => Some(difficulty),
        _ => None,
    }
}

/// Checks that the header's hash meets the difficulty it claims.
///
/// One hash; mining is the expensive side.
pub fn verify(header: &Header, chain_id: u64) -> bool {
    match difficulty_of(header) {
        Some(difficulty) => header.hash(chain_id).leading_zero_bits() >= difficulty,
        None => false,
    }
}

/// Searches nonces `start, start + step, ...` until one meets `difficulty`,
/// the space is exhausted or one of the `stop` flags is raised.
fn search(
    prefix: &HashBuilder,
    difficulty: u32,
    start: u64,
    step: u64,
    stop: [&AtomicBool; 2],
) -> Option<u64> {
    let mut nonce = start;
    let mut tried = 0u64;
    loop {
        if Header::hash_with_nonce(prefix, nonce).leading_zero_bits() >= difficulty {
            return Some(nonce);
        }
        tried += 1;
        if tried % CANCEL_CHECK_INTERVAL == 0 && stop.iter().any(|f| f.load(Ordering::Relaxed)) {
            return None;
        }
        nonce = nonce.checked_add(step)?;
    }
}

/// Finds a nonce giving `header` at least `difficulty` leading zero bits.
///
/// The header's proof is replaced by a work proof at `difficulty`; the
/// returned nonce completes it. `None` only if all 2^64 nonces fail.
pub fn mine(header: &Header, difficulty: u32, chain_id: u64) -> Option<u64> {
    mine_parallel(header, difficulty, chain_id, 1, &AtomicBool::new(false))
}

/// [`mine`] split across `threads` workers with cooperative cancellation.
///
/// Returns `None` when `cancel` is raised before a nonce is found.
pub fn mine_parallel(
    header: &Header,
    difficulty: u32,
    chain_id: u64,
    threads: usize,
    cancel: &AtomicBool,
) -> Option<u64> {
    let mut candidate = header.clone();
    candidate.proof = ConsensusProof::Work {
        difficulty,
        nonce: 0,
    };
    let prefix = candidate.work_prefix(chain_id)?;
    let threads = threads.max(1) as u64;
    let found = AtomicBool::new(false);

    let results: Vec<Option<u64>> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..threads)
            .map(|start| {
                let prefix = &prefix;
                let found = &found;
                scope.spawn(move || {
                    let nonce = search(prefix, difficulty, start, threads, [cancel, found]);
                    if nonce.is_some() {
                        found.store(true, Ordering::Relaxed);
                    }
                    nonce
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| worker.join().ok().flatten())
            .collect()
    });

    if cancel.load(Ordering::Relaxed) && !found.load(Ordering::Relaxed) {
        return None;
    }
    // Smallest winner keeps the result independent of thread scheduling
    // whenever several workers finish in the same round.
    results.into_iter().flatten().min()
}

/// Block subsidy at `height`, halving every `halving_interval` blocks.
pub fn subsidy(params: &WorkParams, height: u64) -> u128 {
    if params.halving_interval == 0 {
        return params.initial_subsidy;
    }
    let halvings = height / params.halving_interval;
    if halvings >= 128 {
        return 0;
    }
    params.initial_subsidy >> halvings
}

/// Difficulty the block after `ancestors[0]` must carry.
///
/// Every `retarget_interval` blocks the average spacing over the last
/// interval is compared to the target: faster than half moves difficulty up
/// by one bit, slower than double moves it down by one, floored at
/// `min_difficulty`.
pub fn required_difficulty(params: &WorkParams, ancestors: &[Header]) -> u32 {
    let Some(parent) = ancestors.first() else {
        return params.initial_difficulty;
    };
    let current = difficulty_of(parent).unwrap_or(params.initial_difficulty);
    let interval = params.retarget_interval;
    let height = parent.index + 1;
    if interval == 0 || height % interval != 0 {
        return current;
    }
    let Some(oldest) = usize::try_from(interval).ok().and_then(|i| ancestors.get(i)) else {
        return current;
    };
    let average = parent.timestamp.saturating_sub(oldest.timestamp) / interval;
    let target = params.target_block_time_secs;
    if average < target / 2 {
        (current + 1).min(MAX_DIFFICULTY)
    } else if average > target.saturating_mul(2) {
        current.saturating_sub(1).max(params.min_difficulty)
    } else {
        current
    }
}

#[derive(Debug, Clone)]
pub struct ProofOfWork {
    params: WorkParams,
}

impl ProofOfWork {
    pub fn new(params: WorkParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &WorkParams {
        &self.params
    }
}

impl Consensus for ProofOfWork {
    fn name(&self) -> &'static str {
        "work"
    }

    fn history_window(&self) -> usize {
        usize::try_from(self.params.retarget_interval)
            .unwrap_or(usize::MAX)
            .saturating_add(1)
    }

    fn verify_proof(&self, block: &Block, ctx: &ProofContext<'_>) -> Result<(), ConsensusError> {
        let header = &block.header;
        let Some(got) = difficulty_of(header) else {
            return Err(ConsensusError::WrongProofKind {
                expected: "work",
                found: proof_kind(&header.proof),
            });
        };
        let expected = required_difficulty(&self.params, ctx.ancestors);
        if got != expected {
            return Err(ConsensusError::WrongDifficulty { expected, got });
        }
        let actual = header.hash(ctx.chain_id).leading_zero_bits();
        if actual < got {
            return Err(ConsensusError::InsufficientWork {
                required: got,
                actual,
            });
        }
        Ok(())
    }

    fn block_weight(&self, header: &Header, _ctx: &ProofContext<'_>) -> u128 {
        difficulty_of(header).map_or(0, u128::from)
    }

    fn block_reward(&self, _producer: &Address, ctx: &ProofContext<'_>) -> u128 {
        subsidy(&self.params, ctx.height())
    }

    fn prepare(
        &self,
        _producer: &PrivateKey,
        ctx: &ProofContext<'_>,
    ) -> Result<ConsensusProof, ConsensusError> {
        Ok(ConsensusProof::Work {
            difficulty: required_difficulty(&self.params, ctx.ancestors),
            nonce: 0,
        })
    }

    fn seal(
        &self,
        header: &mut Header,
        _producer: &PrivateKey,
        chain_id: u64,
        cancel: &AtomicBool,
    ) -> Result<(), ConsensusError> {
        let Some(difficulty) = difficulty_of(header) else {
            return Err(ConsensusError::WrongProofKind {
                expected: "work",
                found: proof_kind(&header.proof),
            });
        };
        match mine_parallel(header, difficulty, chain_id, self.params.miner_threads, cancel) {
            Some(nonce) => {
                header.proof = ConsensusProof::Work { difficulty, nonce };
                info!("mined block {} at difficulty {difficulty} with nonce {nonce}", header.index);
                Ok(())
            }
            None => {
                warn!("mining of block {} cancelled", header.index);
                Err(ConsensusError::Cancelled)
            }
        }
    }
}
