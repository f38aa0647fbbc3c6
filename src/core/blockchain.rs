//! Chain state machine: block validation, fork choice and reorganization.
//!
//! Every block ever accepted lives in an arena indexed by hash; the canonical
//! branch is an index by height into that arena. Recent blocks keep an
//! immutable snapshot of their post-state, so switching branches rebuilds
//! state from the common ancestor instead of undoing changes in place.

use crate::consensus::validator::DoubleSignEvidence;
use crate::consensus::{self, Consensus, ConsensusError, ProofContext};
use crate::core::block::{Block, BlockError, Commitments, Header, build_block};
use crate::core::executor::{BlockExecutor, BlockOutcome, ExecutionEnv, execute_block};
use crate::core::params::{ChainParams, ConfigError};
use crate::core::receipt::{Receipt, receipts_root};
use crate::core::state::{StateError, WorldState};
use crate::core::transaction::{Transaction, TxError};
use crate::crypto::key_pair::PrivateKey;
use crate::storage::kv::{BatchEntry, KeyValueStore, StorageError, keys};
use crate::types::address::Address;
use crate::types::encoding::{DecodeError, Encode};
use crate::types::hash::Hash;
use crate::{debug, info, warn};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// Lifecycle of a chain instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStatus {
    /// No block yet; only a matching genesis block is accepted.
    Empty,
    /// Genesis accepted, nothing on top of it.
    Genesis,
    Active,
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("malformed block: {0}")]
    Decode(#[from] DecodeError),
    #[error("chain is empty, the first block must be genesis")]
    NoGenesis,
    #[error("genesis mismatch: expected {expected}, got {got}")]
    GenesisMismatch { expected: Hash, got: Hash },
    #[error("block {0} is already known")]
    AlreadyKnown(Hash),
    #[error("parent block {0} is unknown")]
    UnknownParent(Hash),
    #[error("block index {got} does not follow parent index {parent}")]
    InvalidIndex { parent: u64, got: u64 },
    #[error("timestamp {got} is earlier than parent timestamp {parent}")]
    TimestampBeforeParent { parent: u64, got: u64 },
    #[error("invalid block: {0}")]
    InvalidBlock(BlockError),
    #[error("merkle root mismatch: header has {claimed}, transactions give {computed}")]
    MerkleRootMismatch { claimed: Hash, computed: Hash },
    #[error("invalid consensus proof: {0}")]
    InvalidProof(#[from] ConsensusError),
    #[error("state root mismatch: header has {claimed}, execution gives {computed}")]
    StateRootMismatch { claimed: Hash, computed: Hash },
    #[error("receipts root mismatch: header has {claimed}, execution gives {computed}")]
    ReceiptRootMismatch { claimed: Hash, computed: Hash },
    #[error("gas used mismatch: header has {claimed}, execution gives {computed}")]
    GasUsedMismatch { claimed: u64, computed: u64 },
    #[error("reorganization of {depth} blocks exceeds finality depth {limit}: possible 51% attack")]
    DeepReorg { depth: u64, limit: u64 },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<BlockError> for ChainError {
    fn from(error: BlockError) -> Self {
        match error {
            BlockError::MerkleRootMismatch { claimed, computed } => {
                ChainError::MerkleRootMismatch { claimed, computed }
            }
            other => ChainError::InvalidBlock(other),
        }
    }
}

struct ChainEntry {
    block: Arc<Block>,
    hash: Hash,
    parent: Option<usize>,
    /// Sum of block weights from genesis through this block.
    total_weight: u128,
    /// Post-state; dropped once buried deeper than the finality depth.
    state: Option<Arc<WorldState>>,
    receipts: Arc<Vec<Receipt>>,
}

impl ChainEntry {
    fn height(&self) -> u64 {
        self.block.index()
    }
}

/// A block that passed every check against its parent, ready to commit.
pub struct ValidatedBlock {
    hash: Hash,
    parent: Option<usize>,
    total_weight: u128,
    state: WorldState,
    receipts: Vec<Receipt>,
}

impl ValidatedBlock {
    pub fn hash(&self) -> Hash {
        self.hash
    }

    pub fn total_weight(&self) -> u128 {
        self.total_weight
    }

    pub fn state(&self) -> &WorldState {
        &self.state
    }
}

/// What appending a block did to the canonical chain.
#[derive(Debug, Clone, Default)]
pub struct ChainUpdate {
    pub hash: Hash,
    /// Set when the canonical tip moved.
    pub new_tip: Option<Arc<Block>>,
    /// Canonical blocks discarded by a reorganization; zero for an extension.
    pub reorg_depth: u64,
    /// Ids of user transactions that became canonical.
    pub included: Vec<Hash>,
    /// User transactions from blocks that left the canonical chain, oldest first.
    pub reverted: Vec<Transaction>,
    /// Two distinct blocks sealed by one validator at the same height.
    pub equivocation: Option<DoubleSignEvidence>,
}

/// Read-only view of the canonical tip.
#[derive(Debug, Clone)]
pub struct ChainSnapshot {
    pub status: ChainStatus,
    pub tip: Option<Arc<Block>>,
    pub tip_hash: Hash,
    pub height: u64,
    pub total_weight: u128,
    pub state: Arc<WorldState>,
}

/// Canonical index change planned by a branch switch.
struct Switch {
    /// Canonical heights below this stay.
    keep: usize,
    /// Entries to append above `keep`, newest first.
    branch: Vec<usize>,
    update: ChainUpdate,
}

/// Block assembled on a parent, with a proof that still has to be sealed.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub block: Block,
    /// Transactions left out, with the reason.
    pub excluded: Vec<(Hash, TxError)>,
}

pub struct Blockchain {
    params: ChainParams,
    consensus: Arc<dyn Consensus>,
    store: Arc<dyn KeyValueStore>,
    entries: Vec<ChainEntry>,
    by_hash: HashMap<Hash, usize>,
    /// Arena index of the canonical block at each height.
    canonical: Vec<usize>,
    /// First header seen per (height, proposer), for equivocation detection.
    proposals: BTreeMap<(u64, Address), Header>,
    /// Arena indices, by height, of entries still holding a state snapshot.
    retained: BTreeMap<u64, Vec<usize>>,
}

impl Blockchain {
    /// Creates an empty chain; the first appended block must be genesis.
    pub fn new(params: ChainParams, store: Arc<dyn KeyValueStore>) -> Result<Self, ChainError> {
        params.validate()?;
        let consensus = consensus::from_params(&params);
        Ok(Self {
            params,
            consensus,
            store,
            entries: Vec::new(),
            by_hash: HashMap::new(),
            canonical: Vec::new(),
            proposals: BTreeMap::new(),
            retained: BTreeMap::new(),
        })
    }

    /// Creates a chain and appends the genesis block derived from `params`.
    pub fn with_genesis(
        params: ChainParams,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Self, ChainError> {
        let mut chain = Self::new(params, store)?;
        let genesis = chain.genesis_block()?;
        chain.append(genesis)?;
        Ok(chain)
    }

    /// The genesis block every node on this chain must share.
    pub fn genesis_block(&self) -> Result<Block, ChainError> {
        let state_root = WorldState::genesis(&self.params)?.state_root()?;
        Ok(Block::genesis(&self.params, state_root))
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn consensus(&self) -> &Arc<dyn Consensus> {
        &self.consensus
    }

    pub fn status(&self) -> ChainStatus {
        match self.canonical.len() {
            0 => ChainStatus::Empty,
            1 => ChainStatus::Genesis,
            _ => ChainStatus::Active,
        }
    }

    fn tip_entry(&self) -> Option<&ChainEntry> {
        self.canonical.last().map(|&i| &self.entries[i])
    }

    pub fn tip(&self) -> Option<Arc<Block>> {
        self.tip_entry().map(|e| e.block.clone())
    }

    pub fn tip_hash(&self) -> Option<Hash> {
        self.tip_entry().map(|e| e.hash)
    }

    pub fn height(&self) -> u64 {
        self.tip_entry().map_or(0, ChainEntry::height)
    }

    pub fn total_weight(&self) -> u128 {
        self.tip_entry().map_or(0, |e| e.total_weight)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn block(&self, hash: &Hash) -> Option<Arc<Block>> {
        self.by_hash.get(hash).map(|&i| self.entries[i].block.clone())
    }

    /// Canonical block at `height`.
    pub fn block_at(&self, height: u64) -> Option<Arc<Block>> {
        let i = *self.canonical.get(usize::try_from(height).ok()?)?;
        Some(self.entries[i].block.clone())
    }

    pub fn receipts(&self, hash: &Hash) -> Option<Arc<Vec<Receipt>>> {
        self.by_hash.get(hash).map(|&i| self.entries[i].receipts.clone())
    }

    /// World state at the canonical tip.
    pub fn state(&self) -> Arc<WorldState> {
        self.tip_entry()
            .and_then(|e| e.state.clone())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> ChainSnapshot {
        ChainSnapshot {
            status: self.status(),
            tip: self.tip(),
            tip_hash: self.tip_hash().unwrap_or_else(Hash::zero),
            height: self.height(),
            total_weight: self.total_weight(),
            state: self.state(),
        }
    }

    fn state_of(&self, index: usize) -> Result<Arc<WorldState>, ChainError> {
        let entry = &self.entries[index];
        entry.state.clone().ok_or_else(|| ChainError::DeepReorg {
            depth: self.height().saturating_sub(entry.height()),
            limit: self.params.fork_choice.finality_depth,
        })
    }

    /// Up to `n` headers walking back from `index`, newest first.
    fn ancestor_headers(&self, index: usize, n: usize) -> Vec<Header> {
        let mut headers = Vec::with_capacity(n);
        let mut cursor = Some(index);
        while let Some(i) = cursor {
            if headers.len() == n {
                break;
            }
            headers.push(self.entries[i].block.header.clone());
            cursor = self.entries[i].parent;
        }
        headers
    }

    /// Re-executes `block` on `ctx.parent_state` and checks every commitment
    /// its header makes about the result.
    fn replay(&self, block: &Block, ctx: &ProofContext<'_>) -> Result<BlockOutcome, ChainError> {
        let producer = block
            .coinbase()
            .map(Transaction::sender)
            .ok_or_else(|| BlockError::MalformedBlock("missing coinbase".into()))?;
        let reward = self.consensus.block_reward(&producer, ctx);
        let proposer = self.consensus.proposer(&block.header);
        let outcome = execute_block(
            ctx.parent_state,
            block,
            &self.params,
            reward,
            proposer.as_ref(),
        )?;

        let header = &block.header;
        if outcome.gas_used != header.gas_used {
            return Err(ChainError::GasUsedMismatch {
                claimed: header.gas_used,
                computed: outcome.gas_used,
            });
        }
        let computed = receipts_root(&outcome.receipts);
        if computed != header.receipts_root {
            return Err(ChainError::ReceiptRootMismatch {
                claimed: header.receipts_root,
                computed,
            });
        }
        let computed = outcome.state.state_root()?;
        if computed != header.state_root {
            return Err(ChainError::StateRootMismatch {
                claimed: header.state_root,
                computed,
            });
        }
        Ok(outcome)
    }

    /// Fully validates `block` against its parent without changing the chain.
    ///
    /// Recomputes the Merkle root, checks the consensus proof, replays every
    /// transaction on a copy of the parent state and compares the resulting
    /// roots with the header.
    pub fn propose_block(&self, block: &Block) -> Result<ValidatedBlock, ChainError> {
        let chain_id = self.params.chain_id;
        let hash = block.hash(chain_id);
        if self.by_hash.contains_key(&hash) {
            return Err(ChainError::AlreadyKnown(hash));
        }
        let header = &block.header;

        if header.is_genesis() {
            let expected = match self.canonical.first() {
                Some(&i) => self.entries[i].hash,
                None => self.genesis_block()?.hash(chain_id),
            };
            if hash != expected {
                return Err(ChainError::GenesisMismatch {
                    expected,
                    got: hash,
                });
            }
            block.check_structure(&self.params)?;
            return Ok(ValidatedBlock {
                hash,
                parent: None,
                total_weight: 0,
                state: WorldState::genesis(&self.params)?,
                receipts: Vec::new(),
            });
        }
        if self.entries.is_empty() {
            return Err(ChainError::NoGenesis);
        }

        let parent_index = *self
            .by_hash
            .get(&header.previous_hash)
            .ok_or(ChainError::UnknownParent(header.previous_hash))?;
        let parent = &self.entries[parent_index];
        if header.index != parent.height() + 1 {
            return Err(ChainError::InvalidIndex {
                parent: parent.height(),
                got: header.index,
            });
        }
        if header.timestamp < parent.block.header.timestamp {
            return Err(ChainError::TimestampBeforeParent {
                parent: parent.block.header.timestamp,
                got: header.timestamp,
            });
        }
        block.check_structure(&self.params)?;

        let parent_state = self.state_of(parent_index)?;
        let ancestors = self.ancestor_headers(parent_index, self.consensus.history_window());
        let ctx = ProofContext {
            chain_id,
            parent: &parent.block.header,
            parent_state: &parent_state,
            ancestors: &ancestors,
        };
        self.consensus.verify_proof(block, &ctx)?;
        let weight = self.consensus.block_weight(header, &ctx);
        let outcome = self.replay(block, &ctx)?;

        Ok(ValidatedBlock {
            hash,
            parent: Some(parent_index),
            total_weight: parent.total_weight.saturating_add(weight),
            state: outcome.state,
            receipts: outcome.receipts,
        })
    }

    /// Validates and stores `block`, moving the tip if its branch now wins.
    ///
    /// A branch wins on greater total weight; equal weights go to the smaller
    /// tip hash. A reorganization that would discard more than the finality
    /// depth is refused with [`ChainError::DeepReorg`]; the block itself stays
    /// stored on its side branch.
    pub fn append(&mut self, block: Block) -> Result<ChainUpdate, ChainError> {
        let validated = self.propose_block(&block)?;
        self.commit(block, validated)
    }

    /// Stores a validated block and moves the tip if its branch wins.
    ///
    /// The arena and the canonical index are only kept once the store has
    /// accepted the batch; a failed write leaves the chain as it was.
    fn commit(&mut self, block: Block, validated: ValidatedBlock) -> Result<ChainUpdate, ChainError> {
        let ValidatedBlock {
            hash,
            parent,
            total_weight,
            state,
            receipts,
        } = validated;
        let mut batch: Vec<BatchEntry> = vec![(keys::block(&hash), Some(block.to_bytes()))];

        let index = self.entries.len();
        let height = block.index();
        self.entries.push(ChainEntry {
            block: Arc::new(block),
            hash,
            parent,
            total_weight,
            state: Some(Arc::new(state)),
            receipts: Arc::new(receipts),
        });
        self.by_hash.insert(hash, index);

        let outranks = self.tip_entry().is_none_or(|tip| {
            total_weight > tip.total_weight || (total_weight == tip.total_weight && hash < tip.hash)
        });
        let switched = if outranks {
            self.switch_to(index, &mut batch).map(Some)
        } else {
            Ok(None)
        };

        if let Err(e) = self.store.batch_write(batch) {
            crate::error!("failed to persist block {hash}: {e}");
            self.entries.truncate(index);
            self.by_hash.remove(&hash);
            return Err(e.into());
        }

        let header = self.entries[index].block.header.clone();
        let equivocation = self.record_proposal(&header);
        self.retained.entry(height).or_default().push(index);

        // A refused branch stays known so it can be inspected.
        let switched = match switched {
            Ok(switched) => switched,
            Err(e) => {
                self.prune();
                return Err(e);
            }
        };
        let Some(Switch {
            keep,
            branch,
            update,
        }) = switched
        else {
            self.prune();
            debug!("stored side block {hash} at height {height}");
            return Ok(ChainUpdate {
                hash,
                equivocation,
                ..ChainUpdate::default()
            });
        };
        self.canonical.truncate(keep);
        self.canonical.extend(branch.into_iter().rev());
        self.prune();

        let tip = &self.entries[index];
        info!(
            "new tip {} at height {} with {} transactions",
            tip.hash,
            tip.height(),
            tip.block.transactions.len()
        );
        Ok(ChainUpdate {
            hash,
            new_tip: Some(tip.block.clone()),
            equivocation,
            ..update
        })
    }

    /// Plans making the branch ending at `index` canonical: rebuilds its state
    /// from the common ancestor and appends the index and state writes to
    /// `batch`. The canonical index itself is left untouched.
    fn switch_to(&mut self, index: usize, batch: &mut Vec<BatchEntry>) -> Result<Switch, ChainError> {
        // New branch back to the canonical chain, newest first.
        let mut branch = Vec::new();
        let mut cursor = Some(index);
        while let Some(i) = cursor {
            let on_chain = usize::try_from(self.entries[i].height())
                .ok()
                .and_then(|h| self.canonical.get(h))
                == Some(&i);
            if on_chain {
                break;
            }
            branch.push(i);
            cursor = self.entries[i].parent;
        }
        let ancestor = cursor;
        let keep = ancestor.map_or(0, |a| self.entries[a].height() as usize + 1);
        let depth = (self.canonical.len() - keep) as u64;
        let limit = self.params.fork_choice.finality_depth;
        if depth > limit {
            crate::error!(
                "refusing reorganization of {depth} blocks to {}: deeper than finality depth {limit}",
                self.entries[index].hash
            );
            return Err(ChainError::DeepReorg { depth, limit });
        }

        if let (true, Some(ancestor)) = (depth > 0, ancestor) {
            self.rebuild_branch(ancestor, &branch)?;
            warn!(
                "reorganized {depth} blocks above height {}",
                self.entries[ancestor].height()
            );
        }

        let old_state = self.tip_entry().and_then(|e| e.state.clone());
        let old_height = self.canonical.len();
        let mut reverted = Vec::new();
        for &i in &self.canonical[keep..] {
            reverted.extend(self.entries[i].block.user_transactions().iter().cloned());
        }

        let chain_id = self.params.chain_id;
        let mut included = Vec::new();
        for &i in branch.iter().rev() {
            let entry = &self.entries[i];
            included.extend(entry.block.user_transactions().iter().map(|tx| tx.id(chain_id)));
            batch.push((
                keys::height(entry.height()),
                Some(entry.hash.as_slice().to_vec()),
            ));
        }
        for stale in keep + branch.len()..old_height {
            batch.push((keys::height(stale as u64), None));
        }

        let new_state = self.state_of(index)?;
        let empty = WorldState::default();
        let old_state = old_state.as_deref().unwrap_or(&empty);
        for (address, account) in new_state.changed_accounts(old_state) {
            batch.push((keys::account(&address), account.map(|a| a.to_bytes())));
        }
        if new_state.validators() != old_state.validators() {
            batch.push((
                keys::VALIDATORS.to_vec(),
                Some(new_state.validators().to_bytes()),
            ));
        }
        batch.push((keys::TIP.to_vec(), Some(self.entries[index].hash.as_slice().to_vec())));

        Ok(Switch {
            keep,
            branch,
            update: ChainUpdate {
                reorg_depth: depth,
                included,
                reverted,
                ..ChainUpdate::default()
            },
        })
    }

    /// Re-validates and re-executes `branch` (newest first) on top of
    /// `ancestor`'s state, replacing each block's stored post-state.
    fn rebuild_branch(&mut self, ancestor: usize, branch: &[usize]) -> Result<(), ChainError> {
        let mut state = self.state_of(ancestor)?;
        for &i in branch.iter().rev() {
            let Some(parent) = self.entries[i].parent else {
                continue;
            };
            let block = self.entries[i].block.clone();
            let parent_header = self.entries[parent].block.header.clone();
            let ancestors = self.ancestor_headers(parent, self.consensus.history_window());
            let ctx = ProofContext {
                chain_id: self.params.chain_id,
                parent: &parent_header,
                parent_state: &state,
                ancestors: &ancestors,
            };
            self.consensus.verify_proof(&block, &ctx)?;
            let outcome = self.replay(&block, &ctx)?;
            let next = Arc::new(outcome.state);
            let entry = &mut self.entries[i];
            entry.state = Some(next.clone());
            entry.receipts = Arc::new(outcome.receipts);
            state = next;
        }
        Ok(())
    }

    /// Drops state snapshots no permitted reorganization can reach, on every
    /// branch.
    fn prune(&mut self) {
        let cutoff = self
            .height()
            .saturating_sub(self.params.fork_choice.finality_depth);
        let kept = self.retained.split_off(&cutoff);
        for i in std::mem::replace(&mut self.retained, kept).into_values().flatten() {
            self.entries[i].state = None;
        }
        self.proposals = self.proposals.split_off(&(cutoff, Address::zero()));
    }

    fn record_proposal(&mut self, header: &Header) -> Option<DoubleSignEvidence> {
        let proposer = self.consensus.proposer(header)?;
        match self.proposals.entry((header.index, proposer)) {
            Entry::Vacant(slot) => {
                slot.insert(header.clone());
                None
            }
            Entry::Occupied(slot) if slot.get() != header => {
                warn!("validator {proposer} sealed two blocks at height {}", header.index);
                Some(DoubleSignEvidence {
                    first: slot.get().clone(),
                    second: header.clone(),
                })
            }
            Entry::Occupied(_) => None,
        }
    }

    /// Assembles a block on `parent` from `transactions`, in the given order.
    ///
    /// Transactions that fail to apply or do not fit the block caps are left
    /// out and reported. The returned header carries an unsealed proof.
    pub fn build_candidate(
        &self,
        parent: &Hash,
        producer: &PrivateKey,
        transactions: Vec<Transaction>,
        timestamp: u64,
    ) -> Result<Candidate, ChainError> {
        let chain_id = self.params.chain_id;
        let parent_index = *self
            .by_hash
            .get(parent)
            .ok_or(ChainError::UnknownParent(*parent))?;
        let parent_header = &self.entries[parent_index].block.header;
        let parent_state = self.state_of(parent_index)?;
        let ancestors = self.ancestor_headers(parent_index, self.consensus.history_window());
        let ctx = ProofContext {
            chain_id,
            parent: parent_header,
            parent_state: &parent_state,
            ancestors: &ancestors,
        };

        let proof = self.consensus.prepare(producer, &ctx)?;
        let height = ctx.height();
        let timestamp = timestamp.max(parent_header.timestamp);
        let draft = Header {
            index: height,
            previous_hash: *parent,
            timestamp,
            merkle_root: Hash::zero(),
            state_root: Hash::zero(),
            receipts_root: Hash::zero(),
            gas_used: 0,
            proof: proof.clone(),
        };
        let proposer = self.consensus.proposer(&draft);

        let address = producer.address();
        let reward = self.consensus.block_reward(&address, &ctx);
        let coinbase = Transaction::coinbase(producer, address, reward, height, chain_id);
        let env = ExecutionEnv {
            params: &self.params,
            height,
            producer: address,
        };
        let mut executor = BlockExecutor::new(&parent_state, env)?;
        executor
            .push_coinbase(&coinbase, reward)
            .map_err(|error| BlockError::InvalidTransaction { index: 0, error })?;

        let mut included = vec![coinbase];
        let mut excluded = Vec::new();
        let mut gas_left = self.params.gas.max_block_gas;
        for tx in transactions {
            if included.len() > self.params.gas.max_block_txs {
                break;
            }
            if tx.gas_limit > gas_left {
                excluded.push((
                    tx.id(chain_id),
                    TxError::GasLimitTooHigh {
                        limit: tx.gas_limit,
                        max: gas_left,
                    },
                ));
                continue;
            }
            match executor.push(&tx) {
                Ok(()) => {
                    gas_left -= tx.gas_limit;
                    included.push(tx);
                }
                Err(e) => {
                    debug!("leaving {} out of block {height}: {e}", tx.id(chain_id));
                    excluded.push((tx.id(chain_id), e));
                }
            }
        }

        let outcome = executor.finish(proposer.as_ref());
        let commitments = Commitments {
            timestamp,
            state_root: outcome.state.state_root()?,
            receipts_root: receipts_root(&outcome.receipts),
            gas_used: outcome.gas_used,
        };
        let block = build_block(&self.params, height, *parent, included, proof, commitments)?;
        Ok(Candidate { block, excluded })
    }
}
