//! Pending transactions awaiting block inclusion.
//!
//! Transactions are grouped per sender by nonce. Selection walks senders in
//! fee-per-gas order but only ever takes a sender's next executable nonce, so
//! a selected batch always applies cleanly in order. Duplicates are detected
//! through the hash index in O(1).

use crate::core::params::ChainParams;
use crate::core::state::WorldState;
use crate::core::transaction::{Transaction, TransactionType, TxError};
use crate::debug;
use crate::types::address::Address;
use crate::types::encoding::DecodeError;
use crate::types::hash::Hash;
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MempoolError {
    #[error("malformed transaction: {0}")]
    Decode(#[from] DecodeError),
    #[error("transaction {0} is already pooled")]
    Duplicate(Hash),
    #[error("rejected: {0}")]
    Invalid(#[from] TxError),
    #[error("nonce {got} is stale, account expects {expected}")]
    BadNonce { expected: u64, got: u64 },
    #[error("nonce {got} is more than {limit} ahead of {expected}")]
    NonceTooFar { expected: u64, got: u64, limit: usize },
    #[error("nonce {nonce} is taken by a transaction paying at least as much per gas")]
    NonceConflict { nonce: u64 },
    #[error("pool is full and the transaction pays too little to evict anything")]
    PoolFull,
}

/// Fee per unit of gas, compared exactly by cross-multiplication.
#[derive(Clone, Copy, Debug)]
pub struct FeeRate {
    fee: u128,
    gas: u64,
}

impl FeeRate {
    pub fn of(tx: &Transaction) -> Self {
        Self {
            fee: tx.fee,
            gas: tx.gas_limit.max(1),
        }
    }

    /// True if `self` beats `other` by at least `pct` percent.
    fn exceeds_by(&self, other: &FeeRate, pct: u32) -> bool {
        let lhs = self
            .fee
            .saturating_mul(u128::from(other.gas))
            .saturating_mul(100);
        let rhs = other
            .fee
            .saturating_mul(u128::from(self.gas))
            .saturating_mul(100 + u128::from(pct));
        lhs >= rhs
    }
}

impl PartialEq for FeeRate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FeeRate {}

impl Ord for FeeRate {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = self.fee.saturating_mul(u128::from(other.gas));
        let rhs = other.fee.saturating_mul(u128::from(self.gas));
        lhs.cmp(&rhs)
    }
}

impl PartialOrd for FeeRate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Selection priority: higher fee rate first, then earlier arrival.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Priority {
    rate: FeeRate,
    arrival: Reverse<u64>,
}

struct PoolEntry {
    tx: Transaction,
    priority: Priority,
}

/// Per-sender queue keyed by nonce.
struct SenderQueue {
    /// Account nonce last observed on chain.
    base_nonce: u64,
    txs: BTreeMap<u64, Hash>,
}

pub struct Mempool {
    params: ChainParams,
    entries: HashMap<Hash, PoolEntry>,
    senders: HashMap<Address, SenderQueue>,
    /// Ascending priority; the first element is the eviction candidate.
    order: BTreeSet<(Priority, Hash)>,
    next_arrival: u64,
}

impl Mempool {
    pub fn new(params: ChainParams) -> Self {
        Self {
            params,
            entries: HashMap::new(),
            senders: HashMap::new(),
            order: BTreeSet::new(),
            next_arrival: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash) -> Option<&Transaction> {
        self.entries.get(hash).map(|e| &e.tx)
    }

    /// Next nonce `sender` can use, counting its gapless pooled transactions.
    pub fn next_nonce(&self, sender: &Address, state: &WorldState) -> u64 {
        let mut nonce = state.nonce(sender);
        if let Some(queue) = self.senders.get(sender) {
            while queue.txs.contains_key(&nonce) {
                nonce += 1;
            }
        }
        nonce
    }

    /// Admits a transaction checked against the current chain `state`.
    ///
    /// Returns the transaction hash. A same-nonce transaction from the same
    /// sender is replaced only if the newcomer pays `replacement_bump_pct`
    /// percent more per gas.
    pub fn submit(&mut self, tx: Transaction, state: &WorldState) -> Result<Hash, MempoolError> {
        let hash = tx.id(self.params.chain_id);
        if self.entries.contains_key(&hash) {
            return Err(MempoolError::Duplicate(hash));
        }
        tx.check_well_formed(&self.params)?;

        let sender = tx.sender();
        let expected = state.nonce(&sender);
        if tx.nonce < expected {
            return Err(MempoolError::BadNonce {
                expected,
                got: tx.nonce,
            });
        }
        let limit = self.params.mempool.max_per_sender;
        if tx.nonce - expected >= limit as u64 {
            return Err(MempoolError::NonceTooFar {
                expected,
                got: tx.nonce,
                limit,
            });
        }
        let value = match tx.tx_type {
            TransactionType::Unstake | TransactionType::Evidence => 0,
            _ => tx.amount,
        };
        let needed = tx.fee.checked_add(value).ok_or(TxError::Overflow)?;
        let available = state.balance(&sender);
        if available < needed {
            return Err(TxError::InsufficientFunds { needed, available }.into());
        }

        let rate = FeeRate::of(&tx);
        let existing = self
            .senders
            .get(&sender)
            .and_then(|q| q.txs.get(&tx.nonce))
            .copied();
        if let Some(old_hash) = existing {
            let old_rate = self.entries.get(&old_hash).map(|e| e.priority.rate);
            let bump = self.params.mempool.replacement_bump_pct;
            if old_rate.is_some_and(|old| !rate.exceeds_by(&old, bump)) {
                return Err(MempoolError::NonceConflict { nonce: tx.nonce });
            }
            self.remove_one(&old_hash);
            debug!("replaced transaction {old_hash} with {hash}");
        } else if self.entries.len() >= self.params.mempool.capacity {
            let lowest = self.order.first().copied();
            match lowest {
                Some((priority, victim)) if rate > priority.rate => {
                    self.remove_one(&victim);
                    debug!("evicted transaction {victim} for {hash}");
                }
                _ => return Err(MempoolError::PoolFull),
            }
        }

        let priority = Priority {
            rate,
            arrival: Reverse(self.next_arrival),
        };
        self.next_arrival += 1;
        let queue = self.senders.entry(sender).or_insert_with(|| SenderQueue {
            base_nonce: expected,
            txs: BTreeMap::new(),
        });
        queue.base_nonce = queue.base_nonce.max(expected);
        queue.txs.insert(tx.nonce, hash);
        self.order.insert((priority, hash));
        self.entries.insert(hash, PoolEntry { tx, priority });
        Ok(hash)
    }

    fn remove_one(&mut self, hash: &Hash) -> Option<Transaction> {
        let entry = self.entries.remove(hash)?;
        self.order.remove(&(entry.priority, *hash));
        let sender = entry.tx.sender();
        if let Some(queue) = self.senders.get_mut(&sender) {
            if queue.txs.get(&entry.tx.nonce) == Some(hash) {
                queue.txs.remove(&entry.tx.nonce);
            }
            if queue.txs.is_empty() {
                self.senders.remove(&sender);
            }
        }
        Some(entry.tx)
    }

    /// Drops the given transactions, typically those just included in a block.
    pub fn remove(&mut self, hashes: &[Hash]) {
        for hash in hashes {
            self.remove_one(hash);
        }
    }

    /// Re-admits transactions from blocks that left the canonical chain.
    ///
    /// Anything no longer valid against `state` is dropped. Returns how many
    /// made it back in.
    pub fn requeue(&mut self, txs: Vec<Transaction>, state: &WorldState) -> usize {
        let mut accepted = 0;
        for tx in txs {
            if tx.is_coinbase() {
                continue;
            }
            if self.submit(tx, state).is_ok() {
                accepted += 1;
            }
        }
        accepted
    }

    /// Syncs sender nonces with a new tip and drops transactions it made stale.
    pub fn prune(&mut self, state: &WorldState) {
        let mut stale = Vec::new();
        for (sender, queue) in &mut self.senders {
            queue.base_nonce = state.nonce(sender);
            stale.extend(queue.txs.range(..queue.base_nonce).map(|(_, h)| *h));
        }
        for hash in stale {
            self.remove_one(&hash);
        }
    }

    /// Greedy block selection by descending fee per gas, FIFO on ties.
    ///
    /// Takes at most `max_count` transactions whose gas limits sum to at most
    /// `max_gas`, always in per-sender nonce order with no gaps. A sender
    /// whose next transaction does not fit is skipped for the rest of the
    /// pass. The pool is left unchanged.
    pub fn select_for_block(&self, max_count: usize, max_gas: u64) -> Vec<Transaction> {
        let mut heap: BinaryHeap<(Priority, Address, u64)> = BinaryHeap::new();
        for (sender, queue) in &self.senders {
            if let Some(entry) = self.entry_at(queue, queue.base_nonce) {
                heap.push((entry.priority, *sender, queue.base_nonce));
            }
        }

        let mut selected = Vec::new();
        let mut gas_left = max_gas;
        while selected.len() < max_count {
            let Some((_, sender, nonce)) = heap.pop() else {
                break;
            };
            let Some(queue) = self.senders.get(&sender) else {
                continue;
            };
            let Some(entry) = self.entry_at(queue, nonce) else {
                continue;
            };
            if entry.tx.gas_limit > gas_left {
                continue;
            }
            gas_left -= entry.tx.gas_limit;
            selected.push(entry.tx.clone());
            if let Some(next) = nonce.checked_add(1)
                && let Some(next_entry) = self.entry_at(queue, next)
            {
                heap.push((next_entry.priority, sender, next));
            }
        }
        selected
    }

    fn entry_at(&self, queue: &SenderQueue, nonce: u64) -> Option<&PoolEntry> {
        queue.txs.get(&nonce).and_then(|h| self.entries.get(h))
    }
}
