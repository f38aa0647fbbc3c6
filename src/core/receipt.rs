//! Transaction execution receipts.
//!
//! Every included transaction produces a [`Receipt`]. Their hashes form the
//! Merkle tree whose root the block header commits to as `receipts_root`.

use crate::types::address::Address;
use crate::types::hash::Hash;
use crate::types::merkle_tree::MerkleTree;
use crate::virtual_machine::vm::Word;
use borsh::{BorshDeserialize, BorshSerialize};

/// Value emitted by a contract's `LOG` instruction.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Log {
    pub contract: Address,
    pub value: Word,
}

/// Outcome of an included transaction.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum ExecutionStatus {
    Success,
    /// Execution faulted (gas, stack, call depth, bad opcode). The fee was
    /// charged and every other effect discarded.
    Failed(String),
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Receipt {
    pub tx_hash: Hash,
    pub status: ExecutionStatus,
    /// Intrinsic plus execution gas consumed by this transaction.
    pub gas_used: u64,
    /// Running total over the block up to and including this transaction.
    pub cumulative_gas_used: u64,
    /// Value returned by the outermost contract frame, zero otherwise.
    pub return_value: Word,
    pub logs: Vec<Log>,
}

impl Receipt {
    pub fn succeeded(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    /// Computes a domain-separated hash of this receipt.
    pub fn hash(&self) -> Hash {
        Hash::tagged(b"RECEIPT", self)
    }
}

/// Merkle root over receipt hashes, in block order.
pub fn receipts_root(receipts: &[Receipt]) -> Hash {
    MerkleTree::from_raw(receipts.iter().map(Receipt::hash).collect())
}
