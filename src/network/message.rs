//! Gossip envelope and the events a node publishes.
//!
//! Peers exchange [`Message`]s: a type tag plus the canonical encoding of a
//! block or transaction. The transport that carries them is out of scope;
//! anything that can move bytes can feed a node through
//! [`NodeHandle::receive_message`](super::server::NodeHandle::receive_message).

use crate::consensus::validator::DoubleSignEvidence;
use crate::core::block::Block;
use crate::core::transaction::Transaction;
use crate::types::encoding::Encode;
use crate::types::hash::Hash;
use borsh::{BorshDeserialize, BorshSerialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum MessageType {
    Transaction,
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Message {
    pub header: MessageType,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(header: MessageType, data: Vec<u8>) -> Message {
        Message { header, data }
    }

    pub fn transaction(tx: &Transaction) -> Message {
        Message::new(MessageType::Transaction, tx.to_bytes())
    }

    pub fn block(block: &Block) -> Message {
        Message::new(MessageType::Block, block.to_bytes())
    }
}

/// Misbehavior observed while processing peer input.
#[derive(Debug, Clone)]
pub enum Misbehavior {
    /// One validator sealed two blocks at the same height.
    Equivocation(DoubleSignEvidence),
    /// A block failed validation for a reason its producer controls.
    InvalidBlock { hash: Hash, reason: String },
}

/// Notifications published by a running node.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// The canonical tip moved, by extension or reorganization.
    NewTip {
        block: Arc<Block>,
        hash: Hash,
        reorg_depth: u64,
    },
    TransactionAccepted(Transaction),
    /// A branch would have discarded more blocks than the finality depth allows.
    SecurityAlert { block: Hash, depth: u64, limit: u64 },
    Misbehavior(Misbehavior),
}

impl NodeEvent {
    /// Gossip to relay to peers, if the event carries any.
    pub fn to_message(&self) -> Option<Message> {
        match self {
            NodeEvent::NewTip { block, .. } => Some(Message::block(block)),
            NodeEvent::TransactionAccepted(tx) => Some(Message::transaction(tx)),
            NodeEvent::SecurityAlert { .. } | NodeEvent::Misbehavior(_) => None,
        }
    }
}
