//! Block and header structures.
//!
//! A header commits to its parent, the ordered transaction list (Merkle root),
//! the post-state and the receipts. The block hash covers every header field,
//! consensus proof included, under the `BLOCK_HEADER` domain and the chain id.

use crate::core::params::ChainParams;
use crate::core::transaction::{Transaction, TxError};
use crate::crypto::key_pair::{PublicKey, SerializableSignature};
use crate::types::hash::{Hash, HashBuilder};
use crate::types::merkle_tree::{MerkleProof, MerkleTree};
use borsh::{BorshDeserialize, BorshSerialize};
use std::collections::HashSet;
use thiserror::Error;

const BLOCK_HEADER_TAG: &[u8] = b"BLOCK_HEADER";
const BLOCK_SEAL_TAG: &[u8] = b"BLOCK_SEAL";
const NONCE_LEN: usize = 8;

/// Evidence that a block was produced under the active consensus rules.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum ConsensusProof {
    /// Fixed genesis proof; only valid at index 0.
    Genesis,
    /// Proof of work. `nonce` is the last field of the encoded header so miners
    /// can hash a precomputed prefix and append only the nonce.
    Work { difficulty: u32, nonce: u64 },
    /// Proof of stake: the proposer's key and its signature over the seal hash.
    Stake {
        validator: PublicKey,
        signature: SerializableSignature,
    },
}

/// Block header. Field order is the canonical encoding order.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Header {
    /// Height in the chain, genesis is 0.
    pub index: u64,
    pub previous_hash: Hash,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
    /// Merkle root over transaction ids.
    pub merkle_root: Hash,
    /// World-state root after executing this block.
    pub state_root: Hash,
    /// Merkle root over execution receipts.
    pub receipts_root: Hash,
    /// Gas consumed by all transactions in the block.
    pub gas_used: u64,
    pub proof: ConsensusProof,
}

impl Header {
    /// Chain-specific block hash.
    pub fn hash(&self, chain_id: u64) -> Hash {
        let mut h = Hash::sha3();
        h.update(BLOCK_HEADER_TAG);
        h.update_encoded(&chain_id);
        h.update_encoded(self);
        h.finalize()
    }

    /// Digest a stake proposer signs: the header with an empty signature.
    ///
    /// Returns `None` for headers that do not carry a stake proof.
    pub fn seal_hash(&self, chain_id: u64) -> Option<Hash> {
        let ConsensusProof::Stake { validator, .. } = &self.proof else {
            return None;
        };
        let mut unsigned = self.clone();
        unsigned.proof = ConsensusProof::Stake {
            validator: *validator,
            signature: SerializableSignature::empty(),
        };
        let mut h = Hash::sha3();
        h.update(BLOCK_SEAL_TAG);
        h.update_encoded(&chain_id);
        h.update_encoded(&unsigned);
        Some(h.finalize())
    }

    /// Hasher primed with everything [`Header::hash`] feeds except the work nonce.
    ///
    /// Cloning the prefix and appending the little-endian nonce yields the
    /// same digest as a full rehash, which is what keeps mining cheap.
    pub fn work_prefix(&self, chain_id: u64) -> Option<HashBuilder> {
        if !matches!(self.proof, ConsensusProof::Work { .. }) {
            return None;
        }
        let mut encoded = Vec::new();
        self.serialize(&mut encoded).ok()?;
        encoded.truncate(encoded.len() - NONCE_LEN);

        let mut h = Hash::sha3();
        h.update(BLOCK_HEADER_TAG);
        h.update_encoded(&chain_id);
        h.update(&encoded);
        Some(h)
    }

    /// Block hash for `nonce` given a prefix from [`Header::work_prefix`].
    pub fn hash_with_nonce(prefix: &HashBuilder, nonce: u64) -> Hash {
        prefix.clone().chain(nonce.to_le_bytes()).finalize()
    }

    pub fn is_genesis(&self) -> bool {
        self.index == 0
    }
}

/// Structural problems that make a block invalid regardless of chain state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockError {
    #[error("malformed block: {0}")]
    MalformedBlock(String),
    #[error("transaction {index} is invalid: {error}")]
    InvalidTransaction {
        index: usize,
        #[source]
        error: TxError,
    },
    #[error("merkle root mismatch: header has {claimed}, transactions give {computed}")]
    MerkleRootMismatch { claimed: Hash, computed: Hash },
}

/// Header fields that come out of executing the block's transactions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commitments {
    pub timestamp: u64,
    pub state_root: Hash,
    pub receipts_root: Hash,
    pub gas_used: u64,
}

/// A header plus its ordered transactions. Immutable once appended.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Transaction>,
}

/// Assembles a block, computing the Merkle root over `transactions`.
///
/// Fails with `MalformedBlock` when the coinbase slot is missing or misused,
/// or when any other transaction fails its stateless checks.
pub fn build_block(
    params: &ChainParams,
    index: u64,
    previous_hash: Hash,
    transactions: Vec<Transaction>,
    proof: ConsensusProof,
    commitments: Commitments,
) -> Result<Block, BlockError> {
    let merkle_root = MerkleTree::from_transactions(&transactions, params.chain_id);
    let block = Block {
        header: Header {
            index,
            previous_hash,
            timestamp: commitments.timestamp,
            merkle_root,
            state_root: commitments.state_root,
            receipts_root: commitments.receipts_root,
            gas_used: commitments.gas_used,
            proof,
        },
        transactions,
    };
    block.check_structure(params)?;
    Ok(block)
}

impl Block {
    /// The genesis block for `params`, committing to the given genesis state root.
    pub fn genesis(params: &ChainParams, state_root: Hash) -> Block {
        Block {
            header: Header {
                index: 0,
                previous_hash: Hash::zero(),
                timestamp: params.genesis.timestamp,
                merkle_root: Hash::zero(),
                state_root,
                receipts_root: Hash::zero(),
                gas_used: 0,
                proof: ConsensusProof::Genesis,
            },
            transactions: Vec::new(),
        }
    }

    pub fn hash(&self, chain_id: u64) -> Hash {
        self.header.hash(chain_id)
    }

    pub fn index(&self) -> u64 {
        self.header.index
    }

    /// The reward transaction, absent only at genesis.
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinbase())
    }

    /// Transactions after the coinbase slot.
    pub fn user_transactions(&self) -> &[Transaction] {
        match self.coinbase() {
            Some(_) => &self.transactions[1..],
            None => &self.transactions,
        }
    }

    /// Checks that everything derivable from the block alone is consistent.
    ///
    /// - Genesis has no transactions, a zero parent and the genesis proof.
    /// - Every later block starts with exactly one coinbase whose nonce is
    ///   the block index, followed by well-formed transactions.
    /// - Transaction count and summed gas limits respect the block caps.
    /// - The header's Merkle root matches the transactions.
    pub fn check_structure(&self, params: &ChainParams) -> Result<(), BlockError> {
        let header = &self.header;
        if header.is_genesis() {
            if !self.transactions.is_empty() {
                return Err(BlockError::MalformedBlock(
                    "genesis block carries transactions".into(),
                ));
            }
            if !header.previous_hash.is_zero() || header.proof != ConsensusProof::Genesis {
                return Err(BlockError::MalformedBlock(
                    "genesis block must have a zero parent and the genesis proof".into(),
                ));
            }
            return self.check_merkle_root(params.chain_id);
        }

        if header.proof == ConsensusProof::Genesis {
            return Err(BlockError::MalformedBlock(format!(
                "genesis proof at index {}",
                header.index
            )));
        }
        let Some(coinbase) = self.coinbase() else {
            return Err(BlockError::MalformedBlock(
                "first transaction must be the coinbase".into(),
            ));
        };
        if !coinbase.verify(params.chain_id) {
            return Err(BlockError::InvalidTransaction {
                index: 0,
                error: TxError::InvalidSignature,
            });
        }
        if coinbase.nonce != header.index || coinbase.fee != 0 || !coinbase.data.is_empty() {
            return Err(BlockError::MalformedBlock(
                "coinbase must carry the block index as nonce and no fee or data".into(),
            ));
        }

        let user = self.user_transactions();
        if user.len() > params.gas.max_block_txs {
            return Err(BlockError::MalformedBlock(format!(
                "{} transactions exceed the cap of {}",
                user.len(),
                params.gas.max_block_txs
            )));
        }
        let mut gas = 0u64;
        let mut seen = HashSet::with_capacity(user.len());
        for (i, tx) in user.iter().enumerate() {
            tx.check_well_formed(params)
                .map_err(|error| BlockError::InvalidTransaction {
                    index: i + 1,
                    error,
                })?;
            if !seen.insert(tx.id(params.chain_id)) {
                return Err(BlockError::MalformedBlock(format!(
                    "transaction {} repeats an earlier one",
                    i + 1
                )));
            }
            gas = gas.saturating_add(tx.gas_limit);
        }
        if gas > params.gas.max_block_gas {
            return Err(BlockError::MalformedBlock(format!(
                "summed gas limit {gas} exceeds block cap {}",
                params.gas.max_block_gas
            )));
        }

        self.check_merkle_root(params.chain_id)
    }

    fn check_merkle_root(&self, chain_id: u64) -> Result<(), BlockError> {
        let computed = MerkleTree::from_transactions(&self.transactions, chain_id);
        if computed != self.header.merkle_root {
            return Err(BlockError::MerkleRootMismatch {
                claimed: self.header.merkle_root,
                computed,
            });
        }
        Ok(())
    }

    /// Membership proof for the transaction at `index`, checkable against
    /// `header.merkle_root` with [`crate::types::merkle_tree::verify_merkle_proof`].
    pub fn transaction_proof(&self, index: usize, chain_id: u64) -> Option<MerkleProof> {
        let leaves = self.transactions.iter().map(|tx| tx.id(chain_id)).collect();
        MerkleTree::proof(leaves, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::encoding::{Decode, Encode};
    use crate::types::merkle_tree::verify_merkle_proof;
    use crate::utils::test_utils::utils::{dev_params, key, transfer};

    fn commitments() -> Commitments {
        Commitments {
            timestamp: 1,
            state_root: Hash::sha3().chain(b"state").finalize(),
            receipts_root: Hash::zero(),
            gas_used: 0,
        }
    }

    fn work() -> ConsensusProof {
        ConsensusProof::Work {
            difficulty: 1,
            nonce: 0,
        }
    }

    fn sample_block() -> Block {
        let params = dev_params();
        let miner = key(9);
        let txs = vec![
            Transaction::coinbase(&miner, miner.address(), 50, 1, params.chain_id),
            transfer(&key(1), key(2).address(), 10, 0),
            transfer(&key(1), key(2).address(), 20, 1),
        ];
        build_block(&params, 1, Hash::zero(), txs, work(), commitments()).expect("valid block")
    }

    #[test]
    fn test_genesis_block() {
        let params = dev_params();
        let genesis = Block::genesis(&params, Hash::zero());
        assert_eq!(genesis.index(), 0);
        assert!(genesis.transactions.is_empty());
        assert!(genesis.header.previous_hash.is_zero());
        assert_eq!(genesis.check_structure(&params), Ok(()));
    }

    #[test]
    fn genesis_with_transactions_is_malformed() {
        let params = dev_params();
        let mut genesis = Block::genesis(&params, Hash::zero());
        genesis.transactions.push(transfer(&key(1), key(2).address(), 1, 0));
        assert!(matches!(
            genesis.check_structure(&params),
            Err(BlockError::MalformedBlock(_))
        ));
    }

    #[test]
    fn build_without_coinbase_is_malformed() {
        let params = dev_params();
        let result = build_block(&params, 1, Hash::zero(), Vec::new(), work(), commitments());
        assert!(matches!(result, Err(BlockError::MalformedBlock(_))));

        let txs = vec![transfer(&key(1), key(2).address(), 1, 0)];
        let result = build_block(&params, 1, Hash::zero(), txs, work(), commitments());
        assert!(matches!(result, Err(BlockError::MalformedBlock(_))));
    }

    #[test]
    fn second_coinbase_is_rejected() {
        let params = dev_params();
        let miner = key(9);
        let txs = vec![
            Transaction::coinbase(&miner, miner.address(), 50, 1, params.chain_id),
            Transaction::coinbase(&miner, miner.address(), 50, 1, params.chain_id),
        ];
        let result = build_block(&params, 1, Hash::zero(), txs, work(), commitments());
        assert_eq!(
            result,
            Err(BlockError::InvalidTransaction {
                index: 1,
                error: TxError::UnexpectedCoinbase
            })
        );
    }

    #[test]
    fn repeated_transaction_is_malformed() {
        let params = dev_params();
        let miner = key(9);
        let tx = transfer(&key(1), key(2).address(), 1, 0);
        let padded = vec![
            Transaction::coinbase(&miner, miner.address(), 50, 1, params.chain_id),
            tx.clone(),
            tx,
        ];
        let result = build_block(&params, 1, Hash::zero(), padded, work(), commitments());
        assert!(matches!(result, Err(BlockError::MalformedBlock(_))));
    }

    #[test]
    fn coinbase_nonce_must_match_index() {
        let params = dev_params();
        let miner = key(9);
        let txs = vec![Transaction::coinbase(&miner, miner.address(), 50, 7, params.chain_id)];
        let result = build_block(&params, 1, Hash::zero(), txs, work(), commitments());
        assert!(matches!(result, Err(BlockError::MalformedBlock(_))));
    }

    #[test]
    fn verify_fails_with_tampered_merkle_root() {
        let params = dev_params();
        let mut block = sample_block();
        block.header.merkle_root = Hash::sha3().chain(b"other").finalize();
        assert!(matches!(
            block.check_structure(&params),
            Err(BlockError::MerkleRootMismatch { .. })
        ));
    }

    #[test]
    fn verify_fails_with_reordered_transactions() {
        let params = dev_params();
        let mut block = sample_block();
        block.transactions.swap(1, 2);
        assert!(matches!(
            block.check_structure(&params),
            Err(BlockError::MerkleRootMismatch { .. })
        ));
    }

    #[test]
    fn hash_covers_every_header_field() {
        let block = sample_block();
        let base = block.hash(1337);

        let mut h = block.header.clone();
        h.timestamp += 1;
        assert_ne!(h.hash(1337), base);

        let mut h = block.header.clone();
        h.state_root = Hash::zero();
        assert_ne!(h.hash(1337), base);

        let mut h = block.header.clone();
        h.proof = ConsensusProof::Work {
            difficulty: 1,
            nonce: 1,
        };
        assert_ne!(h.hash(1337), base);

        assert_ne!(block.hash(1338), base);
    }

    #[test]
    fn work_prefix_matches_full_hash() {
        let mut header = sample_block().header;
        let prefix = header.work_prefix(1337).expect("work proof");
        for nonce in [0u64, 1, 42, u64::MAX] {
            header.proof = ConsensusProof::Work {
                difficulty: 1,
                nonce,
            };
            assert_eq!(Header::hash_with_nonce(&prefix, nonce), header.hash(1337));
        }
    }

    #[test]
    fn seal_hash_ignores_signature_only() {
        let validator = key(3);
        let mut header = sample_block().header;
        header.proof = ConsensusProof::Stake {
            validator: validator.public_key(),
            signature: SerializableSignature::empty(),
        };
        let unsigned = header.seal_hash(1337).expect("stake proof");
        header.proof = ConsensusProof::Stake {
            validator: validator.public_key(),
            signature: validator.sign(unsigned.as_slice()),
        };
        assert_eq!(header.seal_hash(1337), Some(unsigned));
        assert_ne!(header.hash(1337), unsigned);
        assert!(sample_block().header.seal_hash(1337).is_none());
    }

    #[test]
    fn transaction_proofs_verify_against_header() {
        let block = sample_block();
        for (i, tx) in block.transactions.iter().enumerate() {
            let proof = block.transaction_proof(i, 1337).expect("in range");
            assert!(verify_merkle_proof(&block.header.merkle_root, &tx.id(1337), &proof));
        }
        assert!(block.transaction_proof(3, 1337).is_none());
    }

    #[test]
    fn serialize_deserialize_roundtrip() {
        let block = sample_block();
        let decoded = <Block as Decode>::from_bytes(&block.to_bytes()).expect("decode");
        assert_eq!(decoded, block);
        assert_eq!(decoded.hash(1337), block.hash(1337));
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let mut bytes = sample_block().to_bytes();
        bytes.push(0);
        assert!(<Block as Decode>::from_bytes(&bytes).is_err());
    }

    #[test]
    fn block_gas_cap_is_enforced() {
        let mut params = dev_params();
        params.gas.max_block_gas = 30_000;
        let miner = key(9);
        let txs = vec![
            Transaction::coinbase(&miner, miner.address(), 50, 1, params.chain_id),
            transfer(&key(1), key(2).address(), 10, 0),
            transfer(&key(1), key(2).address(), 20, 1),
        ];
        let result = build_block(&params, 1, Hash::zero(), txs, work(), commitments());
        assert!(matches!(result, Err(BlockError::MalformedBlock(_))));
    }
}
