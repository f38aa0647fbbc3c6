//! Merkle commitments over transaction and receipt hashes.
//!
//! - An empty list of leaves yields the all-zero hash (`Hash::zero()`).
//! - Odd levels are padded by duplicating the last node before pairing.
//! - Membership proofs are the ordered sibling path from leaf to root; the
//!   leaf index encodes on which side each sibling sits.

use crate::core::transaction::Transaction;
use crate::types::hash::Hash;
use borsh::{BorshDeserialize, BorshSerialize};

const EMPTY_ROOT: Hash = Hash::zero();
const MERKLE_NODE_SEPARATION: &[u8] = b"MERKLE_NODE";

/// Membership proof for a single leaf.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct MerkleProof {
    /// Position of the leaf in the original list.
    pub index: u32,
    /// Sibling hashes ordered from the leaf level upwards.
    pub siblings: Vec<Hash>,
}

pub struct MerkleTree;

impl MerkleTree {
    fn hash_pair(left: Hash, right: Hash) -> Hash {
        let mut h = Hash::sha3();
        h.update(MERKLE_NODE_SEPARATION);
        h.update(left.as_slice());
        h.update(right.as_slice());
        h.finalize()
    }

    /// Reduces one level in place and returns the new length.
    fn reduce_level(nodes: &mut [Hash], len: usize) -> usize {
        let mut write = 0;
        let mut read = 0;
        while read < len {
            let left = nodes[read];
            let right = if read + 1 < len { nodes[read + 1] } else { left };
            nodes[write] = Self::hash_pair(left, right);
            write += 1;
            read += 2;
        }
        write
    }

    /// Computes a Merkle root from the provided leaf hashes.
    ///
    /// Padding by duplication means `[a, b, c]` and `[a, b, c, c]` share a
    /// root. Callers committing to a list must reject repeated leaves, as
    /// [`Block::check_structure`](crate::core::block::Block::check_structure)
    /// does for transaction ids.
    pub fn from_raw(mut nodes: Vec<Hash>) -> Hash {
        if nodes.is_empty() {
            return EMPTY_ROOT;
        }
        let mut len = nodes.len();
        while len > 1 {
            len = Self::reduce_level(&mut nodes, len);
        }
        nodes[0]
    }

    /// Root over transaction ids, in block order.
    pub fn from_transactions(txs: &[Transaction], chain_id: u64) -> Hash {
        Self::from_raw(txs.iter().map(|tx| tx.id(chain_id)).collect())
    }

    /// Builds the sibling path for `leaves[index]`, or `None` if out of range.
    pub fn proof(mut nodes: Vec<Hash>, index: usize) -> Option<MerkleProof> {
        if index >= nodes.len() {
            return None;
        }
        let mut siblings = Vec::new();
        let mut position = index;
        let mut len = nodes.len();
        while len > 1 {
            let sibling = if position % 2 == 0 {
                if position + 1 < len {
                    nodes[position + 1]
                } else {
                    nodes[position]
                }
            } else {
                nodes[position - 1]
            };
            siblings.push(sibling);
            len = Self::reduce_level(&mut nodes, len);
            position /= 2;
        }
        Some(MerkleProof {
            index: u32::try_from(index).ok()?,
            siblings,
        })
    }

    /// Checks that `leaf` sits at `proof.index` under `root`.
    pub fn verify_proof(root: &Hash, leaf: &Hash, proof: &MerkleProof) -> bool {
        let mut position = proof.index;
        let mut acc = *leaf;
        for sibling in &proof.siblings {
            acc = if position % 2 == 0 {
                Self::hash_pair(acc, *sibling)
            } else {
                Self::hash_pair(*sibling, acc)
            };
            position /= 2;
        }
        position == 0 && acc == *root
    }
}

/// Free-standing form used by light clients holding only a header.
pub fn verify_merkle_proof(root: &Hash, leaf: &Hash, proof: &MerkleProof) -> bool {
    MerkleTree::verify_proof(root, leaf, proof)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_leaf(data: &[u8]) -> Hash {
        Hash::sha3().chain(data).finalize()
    }

    fn leaves(n: usize) -> Vec<Hash> {
        (0..n).map(|i| hash_leaf(&i.to_le_bytes())).collect()
    }

    #[test]
    fn empty_returns_zero_hash() {
        assert_eq!(MerkleTree::from_raw(Vec::new()), Hash::zero());
    }

    #[test]
    fn single_leaf_returns_leaf() {
        let leaf = hash_leaf(b"leaf");
        assert_eq!(MerkleTree::from_raw(vec![leaf]), leaf);
    }

    #[test]
    fn even_number_of_leaves_matches_manual_reduction() {
        let [a, b, c, d] = [b"a", b"b", b"c", b"d"].map(|s| hash_leaf(s));
        let expected = MerkleTree::hash_pair(MerkleTree::hash_pair(a, b), MerkleTree::hash_pair(c, d));
        assert_eq!(MerkleTree::from_raw(vec![a, b, c, d]), expected);
    }

    #[test]
    fn odd_number_of_leaves_duplicates_last_for_padding() {
        let [a, b, c] = [b"a", b"b", b"c"].map(|s| hash_leaf(s));
        let expected = MerkleTree::hash_pair(MerkleTree::hash_pair(a, b), MerkleTree::hash_pair(c, c));
        assert_eq!(MerkleTree::from_raw(vec![a, b, c]), expected);
    }

    #[test]
    fn repeated_tail_shares_the_padded_root() {
        let [a, b, c] = [b"a", b"b", b"c"].map(|s| hash_leaf(s));
        assert_eq!(
            MerkleTree::from_raw(vec![a, b, c]),
            MerkleTree::from_raw(vec![a, b, c, c])
        );
    }

    #[test]
    fn root_is_idempotent() {
        assert_eq!(MerkleTree::from_raw(leaves(9)), MerkleTree::from_raw(leaves(9)));
    }

    #[test]
    fn flipping_any_leaf_bit_changes_root() {
        let base = leaves(5);
        let root = MerkleTree::from_raw(base.clone());
        for i in 0..base.len() {
            let mut tampered = base.clone();
            tampered[i].0[31] ^= 0x01;
            assert_ne!(MerkleTree::from_raw(tampered), root, "leaf {i}");
        }
    }

    #[test]
    fn proofs_verify_for_every_leaf() {
        for n in [1, 2, 3, 7, 8] {
            let set = leaves(n);
            let root = MerkleTree::from_raw(set.clone());
            for i in 0..n {
                let proof = MerkleTree::proof(set.clone(), i).unwrap();
                assert!(verify_merkle_proof(&root, &set[i], &proof), "n={n} i={i}");
            }
        }
    }

    #[test]
    fn proof_fails_for_wrong_leaf_or_index() {
        let set = leaves(6);
        let root = MerkleTree::from_raw(set.clone());
        let mut proof = MerkleTree::proof(set.clone(), 2).unwrap();
        assert!(!verify_merkle_proof(&root, &set[3], &proof));
        proof.index = 3;
        assert!(!verify_merkle_proof(&root, &set[2], &proof));
    }

    #[test]
    fn proof_out_of_range_is_none() {
        assert!(MerkleTree::proof(leaves(3), 3).is_none());
        assert!(MerkleTree::proof(Vec::new(), 0).is_none());
    }
}
