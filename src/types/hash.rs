//! 32-byte SHA3-256 digest type and an incremental builder.

use borsh::{BorshDeserialize, BorshSerialize};
use sha3::{Digest, Sha3_256};
use std::fmt;
use std::io;

/// SHA3-256 hash length in bytes.
pub const HASH_LEN: usize = 32;

/// Fixed-size digest used for block, transaction and state commitments.
///
/// `Ord` is byte-wise lexicographic, which is what fork choice uses to break
/// ties between equally weighted branches.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    BorshSerialize,
    BorshDeserialize,
)]
pub struct Hash(pub [u8; HASH_LEN]);

impl Hash {
    /// All-zero digest. Used as the genesis `previous_hash` and the empty Merkle root.
    pub const fn zero() -> Hash {
        Hash([0u8; HASH_LEN])
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Builds a hash from a slice, returning `None` unless it is exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Hash> {
        <[u8; HASH_LEN]>::try_from(bytes).ok().map(Hash)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Number of leading zero bits, counted from the most significant bit of byte 0.
    pub fn leading_zero_bits(&self) -> u32 {
        let mut bits = 0;
        for byte in self.0 {
            if byte == 0 {
                bits += 8;
                continue;
            }
            bits += byte.leading_zeros();
            break;
        }
        bits
    }

    /// Creates a new SHA3-256 builder for incremental hashing.
    pub fn sha3() -> HashBuilder {
        HashBuilder::new()
    }

    /// Hashes `value`'s canonical encoding under a domain-separation tag.
    pub fn tagged<T: BorshSerialize + ?Sized>(tag: &[u8], value: &T) -> Hash {
        let mut h = Hash::sha3();
        h.update(tag);
        h.update_encoded(value);
        h.finalize()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Incremental SHA3-256 builder.
///
/// Implements [`io::Write`] so any borsh-encodable value can be streamed into
/// the digest without an intermediate buffer.
#[derive(Clone, Default)]
pub struct HashBuilder {
    hasher: Sha3_256,
}

impl HashBuilder {
    pub fn new() -> Self {
        Self {
            hasher: Sha3_256::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Feeds data and returns the builder, for one-expression hashing.
    pub fn chain(mut self, data: impl AsRef<[u8]>) -> Self {
        self.hasher.update(data.as_ref());
        self
    }

    /// Streams the borsh encoding of `value` into the digest.
    pub fn update_encoded<T: BorshSerialize + ?Sized>(&mut self, value: &T) {
        // Writes into a digest cannot fail.
        let _ = value.serialize(self);
    }

    pub fn finalize(self) -> Hash {
        Hash(self.hasher.finalize().into())
    }
}

impl io::Write for HashBuilder {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.hasher.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
