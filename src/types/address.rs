//! 20-byte account addresses.

use crate::types::hash::Hash;
use borsh::{BorshDeserialize, BorshSerialize};
use std::fmt;

pub const ADDRESS_SIZE: usize = 20;

/// Identifies an externally owned account or a contract.
///
/// Derived by hashing a public key (or, for contracts, the deployer and nonce)
/// with SHA3-256 and keeping the last 20 bytes.
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
pub struct Address(pub [u8; ADDRESS_SIZE]);

impl Address {
    pub const fn zero() -> Address {
        Address([0u8; ADDRESS_SIZE])
    }

    /// Takes the trailing 20 bytes of a digest.
    pub fn from_hash(hash: &Hash) -> Address {
        let mut out = [0u8; ADDRESS_SIZE];
        out.copy_from_slice(&hash.0[32 - ADDRESS_SIZE..]);
        Address(out)
    }

    /// Address of a contract created by `deployer` with the given account nonce.
    pub fn contract(deployer: &Address, nonce: u64) -> Address {
        let digest = Hash::sha3()
            .chain(b"CONTRACT")
            .chain(deployer.0)
            .chain(nonce.to_le_bytes())
            .finalize();
        Address::from_hash(&digest)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Parses a 40-digit hex string with an optional `0x` prefix.
    pub fn from_hex(s: &str) -> Option<Address> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        if s.len() != ADDRESS_SIZE * 2 {
            return None;
        }
        let mut out = [0u8; ADDRESS_SIZE];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(s.get(i * 2..i * 2 + 2)?, 16).ok()?;
        }
        Some(Address(out))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x")?;
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let addr = Address([0x3c; ADDRESS_SIZE]);
        assert_eq!(Address::from_hex(&addr.to_string()), Some(addr));
    }

    #[test]
    fn from_hex_rejects_bad_input() {
        assert!(Address::from_hex("0x1234").is_none());
        assert!(Address::from_hex(&"zz".repeat(ADDRESS_SIZE)).is_none());
    }

    #[test]
    fn contract_address_depends_on_nonce() {
        let deployer = Address([1; ADDRESS_SIZE]);
        assert_ne!(Address::contract(&deployer, 0), Address::contract(&deployer, 1));
        assert_eq!(Address::contract(&deployer, 3), Address::contract(&deployer, 3));
    }
}
