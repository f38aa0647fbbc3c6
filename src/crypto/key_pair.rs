//! Schnorr signature key pairs on secp256k1.

use crate::types::address::Address;
use crate::types::hash::Hash;
pub use crate::types::serializable_signature::SerializableSignature;
use borsh::{BorshDeserialize, BorshSerialize};
use k256::schnorr::signature::{Signer, Verifier};
use k256::schnorr::{SigningKey, VerifyingKey};
use rand_core::OsRng;
use std::fmt;
use std::io::{self, Read, Write};

/// Private key for signing transactions and blocks. Never serialized.
#[derive(Clone)]
pub struct PrivateKey {
    key: SigningKey,
}

/// Public key plus the address derived from it.
///
/// Address derivation: `SHA3-256(verifying_key_bytes)[12..32]`. The address is
/// recomputed on decode so the pair can never disagree.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct PublicKey {
    pub key: VerifyingKey,
    pub address: Address,
}

impl PrivateKey {
    /// Generates a new random private key using OS-provided entropy.
    pub fn new() -> Self {
        Self {
            key: SigningKey::random(&mut OsRng),
        }
    }

    /// Returns `None` if the bytes are not a valid secp256k1 scalar.
    pub fn from_bytes(bytes: &[u8; 32]) -> Option<Self> {
        SigningKey::from_bytes(bytes).ok().map(|key| Self { key })
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_verifying_key(*self.key.verifying_key())
    }

    pub fn address(&self) -> Address {
        self.public_key().address
    }

    pub fn sign(&self, data: &[u8]) -> SerializableSignature {
        let signature: k256::schnorr::Signature = self.key.sign(data);
        SerializableSignature::from(signature)
    }
}

impl Default for PrivateKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey({})", self.address())
    }
}

impl PublicKey {
    fn from_verifying_key(key: VerifyingKey) -> Self {
        let digest = Hash::sha3().chain(key.to_bytes()).finalize();
        PublicKey {
            key,
            address: Address::from_hash(&digest),
        }
    }

    pub fn from_raw(bytes: &[u8; 32]) -> Option<Self> {
        VerifyingKey::from_bytes(bytes)
            .ok()
            .map(Self::from_verifying_key)
    }

    pub fn raw(&self) -> [u8; 32] {
        self.key.to_bytes().into()
    }

    /// Returns `true` if `signature` is a valid signature over `data`.
    pub fn verify(&self, data: &[u8], signature: &SerializableSignature) -> bool {
        match signature.to_signature() {
            Some(sig) => self.key.verify(data, &sig).is_ok(),
            None => false,
        }
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.address)
    }
}

impl BorshSerialize for PublicKey {
    fn serialize<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.raw())
    }
}

impl BorshDeserialize for PublicKey {
    fn deserialize_reader<R: Read>(reader: &mut R) -> io::Result<Self> {
        let bytes = <[u8; 32]>::deserialize_reader(reader)?;
        PublicKey::from_raw(&bytes)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "invalid public key"))
    }
}
