//! Primitive types shared across the ledger.
//!
//! - `Hash`: 32-byte SHA3-256 digests
//! - `Address`: 20-byte account identifiers
//! - `Encode`/`Decode`: canonical borsh encoding with bounded decoding

pub mod address;
pub mod encoding;
pub mod hash;
pub mod merkle_tree;
pub mod serializable_signature;
