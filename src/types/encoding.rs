//! Canonical binary encoding.
//!
//! Every persisted or hashed structure goes through borsh: fixed field order,
//! little-endian integers, `u32` length prefixes for sequences. Two nodes that
//! encode the same value therefore produce identical bytes and hashes.

use borsh::{BorshDeserialize, BorshSerialize};
use thiserror::Error;

/// Upper bound on any single decoded message (blocks included).
pub const MAX_ENCODED_LEN: usize = 8 * 1024 * 1024;

/// Errors produced while decoding untrusted bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("input is {len} bytes, limit is {max}")]
    LengthOverflow { len: usize, max: usize },
    #[error("invalid encoding: {0}")]
    InvalidValue(String),
}

/// Serialization helpers available on every borsh type.
pub trait Encode: BorshSerialize {
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        // Writes into a Vec cannot fail.
        let _ = self.serialize(&mut out);
        out
    }

    fn encoded_len(&self) -> usize {
        self.to_bytes().len()
    }
}

impl<T: BorshSerialize + ?Sized> Encode for T {}

/// Deserialization that rejects oversized input and trailing bytes.
pub trait Decode: BorshDeserialize {
    fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() > MAX_ENCODED_LEN {
            return Err(DecodeError::LengthOverflow {
                len: data.len(),
                max: MAX_ENCODED_LEN,
            });
        }
        borsh::from_slice(data).map_err(|e| DecodeError::InvalidValue(e.to_string()))
    }
}

impl<T: BorshDeserialize> Decode for T {}
