//! Key-value collaborator the chain persists into.
//!
//! The chain writes each commit as a single ordered batch: blocks by hash,
//! canonical hashes by height, changed world-state entries and the tip
//! pointer. Backends must make a batch visible all at once.

use dashmap::DashMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend failure: {0}")]
    Backend(String),
    #[error("corrupt value under key {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Write of `value` under `key`, or a deletion when `value` is `None`.
pub type BatchEntry = (Vec<u8>, Option<Vec<u8>>);

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), StorageError>;

    /// Applies every entry in order, atomically with respect to readers.
    fn batch_write(&self, batch: Vec<BatchEntry>) -> Result<(), StorageError>;
}

/// In-memory store backed by a concurrent map.
///
/// Batches take the write side of a lock that single reads share, so a
/// reader never sees half of a batch.
#[derive(Default)]
pub struct MemoryStore {
    map: DashMap<Vec<u8>, Vec<u8>>,
    batch_lock: RwLock<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn poisoned() -> StorageError {
        StorageError::Backend("batch lock poisoned".into())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let _guard = self.batch_lock.read().map_err(|_| Self::poisoned())?;
        Ok(self.map.get(key).map(|v| v.value().clone()))
    }

    fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), StorageError> {
        let _guard = self.batch_lock.read().map_err(|_| Self::poisoned())?;
        self.map.insert(key.to_vec(), value);
        Ok(())
    }

    fn batch_write(&self, batch: Vec<BatchEntry>) -> Result<(), StorageError> {
        let _guard = self.batch_lock.write().map_err(|_| Self::poisoned())?;
        for (key, value) in batch {
            match value {
                Some(value) => {
                    self.map.insert(key, value);
                }
                None => {
                    self.map.remove(&key);
                }
            }
        }
        Ok(())
    }
}

/// Key layout shared by every backend.
pub mod keys {
    use crate::types::address::Address;
    use crate::types::hash::Hash;

    pub const TIP: &[u8] = b"tip";
    pub const VALIDATORS: &[u8] = b"validators";

    pub fn block(hash: &Hash) -> Vec<u8> {
        [b"b/".as_slice(), hash.as_slice()].concat()
    }

    /// Canonical block hash at `height`; big-endian so keys sort by height.
    pub fn height(height: u64) -> Vec<u8> {
        [b"h/".as_slice(), &height.to_be_bytes()].concat()
    }

    pub fn account(address: &Address) -> Vec<u8> {
        [b"a/".as_slice(), address.as_slice()].concat()
    }
}
