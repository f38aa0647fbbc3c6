//! Persistence collaborator and the pending transaction pool.
//!
//! - [`kv`]: the key-value store the chain commits into, with an in-memory backend
//! - [`mempool`]: pending transactions ordered for block production

pub mod kv;
pub mod mempool;
