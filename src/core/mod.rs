//! Core ledger data structures and the chain state machine.
//!
//! - [`block`]: headers, blocks and their structural checks
//! - [`transaction`]: signed transactions and stateless validation
//! - [`executor`]: applying transactions and whole blocks to the world state
//! - [`state`]: the account world state and its commitment
//! - [`blockchain`]: fork choice, reorganization and persistence

pub mod account;
pub mod block;
pub mod blockchain;
pub mod executor;
pub mod params;
pub mod receipt;
pub mod state;
pub mod transaction;
