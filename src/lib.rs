//! Single-node ledger core.
//!
//! Validates and orders blocks of signed transactions, executes them against
//! an account world state with a metered stack VM, chooses between competing
//! branches by accumulated weight and publishes the canonical tip. Block
//! production is pluggable: proof-of-work or proof-of-stake with slashing.

pub mod consensus;
pub mod core;
pub mod crypto;
pub mod network;
pub mod storage;
pub mod types;
pub mod utils;
pub mod virtual_machine;
