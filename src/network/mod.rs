//! Node runtime: the single-writer actor and the gossip envelope.
//!
//! - [`message`]: wire envelope for blocks and transactions, and node events
//! - [`server`]: the node task, its command handle and block production

pub mod message;
pub mod server;
