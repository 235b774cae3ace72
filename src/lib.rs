//! A small peer-replicated ledger ordered by proof of work.

pub mod blockchain;

pub use blockchain::{Block, Blockchain, BlockchainError, Config, Tx};
