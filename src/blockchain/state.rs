use dashmap::DashMap;
use log::info;
use thiserror::Error;

use std::sync::Arc;

use super::block::Block;
use super::crypto::{short_hash, Hash};

/// Errors returned by a state machine to veto a block
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Block rejected: {0}")]
    Rejected(String),
}

/// User hook invoked once for every block the chain accepts.
///
/// Called synchronously before the block is persisted. Returning an error
/// discards the block.
pub trait StateMachine: Send + Sync {
    fn apply(&self, block: &Block) -> Result<(), StateError>;
}

/// State machine indexing the block that carried each transaction
#[derive(Debug, Clone, Default)]
pub struct TxIndex {
    entries: Arc<DashMap<Hash, Hash>>,
}

impl TxIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash of the block that included the transaction
    pub fn block_of(&self, tx_hash: &Hash) -> Option<Hash> {
        self.entries.get(tx_hash).map(|entry| *entry.value())
    }

    pub fn contains(&self, tx_hash: &Hash) -> bool {
        self.entries.contains_key(tx_hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl StateMachine for TxIndex {
    fn apply(&self, block: &Block) -> Result<(), StateError> {
        let block_hash = block.hash();
        for tx in block.transactions() {
            self.entries.insert(tx.hash(), block_hash);
        }

        info!(
            "[fsm.apply] prev={} blk={} nonce={} tx={}",
            short_hash(&block.header.prev_hash),
            short_hash(&block_hash),
            block.header.nonce,
            block.transactions().len()
        );
        Ok(())
    }
}
