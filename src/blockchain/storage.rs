use std::path::Path;
use std::sync::{PoisonError, RwLock};

use log::debug;
use sled::{Db, Tree};
use thiserror::Error;

use super::block::Block;
use super::crypto::{short_hash, Hash, ZERO_HASH};
use super::transaction::{Tx, TxSlice};

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

/// Append-only store of accepted blocks for a single chain.
///
/// Lookups must reflect every prior successful [`BlockStore::add`].
pub trait BlockStore: Send + Sync {
    /// New empty block whose previous hash is the hash of the last block
    fn new_block(&self) -> Result<Block, StorageError> {
        let prev_hash = self
            .last_block()?
            .map(|block| block.hash())
            .unwrap_or(ZERO_HASH);
        Ok(Block::new(prev_hash, TxSlice::new()))
    }

    /// Whether the store holds this block
    fn exists(&self, block: &Block) -> Result<bool, StorageError>;

    /// Appends a block. Adding a block that is already stored is a no-op.
    fn add(&self, block: Block) -> Result<(), StorageError>;

    /// First block held by this store. Not necessarily the genesis block when
    /// the node joined an existing chain.
    fn first_block(&self) -> Result<Option<Block>, StorageError>;

    fn last_block(&self) -> Result<Option<Block>, StorageError>;

    /// Last transaction of the last block
    fn last_tx(&self) -> Result<Option<Tx>, StorageError> {
        Ok(self
            .last_block()?
            .and_then(|block| block.transactions().last().cloned()))
    }

    fn get(&self, hash: &Hash) -> Result<Option<Block>, StorageError>;

    fn block_count(&self) -> Result<u64, StorageError>;
}

/// Block store kept in memory
#[derive(Debug, Default)]
pub struct InMemBlockStore {
    blocks: RwLock<Vec<Block>>,
}

impl InMemBlockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockStore for InMemBlockStore {
    // Newer blocks are the likelier match, so lookups scan from the end.
    fn exists(&self, block: &Block) -> Result<bool, StorageError> {
        let hash = block.hash();
        let blocks = self.blocks.read().unwrap_or_else(PoisonError::into_inner);
        Ok(blocks
            .iter()
            .rev()
            .any(|b| b.hash() == hash && b.header.prev_hash == block.header.prev_hash))
    }

    fn add(&self, block: Block) -> Result<(), StorageError> {
        let hash = block.hash();
        let mut blocks = self.blocks.write().unwrap_or_else(PoisonError::into_inner);
        if blocks.iter().rev().any(|b| b.hash() == hash) {
            return Ok(());
        }
        blocks.push(block);
        debug!("Chain size={}", blocks.len());
        Ok(())
    }

    fn first_block(&self) -> Result<Option<Block>, StorageError> {
        let blocks = self.blocks.read().unwrap_or_else(PoisonError::into_inner);
        Ok(blocks.first().cloned())
    }

    fn last_block(&self) -> Result<Option<Block>, StorageError> {
        let blocks = self.blocks.read().unwrap_or_else(PoisonError::into_inner);
        Ok(blocks.last().cloned())
    }

    fn get(&self, hash: &Hash) -> Result<Option<Block>, StorageError> {
        let blocks = self.blocks.read().unwrap_or_else(PoisonError::into_inner);
        Ok(blocks.iter().rev().find(|b| &b.hash() == hash).cloned())
    }

    fn block_count(&self) -> Result<u64, StorageError> {
        let blocks = self.blocks.read().unwrap_or_else(PoisonError::into_inner);
        Ok(blocks.len() as u64)
    }
}

/// Block store persisted with sled
pub struct SledBlockStore {
    /// The database instance
    db: Db,

    /// Block hash to encoded block
    blocks: Tree,

    /// Big-endian height to block hash
    heights: Tree,
}

impl std::fmt::Debug for SledBlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledBlockStore")
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

impl SledBlockStore {
    /// Opens (or creates) a block store at the given path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;

        let blocks = db.open_tree("blocks")?;
        let heights = db.open_tree("heights")?;

        Ok(Self {
            db,
            blocks,
            heights,
        })
    }

    fn decode(value: &[u8]) -> Result<Block, StorageError> {
        bincode::deserialize(value).map_err(|e| StorageError::DeserializationError(e.to_string()))
    }

    fn block_at(&self, entry: Option<(sled::IVec, sled::IVec)>) -> Result<Option<Block>, StorageError> {
        let Some((_, hash)) = entry else {
            return Ok(None);
        };

        match self.blocks.get(&hash)? {
            Some(value) => Self::decode(&value).map(Some),
            None => Err(StorageError::DeserializationError(format!(
                "height index points at missing block {}",
                short_hash(&hash)
            ))),
        }
    }

    /// All blocks in height order
    pub fn blocks(&self) -> Result<Vec<Block>, StorageError> {
        let mut out = Vec::new();
        for entry in self.heights.iter() {
            let (_, hash) = entry?;
            if let Some(value) = self.blocks.get(hash)? {
                out.push(Self::decode(&value)?);
            }
        }
        Ok(out)
    }

    /// Flushes all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

impl BlockStore for SledBlockStore {
    fn exists(&self, block: &Block) -> Result<bool, StorageError> {
        Ok(self.blocks.contains_key(block.hash())?)
    }

    fn add(&self, block: Block) -> Result<(), StorageError> {
        let hash = block.hash();
        if self.blocks.contains_key(hash)? {
            return Ok(());
        }

        let value = bincode::serialize(&block)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        let height = self.block_count()?;

        // block first, so the height index never points at a missing block
        self.blocks.insert(hash, value)?;
        self.heights.insert(height.to_be_bytes(), &hash[..])?;
        self.flush()?;

        debug!("Stored block {} at height {}", short_hash(&hash), height);
        Ok(())
    }

    fn first_block(&self) -> Result<Option<Block>, StorageError> {
        self.block_at(self.heights.first()?)
    }

    fn last_block(&self) -> Result<Option<Block>, StorageError> {
        self.block_at(self.heights.last()?)
    }

    fn get(&self, hash: &Hash) -> Result<Option<Block>, StorageError> {
        match self.blocks.get(hash)? {
            Some(value) => Self::decode(&value).map(Some),
            None => Ok(None),
        }
    }

    fn block_count(&self) -> Result<u64, StorageError> {
        match self.heights.last()? {
            Some((key, _)) => {
                let bytes: [u8; 8] = key.as_ref().try_into().map_err(|_| {
                    StorageError::DeserializationError("invalid height key".to_string())
                })?;
                Ok(u64::from_be_bytes(bytes) + 1)
            }
            None => Ok(0),
        }
    }
}
