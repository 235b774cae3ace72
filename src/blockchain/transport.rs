//! Network contract used by the chain engine, plus an in-process
//! implementation that wires several nodes together inside one runtime.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use log::{debug, error};
use thiserror::Error;
use tokio::sync::mpsc::Sender;

use std::sync::Arc;

use super::block::Block;
use super::crypto::{short_hash, Hash};
use super::storage::{BlockStore, StorageError};
use super::transaction::Tx;

/// Errors that can occur during transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport not initialized: {0}")]
    NotInitialized(String),

    #[error("peer not found: {0}")]
    PeerNotFound(String),

    #[error("failed to send to {0}")]
    SendFailed(String),

    #[error("peer {0} has no blocks")]
    EmptyChain(String),

    #[error("peer storage error: {0}")]
    StorageError(#[from] StorageError),
}

/// Moves transactions and blocks between nodes.
///
/// Inbound items are pushed onto the sinks handed over by
/// [`Transport::initialize`]; the engine drains them from there.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn initialize(
        &self,
        tx_sink: Sender<Tx>,
        block_sink: Sender<Block>,
        store: Arc<dyn BlockStore>,
    ) -> Result<(), TransportError>;

    async fn broadcast_transaction(&self, tx: &Tx) -> Result<(), TransportError>;

    async fn broadcast_block(&self, block: &Block) -> Result<(), TransportError>;

    /// Fetches blocks by hash from the network. Found blocks are delivered on
    /// the block sink rather than returned.
    async fn request_blocks(&self, hashes: Vec<Hash>) -> Result<(), TransportError>;

    /// Last block of the chain held by `host`
    async fn last_block(&self, host: &str) -> Result<Block, TransportError>;

    /// First block of the chain held by `host`
    async fn first_block(&self, host: &str) -> Result<Block, TransportError>;
}

#[derive(Clone)]
struct Endpoint {
    tx_sink: Sender<Tx>,
    block_sink: Sender<Block>,
    store: Arc<dyn BlockStore>,
}

/// Registry of the nodes reachable through [`LocalTransport`]
#[derive(Default)]
pub struct LocalNetwork {
    peers: DashMap<String, Endpoint>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn contains(&self, address: &str) -> bool {
        self.peers.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn endpoint(&self, address: &str) -> Option<Endpoint> {
        self.peers.get(address.trim()).map(|r| r.value().clone())
    }

    /// Endpoints of every node except `address`. Cloned out so no map guard
    /// outlives the call.
    fn others(&self, address: &str) -> Vec<(String, Endpoint)> {
        self.peers
            .iter()
            .filter(|r| r.key() != address)
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect()
    }
}

/// In-process transport. Every node gets its own `LocalTransport` sharing one
/// [`LocalNetwork`].
#[derive(Clone)]
pub struct LocalTransport {
    address: String,
    network: Arc<LocalNetwork>,
}

impl LocalTransport {
    pub fn new(address: &str, network: Arc<LocalNetwork>) -> Arc<Self> {
        Arc::new(LocalTransport {
            address: address.to_string(),
            network,
        })
    }

    pub fn addr(&self) -> &str {
        &self.address
    }

    fn ensure_registered(&self) -> Result<Endpoint, TransportError> {
        self.network
            .endpoint(&self.address)
            .ok_or_else(|| TransportError::NotInitialized(self.address.clone()))
    }

    fn peer(&self, host: &str) -> Result<Endpoint, TransportError> {
        self.network
            .endpoint(host)
            .ok_or_else(|| TransportError::PeerNotFound(host.to_string()))
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn initialize(
        &self,
        tx_sink: Sender<Tx>,
        block_sink: Sender<Block>,
        store: Arc<dyn BlockStore>,
    ) -> Result<(), TransportError> {
        self.network.peers.insert(
            self.address.clone(),
            Endpoint {
                tx_sink,
                block_sink,
                store,
            },
        );
        debug!("[{}] joined local network", self.address);
        Ok(())
    }

    async fn broadcast_transaction(&self, tx: &Tx) -> Result<(), TransportError> {
        self.ensure_registered()?;

        let peers = self.network.others(&self.address);
        let tx = tx.clone();

        // Delivery happens off the caller's task: a full peer queue must not
        // stall the sender's dispatcher.
        tokio::spawn(async move {
            let sends = peers.into_iter().map(|(addr, peer)| {
                let tx = tx.clone();
                async move { peer.tx_sink.send(tx).await.map_err(|_| addr) }
            });
            for result in join_all(sends).await {
                if let Err(addr) = result {
                    error!("tx broadcast to {} failed", addr);
                }
            }
        });

        Ok(())
    }

    async fn broadcast_block(&self, block: &Block) -> Result<(), TransportError> {
        self.ensure_registered()?;

        let peers = self.network.others(&self.address);
        let block = block.clone();

        tokio::spawn(async move {
            let sends = peers.into_iter().map(|(addr, peer)| {
                let block = block.clone();
                async move { peer.block_sink.send(block).await.map_err(|_| addr) }
            });
            for result in join_all(sends).await {
                if let Err(addr) = result {
                    error!("block broadcast to {} failed", addr);
                }
            }
        });

        Ok(())
    }

    async fn request_blocks(&self, hashes: Vec<Hash>) -> Result<(), TransportError> {
        let own = self.ensure_registered()?;

        for hash in hashes {
            for (addr, peer) in self.network.others(&self.address) {
                let block = match peer.store.get(&hash) {
                    Ok(Some(block)) => block,
                    Ok(None) => continue,
                    Err(e) => {
                        error!("fetching {} from {}: {}", short_hash(&hash), addr, e);
                        continue;
                    }
                };

                debug!("[{}] fetched {} from {}", self.address, short_hash(&hash), addr);
                own.block_sink
                    .send(block)
                    .await
                    .map_err(|_| TransportError::SendFailed(self.address.clone()))?;
            }
        }

        Ok(())
    }

    async fn last_block(&self, host: &str) -> Result<Block, TransportError> {
        self.peer(host)?
            .store
            .last_block()?
            .ok_or_else(|| TransportError::EmptyChain(host.to_string()))
    }

    async fn first_block(&self, host: &str) -> Result<Block, TransportError> {
        self.peer(host)?
            .store
            .first_block()?
            .ok_or_else(|| TransportError::EmptyChain(host.to_string()))
    }
}
