use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::block::{Block, BlockError};
use super::config::{Config, ConfigError};
use super::crypto::{encode_public_key, short_hash, CryptoError, Hash, Signator, ZERO_HASH};
use super::state::{StateError, StateMachine};
use super::storage::{BlockStore, StorageError};
use super::transaction::{TransactionError, Tx, TxSlice};
use super::transport::{Transport, TransportError};

/// Nonce attempts between two yields of the mining task
pub const MINING_YIELD_INTERVAL: u64 = 1024;

/// Recent blocks searched for an incoming transaction before it is re-queued
pub const DUPLICATE_LOOKBACK: usize = 16;

/// Errors that can occur during blockchain operations
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),

    #[error("Block error: {0}")]
    BlockError(#[from] BlockError),

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Transport error: {0}")]
    TransportError(#[from] TransportError),

    #[error("State machine error: {0}")]
    StateError(#[from] StateError),

    #[error("Config error: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("Invalid proof of work: {0}")]
    InvalidProofOfWork(String),

    #[error("Bootstrap failed: {0}")]
    BootstrapFailed(String),

    #[error("Blockchain already started")]
    AlreadyStarted,

    #[error("Queue closed")]
    QueueClosed,
}

/// What happened to a transaction handed to [`Blockchain::process_tx`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Added,
    Duplicate,
}

/// What happened to a block handed to [`Blockchain::process_block`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    Accepted,
    Duplicate,
    /// Builds on a stored block other than the head. Dropped.
    Diverged,
    /// Parent unknown. Held until the parent is fetched.
    Deferred,
}

struct Queues {
    txs: mpsc::Receiver<Tx>,
    blocks: mpsc::Receiver<Block>,
}

enum Wake {
    Changed,
    Elapsed,
    Stopped,
}

/// A single node's view of the chain
pub struct Blockchain {
    /// Signs mined blocks and created transactions; also verifies peers
    signator: Arc<dyn Signator>,

    /// Accepted blocks
    store: Arc<dyn BlockStore>,

    transport: Arc<dyn Transport>,

    /// Application hook run on every accepted block
    fsm: Arc<dyn StateMachine>,

    config: Config,

    /// Block under construction
    current: Mutex<Block>,

    /// Snapshots of the current block for the miner
    block_updates: watch::Sender<Block>,

    /// Deferred blocks keyed by their parent hash
    pending: Mutex<HashMap<Hash, Block>>,

    shutdown: watch::Sender<bool>,

    tx_sink: mpsc::Sender<Tx>,
    block_sink: mpsc::Sender<Block>,

    /// Taken by the first call to `run`
    queues: Mutex<Option<Queues>>,
}

impl Blockchain {
    /// Creates a node, registers it with the transport and bootstraps the store
    ///
    /// # Arguments
    ///
    /// * `signator` - Key of this node
    /// * `store` - Block store, possibly already holding a chain
    /// * `transport` - Network used to relay and fetch
    /// * `fsm` - State machine fed with every accepted block
    /// * `config` - Engine tunables
    /// * `peers` - Hosts asked for the chain head when the store is empty
    ///
    /// # Returns
    ///
    /// The node, ready to [`run`](Blockchain::run)
    pub async fn new(
        signator: Arc<dyn Signator>,
        store: Arc<dyn BlockStore>,
        transport: Arc<dyn Transport>,
        fsm: Arc<dyn StateMachine>,
        config: Config,
        peers: &[String],
    ) -> Result<Arc<Self>, BlockchainError> {
        config.validate()?;

        let (tx_sink, txs) = mpsc::channel(config.queue_capacity);
        let (block_sink, blocks) = mpsc::channel(config.queue_capacity);

        transport
            .initialize(tx_sink.clone(), block_sink.clone(), store.clone())
            .await?;

        Self::bootstrap(&*signator, &*store, &*transport, &*fsm, peers).await?;

        let mut first = store.new_block()?;
        first.header.origin = signator.public_key();

        let (block_updates, _) = watch::channel(first.clone());
        let (shutdown, _) = watch::channel(false);

        info!(
            "Node {} at height {} (head={})",
            encode_public_key(&first.header.origin),
            store.block_count()?,
            short_hash(&first.header.prev_hash)
        );

        Ok(Arc::new(Blockchain {
            signator,
            store,
            transport,
            fsm,
            config,
            current: Mutex::new(first),
            block_updates,
            pending: Mutex::new(HashMap::new()),
            shutdown,
            tx_sink,
            block_sink,
            queues: Mutex::new(Some(Queues { txs, blocks })),
        }))
    }

    async fn bootstrap(
        signator: &dyn Signator,
        store: &dyn BlockStore,
        transport: &dyn Transport,
        fsm: &dyn StateMachine,
        peers: &[String],
    ) -> Result<(), BlockchainError> {
        if let Some(last) = store.last_block()? {
            info!("Resuming chain at {}", short_hash(&last.hash()));
            return Ok(());
        }

        let block = if peers.is_empty() {
            let mut genesis = Block::genesis();
            genesis.sign(signator)?;
            info!("Created genesis block {}", short_hash(&genesis.hash()));
            genesis
        } else {
            let mut last_error = None;
            let mut found = None;

            for peer in peers {
                match transport.last_block(peer).await {
                    Ok(block) => {
                        info!("Bootstrapped from {} at {}", peer, short_hash(&block.hash()));
                        found = Some(block);
                        break;
                    }
                    Err(e) => {
                        warn!("Bootstrap from {} failed: {}", peer, e);
                        last_error = Some(e);
                    }
                }
            }

            match found {
                Some(block) => block,
                None => {
                    let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
                    return Err(BlockchainError::BootstrapFailed(reason));
                }
            }
        };

        fsm.apply(&block)?;
        store.add(block)?;
        Ok(())
    }

    fn lock_current(&self) -> MutexGuard<'_, Block> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<Hash, Block>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drains the transaction and block queues until [`Blockchain::shutdown`].
    /// Starts the miner first when mining is enabled.
    pub async fn run(self: Arc<Self>) -> Result<(), BlockchainError> {
        let Queues {
            mut txs,
            mut blocks,
        } = self
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(BlockchainError::AlreadyStarted)?;

        let mut shutdown = self.shutdown.subscribe();

        if self.config.mining {
            self.start_block_generation();
        }

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => continue,
                Some(tx) = txs.recv() => {
                    if let Err(e) = self.process_tx(tx).await {
                        warn!("Dropping transaction: {}", e);
                    }
                }
                Some(block) = blocks.recv() => {
                    match self.process_block(block).await {
                        Ok(outcome) => debug!("Block {:?}", outcome),
                        Err(e) => warn!("Dropping block: {}", e),
                    }
                }
            }
        }

        info!("Blockchain stopped");
        Ok(())
    }

    /// Runs the node on its own task
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<Result<(), BlockchainError>> {
        let chain = Arc::clone(self);
        tokio::spawn(chain.run())
    }

    /// Stops the dispatcher and the miner
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Handles one incoming transaction
    pub async fn process_tx(&self, tx: Tx) -> Result<TxOutcome, BlockchainError> {
        let in_current = self.lock_current().transactions().exists(&tx);
        if in_current || self.recently_included(&tx)? {
            debug!("Duplicate tx={}", short_hash(&tx.hash()));
            return Ok(TxOutcome::Duplicate);
        }

        tx.verify_signature(&*self.signator)?;

        if let Err(e) = self.transport.broadcast_transaction(&tx).await {
            error!("Broadcasting tx={}: {}", short_hash(&tx.hash()), e);
        }

        let snapshot = {
            let mut current = self.lock_current();
            current.add_transaction(tx)?;
            current.clone()
        };
        self.block_updates.send_replace(snapshot);

        Ok(TxOutcome::Added)
    }

    fn recently_included(&self, tx: &Tx) -> Result<bool, StorageError> {
        let mut cursor = self.store.last_block()?;

        for _ in 0..DUPLICATE_LOOKBACK {
            let Some(block) = cursor else {
                break;
            };
            if block.transactions().exists(tx) {
                return Ok(true);
            }
            if block.header.prev_hash == ZERO_HASH {
                break;
            }
            cursor = self.store.get(&block.header.prev_hash)?;
        }

        Ok(false)
    }

    /// Validates a block and merges it into the chain
    ///
    /// # Arguments
    ///
    /// * `block` - A block mined locally or received from a peer
    ///
    /// # Returns
    ///
    /// How the block was handled. Invalid blocks are returned as errors.
    pub async fn process_block(&self, block: Block) -> Result<BlockOutcome, BlockchainError> {
        if self.store.exists(&block)? {
            return Ok(BlockOutcome::Duplicate);
        }

        block.verify_signature(&*self.signator)?;
        if !block.verify(&self.config.pow_prefix) {
            return Err(BlockchainError::InvalidProofOfWork(hex::encode(block.hash())));
        }

        let head = self
            .store
            .last_block()?
            .map(|b| b.hash())
            .unwrap_or(ZERO_HASH);
        let parent = block.header.prev_hash;

        if parent != head {
            if self.store.get(&parent)?.is_some() {
                warn!(
                    "Chain may have diverged: blk={} extends {} but head is {}",
                    short_hash(&block.hash()),
                    short_hash(&parent),
                    short_hash(&head)
                );
                return Ok(BlockOutcome::Diverged);
            }

            self.defer(block);
            return Ok(BlockOutcome::Deferred);
        }

        let hash = block.hash();
        self.accept(block).await?;
        self.accept_deferred(hash).await?;

        self.prune_pending()?;
        Ok(BlockOutcome::Accepted)
    }

    /// Accepts the deferred descendants of a newly accepted block, in order
    async fn accept_deferred(&self, mut accepted: Hash) -> Result<(), BlockchainError> {
        loop {
            let next = self.lock_pending().remove(&accepted);
            let Some(child) = next else {
                break;
            };
            let hash = child.hash();
            if self.store.exists(&child)? {
                accepted = hash;
                continue;
            }

            if let Err(e) = self.accept(child).await {
                warn!("Dropping deferred blk={}: {}", short_hash(&hash), e);
                break;
            }
            accepted = hash;
        }

        Ok(())
    }

    /// Drops deferred blocks that can no longer extend the chain: their parent
    /// is stored but is not the head.
    fn prune_pending(&self) -> Result<(), StorageError> {
        let head = self
            .store
            .last_block()?
            .map(|b| b.hash())
            .unwrap_or(ZERO_HASH);

        let mut pending = self.lock_pending();
        let mut stale = Vec::new();
        for parent in pending.keys() {
            if *parent != head && self.store.get(parent)?.is_some() {
                stale.push(*parent);
            }
        }

        for parent in stale {
            if let Some(block) = pending.remove(&parent) {
                debug!("Pruned deferred blk={}", short_hash(&block.hash()));
            }
        }
        Ok(())
    }

    fn defer(&self, block: Block) {
        let parent = block.header.prev_hash;
        let hash = block.hash();

        {
            let mut pending = self.lock_pending();
            if pending.len() >= self.config.max_pending_blocks && !pending.contains_key(&parent) {
                // make room by evicting the oldest deferred block
                let oldest = pending
                    .iter()
                    .min_by_key(|(_, b)| b.header.timestamp)
                    .map(|(key, _)| *key);
                if let Some(key) = oldest {
                    pending.remove(&key);
                    warn!("Pending pool full, evicted block deferred on {}", short_hash(&key));
                }
            }
            if self.config.max_pending_blocks > 0 {
                pending.insert(parent, block);
            }
        }

        info!(
            "Missing blocks before blk={}, requesting {}",
            short_hash(&hash),
            short_hash(&parent)
        );

        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            if let Err(e) = transport.request_blocks(vec![parent]).await {
                error!("Requesting {}: {}", short_hash(&parent), e);
            }
        });
    }

    async fn accept(&self, block: Block) -> Result<(), BlockchainError> {
        self.fsm.apply(&block)?;
        self.store.add(block.clone())?;

        info!(
            "Added blk={} prev={} tx={} origin={}",
            short_hash(&block.hash()),
            short_hash(&block.header.prev_hash),
            block.transactions().len(),
            encode_public_key(&block.header.origin)
        );

        if let Err(e) = self.transport.broadcast_block(&block).await {
            error!("Broadcasting blk={}: {}", short_hash(&block.hash()), e);
        }

        let snapshot = {
            let mut current = self.lock_current();

            let carried = if current.header.merkle_root != block.header.merkle_root {
                debug!("Transactions differ, calculating diff");
                current.transactions().diff(block.transactions())
            } else {
                TxSlice::new()
            };

            let mut next = self.store.new_block()?.with_transactions(carried);
            next.header.origin = self.signator.public_key();
            *current = next;
            current.clone()
        };
        self.block_updates.send_replace(snapshot);

        Ok(())
    }

    /// Spawns the mining loop. It works on private copies of the current block
    /// and submits solved blocks to this node's block queue.
    pub fn start_block_generation(self: &Arc<Self>) -> JoinHandle<()> {
        let chain = Arc::clone(self);
        tokio::spawn(chain.generate_blocks())
    }

    async fn generate_blocks(self: Arc<Self>) {
        let mut updates = self.block_updates.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        let prefix = self.config.pow_prefix.clone();
        let poll = self.config.tx_poll_interval();

        let mut block = updates.borrow_and_update().clone();

        'restart: loop {
            block.prepare_for_mining();
            debug!(
                "[pow] begin prev={} tx={}",
                short_hash(&block.header.prev_hash),
                block.transactions().len()
            );

            let mut attempts: u64 = 0;
            loop {
                let stopping = *shutdown.borrow();
                if stopping {
                    return;
                }
                if updates.has_changed().unwrap_or(false) {
                    block = updates.borrow_and_update().clone();
                    continue 'restart;
                }

                if !block.transactions().is_empty() {
                    if !block.mine_step(&prefix) {
                        attempts += 1;
                        if attempts % MINING_YIELD_INTERVAL == 0 {
                            tokio::task::yield_now().await;
                        }
                        continue;
                    }

                    if !block.is_signed() {
                        match block.sign(&*self.signator) {
                            Ok(()) => info!(
                                "[pow] found blk={} nonce={} tx={}",
                                short_hash(&block.hash()),
                                block.header.nonce,
                                block.transactions().len()
                            ),
                            Err(e) => error!("[pow] signing failed: {}", e),
                        }
                    }

                    if block.is_signed() {
                        tokio::select! {
                            sent = self.block_sink.send(block.clone()) => {
                                if sent.is_err() {
                                    return;
                                }
                            }
                            _ = shutdown.changed() => return,
                        }
                    }
                }

                match Self::rest(&mut updates, &mut shutdown, poll).await {
                    Wake::Changed => {
                        block = updates.borrow_and_update().clone();
                        continue 'restart;
                    }
                    Wake::Elapsed => {}
                    Wake::Stopped => return,
                }
            }
        }
    }

    async fn rest(
        updates: &mut watch::Receiver<Block>,
        shutdown: &mut watch::Receiver<bool>,
        poll: Duration,
    ) -> Wake {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_ok() { Wake::Changed } else { Wake::Stopped }
            }
            _ = shutdown.changed() => Wake::Stopped,
            _ = tokio::time::sleep(poll) => Wake::Elapsed,
        }
    }

    /// Queues transactions for the dispatcher
    pub async fn queue_transactions(&self, txs: Vec<Tx>) -> Result<(), BlockchainError> {
        for tx in txs {
            self.tx_sink
                .send(tx)
                .await
                .map_err(|_| BlockchainError::QueueClosed)?;
        }
        Ok(())
    }

    /// Queues a block for the dispatcher
    pub async fn queue_block(&self, block: Block) -> Result<(), BlockchainError> {
        self.block_sink
            .send(block)
            .await
            .map_err(|_| BlockchainError::QueueClosed)
    }

    /// Builds a transaction signed with this node's key
    pub fn create_transaction(&self, prev_hash: Hash, data: Vec<u8>) -> Result<Tx, BlockchainError> {
        let mut tx = Tx::new(prev_hash, data);
        tx.sign(&*self.signator)?;
        Ok(tx)
    }

    /// Creates a transaction and queues it
    pub async fn submit_transaction(&self, prev_hash: Hash, data: Vec<u8>) -> Result<Tx, BlockchainError> {
        let tx = self.create_transaction(prev_hash, data)?;
        self.queue_transactions(vec![tx.clone()]).await?;
        Ok(tx)
    }

    /// Snapshot of the block under construction
    pub fn current_block(&self) -> Block {
        self.lock_current().clone()
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    pub fn last_block(&self) -> Result<Option<Block>, BlockchainError> {
        Ok(self.store.last_block()?)
    }

    pub fn block_count(&self) -> Result<u64, BlockchainError> {
        Ok(self.store.block_count()?)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn public_key(&self) -> Vec<u8> {
        self.signator.public_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::Ed25519Signator;
    use crate::blockchain::state::TxIndex;
    use crate::blockchain::storage::InMemBlockStore;
    use crate::blockchain::transport::{LocalNetwork, LocalTransport};
    use async_trait::async_trait;
    use tokio::time::sleep;

    #[derive(Default)]
    struct RecordingTransport {
        fail_broadcasts: bool,
        requested: Mutex<Vec<Hash>>,
        broadcast_blocks: Mutex<Vec<Hash>>,
    }

    impl RecordingTransport {
        fn requested(&self) -> Vec<Hash> {
            self.requested.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn initialize(
            &self,
            _tx_sink: mpsc::Sender<Tx>,
            _block_sink: mpsc::Sender<Block>,
            _store: Arc<dyn BlockStore>,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        async fn broadcast_transaction(&self, _tx: &Tx) -> Result<(), TransportError> {
            if self.fail_broadcasts {
                return Err(TransportError::SendFailed("test".to_string()));
            }
            Ok(())
        }

        async fn broadcast_block(&self, block: &Block) -> Result<(), TransportError> {
            if self.fail_broadcasts {
                return Err(TransportError::SendFailed("test".to_string()));
            }
            self.broadcast_blocks.lock().unwrap().push(block.hash());
            Ok(())
        }

        async fn request_blocks(&self, hashes: Vec<Hash>) -> Result<(), TransportError> {
            self.requested.lock().unwrap().extend(hashes);
            Ok(())
        }

        async fn last_block(&self, host: &str) -> Result<Block, TransportError> {
            Err(TransportError::PeerNotFound(host.to_string()))
        }

        async fn first_block(&self, host: &str) -> Result<Block, TransportError> {
            Err(TransportError::PeerNotFound(host.to_string()))
        }
    }

    /// Rejects blocks carrying a transaction with the payload `veto`
    struct Veto;

    impl StateMachine for Veto {
        fn apply(&self, block: &Block) -> Result<(), StateError> {
            if block.transactions().iter().any(|tx| tx.data == b"veto") {
                return Err(StateError::Rejected("vetoed".to_string()));
            }
            Ok(())
        }
    }

    fn test_config() -> Config {
        Config {
            pow_prefix: Vec::new(),
            tx_poll_interval_ms: 20,
            mining: false,
            ..Config::default()
        }
    }

    async fn test_chain(
        transport: Arc<RecordingTransport>,
        fsm: Arc<dyn StateMachine>,
        config: Config,
    ) -> Arc<Blockchain> {
        Blockchain::new(
            Arc::new(Ed25519Signator::generate()),
            Arc::new(InMemBlockStore::new()),
            transport,
            fsm,
            config,
            &[],
        )
        .await
        .unwrap()
    }

    fn signed_tx(signator: &Ed25519Signator, prev_hash: Hash, data: &[u8]) -> Tx {
        let mut tx = Tx::new(prev_hash, data.to_vec());
        tx.sign(signator).unwrap();
        tx
    }

    fn peer_block(signator: &Ed25519Signator, prev_hash: Hash, txs: Vec<Tx>) -> Block {
        let mut block = Block::new(prev_hash, txs);
        block.header.origin = signator.public_key();
        block.mine(&[]);
        block.sign(signator).unwrap();
        block
    }

    fn head(chain: &Blockchain) -> Hash {
        chain.last_block().unwrap().unwrap().hash()
    }

    async fn wait_until<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..500 {
            if check() {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_new_creates_genesis() {
        let index = TxIndex::new();
        let chain = test_chain(Arc::default(), Arc::new(index.clone()), test_config()).await;

        assert_eq!(chain.block_count().unwrap(), 1);
        let genesis = chain.last_block().unwrap().unwrap();
        assert_eq!(genesis.header.prev_hash, ZERO_HASH);
        assert_eq!(genesis.header.origin, chain.public_key());
        assert_eq!(index.len(), 1);

        let current = chain.current_block();
        assert_eq!(current.header.prev_hash, genesis.hash());
        assert_eq!(current.header.origin, chain.public_key());
        assert!(current.transactions().is_empty());
    }

    #[tokio::test]
    async fn test_process_tx() {
        let chain = test_chain(Arc::default(), Arc::new(TxIndex::new()), test_config()).await;
        let mut updates = chain.block_updates.subscribe();

        let tx = chain.create_transaction(ZERO_HASH, b"one".to_vec()).unwrap();
        assert_eq!(chain.process_tx(tx.clone()).await.unwrap(), TxOutcome::Added);
        assert!(updates.has_changed().unwrap());
        assert_eq!(updates.borrow_and_update().transactions().len(), 1);

        assert_eq!(chain.process_tx(tx).await.unwrap(), TxOutcome::Duplicate);
        assert!(!updates.has_changed().unwrap());

        let unsigned = Tx::new(ZERO_HASH, b"unsigned".to_vec());
        assert!(matches!(
            chain.process_tx(unsigned).await,
            Err(BlockchainError::TransactionError(TransactionError::NotSigned))
        ));

        let orphan = chain.create_transaction([4u8; 32], b"orphan".to_vec()).unwrap();
        assert!(matches!(
            chain.process_tx(orphan).await,
            Err(BlockchainError::BlockError(BlockError::PrevHashMismatch { .. }))
        ));
        assert_eq!(chain.current_block().transactions().len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_failure_is_not_fatal() {
        let transport = Arc::new(RecordingTransport {
            fail_broadcasts: true,
            ..Default::default()
        });
        let chain = test_chain(transport, Arc::new(TxIndex::new()), test_config()).await;
        let peer = Ed25519Signator::generate();

        let tx = signed_tx(&peer, ZERO_HASH, b"one");
        assert_eq!(chain.process_tx(tx.clone()).await.unwrap(), TxOutcome::Added);

        let block = peer_block(&peer, head(&chain), vec![tx]);
        assert_eq!(chain.process_block(block).await.unwrap(), BlockOutcome::Accepted);
    }

    #[tokio::test]
    async fn test_accepted_block_carries_missing_transactions() {
        let transport = Arc::new(RecordingTransport::default());
        let index = TxIndex::new();
        let chain = test_chain(transport.clone(), Arc::new(index.clone()), test_config()).await;
        let peer = Ed25519Signator::generate();

        let first = signed_tx(&peer, ZERO_HASH, b"one");
        let second = signed_tx(&peer, first.hash(), b"two");
        chain.process_tx(first.clone()).await.unwrap();
        chain.process_tx(second.clone()).await.unwrap();

        let block = peer_block(&peer, head(&chain), vec![first.clone()]);
        assert_eq!(
            chain.process_block(block.clone()).await.unwrap(),
            BlockOutcome::Accepted
        );

        assert_eq!(chain.block_count().unwrap(), 2);
        assert_eq!(head(&chain), block.hash());
        assert_eq!(index.block_of(&first.hash()), Some(block.hash()));
        assert_eq!(transport.broadcast_blocks.lock().unwrap().clone(), vec![block.hash()]);

        let current = chain.current_block();
        assert_eq!(current.header.prev_hash, block.hash());
        assert_eq!(current.transactions().to_vec(), vec![second.clone()]);
        assert_eq!(current.header.merkle_root, second.hash());

        // already on chain
        assert_eq!(chain.process_tx(first).await.unwrap(), TxOutcome::Duplicate);
    }

    #[tokio::test]
    async fn test_state_machine_veto_leaves_state_unchanged() {
        let chain = test_chain(Arc::default(), Arc::new(Veto), test_config()).await;
        let peer = Ed25519Signator::generate();

        let tx = signed_tx(&peer, ZERO_HASH, b"keep");
        chain.process_tx(tx.clone()).await.unwrap();
        let before = chain.current_block();

        let block = peer_block(&peer, head(&chain), vec![signed_tx(&peer, ZERO_HASH, b"veto")]);
        assert!(matches!(
            chain.process_block(block).await,
            Err(BlockchainError::StateError(StateError::Rejected(_)))
        ));

        assert_eq!(chain.block_count().unwrap(), 1);
        assert_eq!(chain.current_block(), before);
    }

    #[tokio::test]
    async fn test_invalid_blocks_are_rejected() {
        let config = Config {
            pow_prefix: vec![0; 33],
            ..test_config()
        };
        let chain = test_chain(Arc::default(), Arc::new(TxIndex::new()), config).await;
        let peer = Ed25519Signator::generate();
        let tx = signed_tx(&peer, ZERO_HASH, b"one");

        let block = peer_block(&peer, head(&chain), vec![tx.clone()]);
        assert!(matches!(
            chain.process_block(block).await,
            Err(BlockchainError::InvalidProofOfWork(_))
        ));

        let unsigned = Block::new(head(&chain), vec![tx]);
        assert!(matches!(
            chain.process_block(unsigned).await,
            Err(BlockchainError::BlockError(BlockError::NotSigned(_)))
        ));
        assert_eq!(chain.block_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_and_diverged_blocks() {
        let chain = test_chain(Arc::default(), Arc::new(TxIndex::new()), test_config()).await;
        let peer = Ed25519Signator::generate();
        let genesis = head(&chain);

        let block = peer_block(&peer, genesis, vec![signed_tx(&peer, ZERO_HASH, b"one")]);
        assert_eq!(
            chain.process_block(block.clone()).await.unwrap(),
            BlockOutcome::Accepted
        );
        assert_eq!(chain.process_block(block).await.unwrap(), BlockOutcome::Duplicate);

        let rival = peer_block(&peer, genesis, vec![signed_tx(&peer, ZERO_HASH, b"two")]);
        assert_eq!(chain.process_block(rival.clone()).await.unwrap(), BlockOutcome::Diverged);
        assert_eq!(chain.block_count().unwrap(), 2);
        assert!(!chain.store().exists(&rival).unwrap());
    }

    #[tokio::test]
    async fn test_unknown_parent_requests_fetch() {
        let transport = Arc::new(RecordingTransport::default());
        let chain = test_chain(transport.clone(), Arc::new(TxIndex::new()), test_config()).await;
        let peer = Ed25519Signator::generate();

        let missing = [9u8; 32];
        let block = peer_block(&peer, missing, vec![signed_tx(&peer, ZERO_HASH, b"late")]);

        assert_eq!(
            chain.process_block(block.clone()).await.unwrap(),
            BlockOutcome::Deferred
        );
        assert!(!chain.store().exists(&block).unwrap());
        assert_eq!(chain.block_count().unwrap(), 1);
        assert!(wait_until(|| transport.requested() == vec![missing]).await);
    }

    #[tokio::test]
    async fn test_deferred_blocks_follow_their_parent() {
        let index = TxIndex::new();
        let chain = test_chain(Arc::default(), Arc::new(index.clone()), test_config()).await;
        let peer = Ed25519Signator::generate();

        let first_tx = signed_tx(&peer, ZERO_HASH, b"one");
        let second_tx = signed_tx(&peer, first_tx.hash(), b"two");
        let first = peer_block(&peer, head(&chain), vec![first_tx]);
        let second = peer_block(&peer, first.hash(), vec![second_tx.clone()]);

        assert_eq!(
            chain.process_block(second.clone()).await.unwrap(),
            BlockOutcome::Deferred
        );
        assert_eq!(chain.pending.lock().unwrap().len(), 1);

        assert_eq!(chain.process_block(first).await.unwrap(), BlockOutcome::Accepted);
        assert_eq!(chain.block_count().unwrap(), 3);
        assert_eq!(head(&chain), second.hash());
        assert_eq!(index.block_of(&second_tx.hash()), Some(second.hash()));
        assert!(chain.pending.lock().unwrap().is_empty());
        assert_eq!(chain.current_block().header.prev_hash, second.hash());
    }

    #[tokio::test]
    async fn test_stored_deferred_block_still_releases_its_child() {
        let chain = test_chain(Arc::default(), Arc::new(TxIndex::new()), test_config()).await;
        let peer = Ed25519Signator::generate();

        let first = peer_block(&peer, head(&chain), vec![signed_tx(&peer, ZERO_HASH, b"one")]);
        let second = peer_block(&peer, first.hash(), vec![signed_tx(&peer, ZERO_HASH, b"two")]);
        let third = peer_block(&peer, second.hash(), vec![signed_tx(&peer, ZERO_HASH, b"three")]);

        chain.process_block(first.clone()).await.unwrap();
        // second reached the store by another path while still deferred
        chain.store().add(second.clone()).unwrap();
        {
            let mut pending = chain.pending.lock().unwrap();
            pending.insert(first.hash(), second.clone());
            pending.insert(second.hash(), third.clone());
        }

        chain.accept_deferred(first.hash()).await.unwrap();

        assert_eq!(head(&chain), third.hash());
        assert_eq!(chain.block_count().unwrap(), 4);
        assert!(chain.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_deferred_blocks_are_pruned() {
        let chain = test_chain(Arc::default(), Arc::new(TxIndex::new()), test_config()).await;
        let peer = Ed25519Signator::generate();
        let genesis = head(&chain);

        // deferred on a block that is about to stop being the head
        let orphan = peer_block(&peer, genesis, vec![signed_tx(&peer, ZERO_HASH, b"stale")]);
        chain.pending.lock().unwrap().insert(genesis, orphan);

        let block = peer_block(&peer, genesis, vec![signed_tx(&peer, ZERO_HASH, b"one")]);
        assert_eq!(chain.process_block(block).await.unwrap(), BlockOutcome::Accepted);
        assert!(chain.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_full_pending_pool_evicts_oldest() {
        let config = Config {
            max_pending_blocks: 2,
            ..test_config()
        };
        let chain = test_chain(Arc::default(), Arc::new(TxIndex::new()), config).await;
        let peer = Ed25519Signator::generate();

        let mut deferred = Vec::new();
        for i in 1..=3u8 {
            let block = peer_block(&peer, [i; 32], vec![signed_tx(&peer, ZERO_HASH, &[i])]);
            assert_eq!(
                chain.process_block(block.clone()).await.unwrap(),
                BlockOutcome::Deferred
            );
            deferred.push(block);
        }

        let pending = chain.pending.lock().unwrap();
        assert_eq!(pending.len(), 2);
        assert!(!pending.contains_key(&[1u8; 32]));
        assert_eq!(pending.get(&[3u8; 32]), Some(&deferred[2]));
    }

    #[tokio::test]
    async fn test_zero_queue_capacity_fails_construction() {
        let config = Config {
            queue_capacity: 0,
            ..test_config()
        };
        let result = Blockchain::new(
            Arc::new(Ed25519Signator::generate()),
            Arc::new(InMemBlockStore::new()),
            Arc::new(RecordingTransport::default()),
            Arc::new(TxIndex::new()),
            config,
            &[],
        )
        .await;

        assert!(matches!(
            result,
            Err(BlockchainError::ConfigError(ConfigError::Invalid(_)))
        ));
    }

    #[tokio::test]
    async fn test_new_work_interrupts_a_resting_miner() {
        let config = Config {
            pow_prefix: vec![0],
            tx_poll_interval_ms: 60_000,
            mining: true,
            ..test_config()
        };
        let chain = test_chain(Arc::default(), Arc::new(TxIndex::new()), config).await;
        let handle = chain.spawn();
        let started = tokio::time::Instant::now();

        let first = chain
            .submit_transaction(ZERO_HASH, b"first".to_vec())
            .await
            .unwrap();
        assert!(wait_until(|| chain.block_count().unwrap() == 2).await);

        chain
            .submit_transaction(first.hash(), b"second".to_vec())
            .await
            .unwrap();
        assert!(wait_until(|| chain.block_count().unwrap() == 3).await);

        // the miner only rests on the timer when nothing changes
        assert!(started.elapsed() < Duration::from_secs(30));

        chain.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_idle_miner_submits_nothing() {
        let transport = Arc::new(RecordingTransport::default());
        let config = Config {
            mining: true,
            ..test_config()
        };
        let chain = test_chain(transport.clone(), Arc::new(TxIndex::new()), config).await;
        let handle = chain.spawn();

        sleep(Duration::from_millis(200)).await;

        assert_eq!(chain.block_count().unwrap(), 1);
        assert!(transport.broadcast_blocks.lock().unwrap().is_empty());
        assert!(chain.current_block().transactions().is_empty());

        chain.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_twice_fails() {
        let chain = test_chain(Arc::default(), Arc::new(TxIndex::new()), test_config()).await;

        chain.shutdown();
        chain.clone().run().await.unwrap();
        assert!(matches!(
            chain.clone().run().await,
            Err(BlockchainError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_mining_loop_produces_blocks() {
        let config = Config {
            pow_prefix: vec![0],
            mining: true,
            ..test_config()
        };
        let index = TxIndex::new();
        let chain = test_chain(Arc::default(), Arc::new(index.clone()), config).await;
        let handle = chain.spawn();

        let tx = chain
            .submit_transaction(ZERO_HASH, b"mined".to_vec())
            .await
            .unwrap();

        assert!(wait_until(|| chain.block_count().unwrap() == 2).await);

        let block = chain.last_block().unwrap().unwrap();
        assert_eq!(block.hash()[0], 0);
        assert!(block.verify(&[0]));
        assert_eq!(block.header.origin, chain.public_key());
        assert!(index.contains(&tx.hash()));

        chain.shutdown();
        handle.await.unwrap().unwrap();
    }

    async fn local_node(
        address: &str,
        network: &Arc<LocalNetwork>,
        config: Config,
        peers: &[String],
    ) -> Result<(Arc<Blockchain>, TxIndex), BlockchainError> {
        let index = TxIndex::new();
        let chain = Blockchain::new(
            Arc::new(Ed25519Signator::generate()),
            Arc::new(InMemBlockStore::new()),
            LocalTransport::new(address, network.clone()),
            Arc::new(index.clone()),
            config,
            peers,
        )
        .await?;
        Ok((chain, index))
    }

    #[tokio::test]
    async fn test_bootstrap_from_peer() {
        let network = LocalNetwork::new();
        let (a, _) = local_node("a", &network, test_config(), &[]).await.unwrap();
        let (b, _) = local_node("b", &network, test_config(), &["ghost".to_string(), "a".to_string()])
            .await
            .unwrap();

        let first = b.store().first_block().unwrap().unwrap();
        assert_eq!(first.hash(), head(&a));
        assert_eq!(b.current_block().header.prev_hash, head(&a));

        let result = local_node("c", &network, test_config(), &["ghost".to_string()]).await;
        assert!(matches!(result, Err(BlockchainError::BootstrapFailed(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_two_nodes_converge() {
        let network = LocalNetwork::new();
        let miner = Config {
            pow_prefix: vec![0],
            mining: true,
            ..test_config()
        };
        let observer = Config {
            pow_prefix: vec![0],
            ..test_config()
        };

        let (a, index_a) = local_node("a", &network, miner, &[]).await.unwrap();
        let (b, index_b) = local_node("b", &network, observer, &["a".to_string()])
            .await
            .unwrap();
        let handle_a = a.spawn();
        let handle_b = b.spawn();

        let genesis_tx = a.store().last_tx().unwrap().unwrap();
        let mut prev = genesis_tx.hash();
        let mut hashes = Vec::new();
        for i in 0..3 {
            let tx = a.create_transaction(prev, format!("tx-{}", i).into_bytes()).unwrap();
            prev = tx.hash();
            hashes.push(tx.hash());
            a.queue_transactions(vec![tx.clone()]).await.unwrap();
            b.queue_transactions(vec![tx]).await.unwrap();
        }

        let converged = wait_until(|| {
            let all_indexed = hashes
                .iter()
                .all(|h| index_a.contains(h) && index_b.contains(h));
            all_indexed
                && head(&a) == head(&b)
                && a.block_count().unwrap() == b.block_count().unwrap()
        })
        .await;
        assert!(converged);

        a.shutdown();
        b.shutdown();
        handle_a.await.unwrap().unwrap();
        handle_b.await.unwrap().unwrap();
    }
}
