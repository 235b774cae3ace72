use anyhow::{Context, Result};
use log::{info, warn};
use tokio::time::{sleep, Instant};

use std::sync::Arc;
use std::time::Duration;

use peerchain::blockchain::crypto::{encode_public_key, short_hash};
use peerchain::blockchain::{
    BlockStore, Blockchain, Config, Ed25519Signator, Hash, InMemBlockStore, LocalNetwork,
    LocalTransport, SledBlockStore, TxIndex, ZERO_HASH,
};

const DATA_DIR: &str = "data/blockchain";
const CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(60);

fn load_config() -> Result<Config> {
    match std::env::var("PEERCHAIN_CONFIG") {
        Ok(path) => {
            let config = Config::from_file(&path)
                .with_context(|| format!("loading config from {}", path))?;
            info!("Loaded config from {}", path);
            Ok(config)
        }
        Err(_) => Ok(Config::default()),
    }
}

// Open the persistent store, or fall back to memory
fn open_store() -> Arc<dyn BlockStore> {
    std::fs::create_dir_all(DATA_DIR).unwrap_or_else(|e| {
        warn!("Failed to create data directory: {}", e);
    });

    match SledBlockStore::new(DATA_DIR) {
        Ok(store) => {
            info!("Opened block store at {}", DATA_DIR);
            Arc::new(store)
        }
        Err(err) => {
            warn!("Failed to open block store: {}", err);
            warn!("Using in-memory block store instead");
            Arc::new(InMemBlockStore::new())
        }
    }
}

fn log_chain(name: &str, store: &dyn BlockStore, limit: usize) -> Result<()> {
    info!("{} holds {} blocks", name, store.block_count()?);

    let mut cursor = store.last_block()?;
    for _ in 0..limit {
        let Some(block) = cursor else {
            break;
        };
        info!(
            "  blk={} prev={} nonce={} tx={} origin={}",
            short_hash(&block.hash()),
            short_hash(&block.header.prev_hash),
            block.header.nonce,
            block.transactions().len(),
            encode_public_key(&block.header.origin)
        );
        cursor = store.get(&block.header.prev_hash)?;
    }
    Ok(())
}

fn head(chain: &Blockchain) -> Result<Option<Hash>> {
    Ok(chain.last_block()?.map(|block| block.hash()))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = load_config()?;
    let network = LocalNetwork::new();

    let miner_index = TxIndex::new();
    let miner = Blockchain::new(
        Arc::new(Ed25519Signator::generate()),
        open_store(),
        LocalTransport::new("node-a", network.clone()),
        Arc::new(miner_index.clone()),
        config.clone(),
        &[],
    )
    .await
    .context("starting node-a")?;

    let observer_index = TxIndex::new();
    let observer = Blockchain::new(
        Arc::new(Ed25519Signator::generate()),
        Arc::new(InMemBlockStore::new()),
        LocalTransport::new("node-b", network.clone()),
        Arc::new(observer_index.clone()),
        Config {
            mining: false,
            ..config
        },
        &["node-a".to_string()],
    )
    .await
    .context("starting node-b")?;

    let handles = [miner.spawn(), observer.spawn()];

    let mut prev = miner
        .store()
        .last_tx()?
        .map(|tx| tx.hash())
        .unwrap_or(ZERO_HASH);
    let mut submitted = Vec::new();
    for i in 0..3 {
        let tx = miner
            .submit_transaction(prev, format!("payment #{}", i).into_bytes())
            .await?;
        info!("Submitted tx={}", short_hash(&tx.hash()));
        prev = tx.hash();
        submitted.push(tx.hash());
    }

    let deadline = Instant::now() + CONVERGENCE_TIMEOUT;
    loop {
        let indexed = submitted
            .iter()
            .all(|hash| miner_index.contains(hash) && observer_index.contains(hash));
        if indexed && head(&miner)? == head(&observer)? {
            info!("Nodes converged");
            break;
        }
        if Instant::now() >= deadline {
            warn!("Nodes did not converge within {:?}", CONVERGENCE_TIMEOUT);
            break;
        }
        sleep(Duration::from_millis(200)).await;
    }

    log_chain("node-a", miner.store().as_ref(), 10)?;
    log_chain("node-b", observer.store().as_ref(), 10)?;

    miner.shutdown();
    observer.shutdown();
    for handle in handles {
        handle.await??;
    }

    Ok(())
}
