// Blockchain module
//
// This module contains the ledger engine:
// - Transactions and blocks
// - Proof of work
// - Block storage
// - Transport contract and an in-process network
// - State machine hook
// - The chain engine tying them together

pub mod block;
pub mod chain;
pub mod config;
pub mod crypto;
pub mod pow;
pub mod state;
pub mod storage;
pub mod transaction;
pub mod transport;

// Re-export main components for easier access
pub use block::{Block, BlockHeader};
pub use chain::{BlockOutcome, Blockchain, BlockchainError, TxOutcome};
pub use config::Config;
pub use crypto::{Ed25519Signator, Hash, Signator, ZERO_HASH};
pub use state::{StateMachine, TxIndex};
pub use storage::{BlockStore, InMemBlockStore, SledBlockStore};
pub use transaction::{Tx, TxSlice};
pub use transport::{LocalNetwork, LocalTransport, Transport};
