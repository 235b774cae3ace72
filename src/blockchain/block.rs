use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::crypto::{sha256, CryptoError, Hash, Signator, ZERO_HASH};
use super::pow::check_proof_of_work;
use super::transaction::{Tx, TxSlice};

/// Difficulty metadata carried by every header
pub const HIGHEST_TARGET: u32 = 0x1d00ffff;

/// Errors that can occur during block operations
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("Block already signed")]
    AlreadySigned,

    #[error("Block not signed: {0}")]
    NotSigned(String),

    #[error("Previous hash mismatch: expected {expected}, got {got}")]
    PrevHashMismatch { expected: String, got: String },

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
}

/// Block metadata covered by the block hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Hash of the previous block, zero for the genesis block
    pub prev_hash: Hash,

    /// Merkle root of the block's transactions
    pub merkle_root: Hash,

    /// Creation time in unix nanoseconds
    pub timestamp: i64,

    /// Proof of work counter
    pub nonce: u32,

    /// Difficulty metadata
    pub bits: u32,

    /// Public key of the node that mined the block
    pub origin: Vec<u8>,
}

impl BlockHeader {
    /// Encodes the header fields in hashing order
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 * self.prev_hash.len() + 16 + self.origin.len());
        buf.extend_from_slice(&self.prev_hash);
        buf.extend_from_slice(&self.merkle_root);
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.nonce.to_be_bytes());
        buf.extend_from_slice(&self.bits.to_be_bytes());
        buf.extend_from_slice(&self.origin);
        buf
    }

    pub fn hash(&self) -> Hash {
        sha256(&self.encode())
    }
}

/// An ordered batch of transactions linked to its predecessor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,

    transactions: TxSlice,

    /// Signature over the header hash
    signature: Option<Vec<u8>>,
}

fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

impl Block {
    /// Creates a new block
    ///
    /// # Arguments
    ///
    /// * `prev_hash` - The hash of the previous block
    /// * `transactions` - Initial transactions, taken as given
    pub fn new(prev_hash: Hash, transactions: impl Into<TxSlice>) -> Self {
        let transactions = transactions.into();
        let merkle_root = transactions.merkle_root();

        Block {
            header: BlockHeader {
                prev_hash,
                merkle_root,
                timestamp: now_nanos(),
                nonce: 0,
                bits: HIGHEST_TARGET,
                origin: Vec::new(),
            },
            transactions,
            signature: None,
        }
    }

    /// Creates the first block of a chain: zero previous hash and a single
    /// bootstrap transaction with an empty payload.
    pub fn genesis() -> Self {
        Block::new(ZERO_HASH, vec![Tx::new(ZERO_HASH, Vec::new())])
    }

    /// Replaces the transactions of an unsigned block, recomputing the root
    pub(crate) fn with_transactions(mut self, transactions: TxSlice) -> Self {
        self.header.merkle_root = transactions.merkle_root();
        self.transactions = transactions;
        self
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn transactions(&self) -> &TxSlice {
        &self.transactions
    }

    pub fn signature(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// Appends a transaction
    ///
    /// The transaction must follow the current last transaction. Slice and
    /// Merkle root are only updated together.
    pub fn add_transaction(&mut self, tx: Tx) -> Result<(), BlockError> {
        if self.signature.is_some() {
            return Err(BlockError::AlreadySigned);
        }

        if let Some(last) = self.transactions.last() {
            let expected = last.hash();
            if tx.header.prev_hash != expected {
                return Err(BlockError::PrevHashMismatch {
                    expected: hex::encode(expected),
                    got: hex::encode(tx.header.prev_hash),
                });
            }
        }

        let mut candidate = self.transactions.clone();
        candidate.push(tx);
        let merkle_root = candidate.merkle_root();

        self.transactions = candidate;
        self.header.merkle_root = merkle_root;

        Ok(())
    }

    /// Checks the proof of work and the Merkle root. The signature is checked
    /// separately by [`Block::verify_signature`].
    pub fn verify(&self, prefix: &[u8]) -> bool {
        self.transactions.merkle_root() == self.header.merkle_root
            && check_proof_of_work(prefix, &self.hash())
    }

    /// Verifies the signature against the origin public key
    pub fn verify_signature(&self, verifier: &dyn Signator) -> Result<(), BlockError> {
        let signature = match &self.signature {
            Some(sig) => sig,
            None => return Err(BlockError::NotSigned(hex::encode(self.hash()))),
        };

        verifier
            .verify(&self.header.origin, signature, &self.hash())
            .map_err(BlockError::from)
    }

    /// Signs the block
    ///
    /// Sets the origin to the signer's public key and signs the header hash.
    /// Once signed the block accepts no more transactions.
    pub fn sign(&mut self, signer: &dyn Signator) -> Result<(), BlockError> {
        if self.signature.is_some() {
            return Err(BlockError::AlreadySigned);
        }

        let previous_origin = std::mem::replace(&mut self.header.origin, signer.public_key());

        match signer.sign(&self.hash()) {
            Ok(signature) => {
                self.signature = Some(signature);
                Ok(())
            }
            Err(err) => {
                self.header.origin = previous_origin;
                Err(BlockError::CryptoError(err))
            }
        }
    }

    /// Resets the header before a fresh nonce search
    pub fn prepare_for_mining(&mut self) {
        self.header.merkle_root = self.transactions.merkle_root();
        self.header.nonce = 0;
        self.header.timestamp = now_nanos();
    }

    /// Performs a single proof of work attempt.
    ///
    /// Returns true if the current nonce satisfies `prefix`; otherwise advances
    /// the nonce and returns false.
    pub fn mine_step(&mut self, prefix: &[u8]) -> bool {
        if check_proof_of_work(prefix, &self.hash()) {
            return true;
        }

        self.header.nonce = self.header.nonce.wrapping_add(1);
        false
    }

    /// Searches nonces until the proof of work is satisfied. Returns the number
    /// of attempts.
    pub fn mine(&mut self, prefix: &[u8]) -> u64 {
        let mut attempts = 1;
        while !self.mine_step(prefix) {
            attempts += 1;
        }
        attempts
    }
}
