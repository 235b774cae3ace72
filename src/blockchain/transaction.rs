use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::ops::Deref;

use super::crypto::{sha256, CryptoError, Hash, Signator, ZERO_HASH};

/// Errors that can occur during transaction operations
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Transaction already signed")]
    AlreadySigned,

    #[error("Transaction not signed")]
    NotSigned,

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
}

/// Header fields of a transaction covered by its hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxHeader {
    /// Hash of the transaction this one follows
    pub prev_hash: Hash,

    /// Public key of the signer
    pub source: Vec<u8>,

    /// Public key of the recipient
    pub destination: Vec<u8>,
}

/// A single ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tx {
    pub header: TxHeader,

    /// Signature over [`Tx::hash`], present once signed
    pub signature: Option<Vec<u8>>,

    /// Opaque payload
    pub data: Vec<u8>,
}

impl Tx {
    /// Creates a new unsigned transaction
    ///
    /// # Arguments
    ///
    /// * `prev_hash` - The hash of the transaction this one follows
    /// * `data` - The payload
    pub fn new(prev_hash: Hash, data: Vec<u8>) -> Self {
        Tx {
            header: TxHeader {
                prev_hash,
                source: Vec::new(),
                destination: Vec::new(),
            },
            signature: None,
            data,
        }
    }

    /// Sets the recipient's public key
    pub fn with_destination(mut self, destination: Vec<u8>) -> Self {
        self.header.destination = destination;
        self
    }

    pub fn prev_hash(&self) -> &Hash {
        &self.header.prev_hash
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// Hash of the payload
    pub fn data_hash(&self) -> Hash {
        sha256(&self.data)
    }

    /// Bytes covered by the transaction hash: data hash, previous hash, source
    /// and destination, in that order.
    pub fn hash_input(&self) -> Vec<u8> {
        let header = &self.header;
        let mut buf = Vec::with_capacity(
            2 * ZERO_HASH.len() + header.source.len() + header.destination.len(),
        );
        buf.extend_from_slice(&self.data_hash());
        buf.extend_from_slice(&header.prev_hash);
        buf.extend_from_slice(&header.source);
        buf.extend_from_slice(&header.destination);
        buf
    }

    /// Calculates the hash of the transaction. The signature is not included.
    pub fn hash(&self) -> Hash {
        sha256(&self.hash_input())
    }

    /// Signs the transaction
    ///
    /// Sets the source to the signer's public key and stores the signature over
    /// the resulting hash. On failure the transaction is left as it was.
    pub fn sign(&mut self, signer: &dyn Signator) -> Result<(), TransactionError> {
        if self.signature.is_some() {
            return Err(TransactionError::AlreadySigned);
        }

        let previous_source = std::mem::replace(&mut self.header.source, signer.public_key());

        match signer.sign(&self.hash()) {
            Ok(signature) => {
                self.signature = Some(signature);
                Ok(())
            }
            Err(err) => {
                self.header.source = previous_source;
                Err(TransactionError::CryptoError(err))
            }
        }
    }

    /// Verifies the signature against the source public key
    pub fn verify_signature(&self, verifier: &dyn Signator) -> Result<(), TransactionError> {
        let signature = match &self.signature {
            Some(sig) => sig,
            None => return Err(TransactionError::NotSigned),
        };

        verifier
            .verify(&self.header.source, signature, &self.hash())
            .map_err(TransactionError::from)
    }
}

/// Ordered list of transactions, kept in arrival order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxSlice(Vec<Tx>);

impl TxSlice {
    pub fn new() -> Self {
        TxSlice(Vec::new())
    }

    pub(crate) fn push(&mut self, tx: Tx) {
        self.0.push(tx);
    }

    pub fn into_inner(self) -> Vec<Tx> {
        self.0
    }

    /// Returns whether a transaction with the same hash is in the slice
    pub fn exists(&self, tx: &Tx) -> bool {
        let hash = tx.hash();
        self.0.iter().any(|t| t.hash() == hash)
    }

    /// Last transaction in the slice, if any
    pub fn last(&self) -> Option<&Tx> {
        self.0.last()
    }

    /// Merkle root over the transaction hashes.
    ///
    /// An empty slice yields [`ZERO_HASH`]. A level with an odd number of nodes
    /// pairs its last node with itself.
    pub fn merkle_root(&self) -> Hash {
        if self.0.is_empty() {
            return ZERO_HASH;
        }

        let mut nodes: Vec<Hash> = self.0.iter().map(Tx::hash).collect();
        let mut len = nodes.len();

        while len > 1 {
            let mut write = 0;
            let mut read = 0;

            while read < len {
                let left = nodes[read];
                let right = if read + 1 < len { nodes[read + 1] } else { left };

                let mut pair = [0u8; 64];
                pair[..32].copy_from_slice(&left);
                pair[32..].copy_from_slice(&right);
                nodes[write] = sha256(&pair);

                write += 1;
                read += 2;
            }

            len = write;
        }

        nodes[0]
    }

    /// Transactions of this slice missing from `other`, compared by signature.
    ///
    /// Both slices are assumed to share the same relative order: the search in
    /// `other` resumes from the last match, so reordered input yields extra
    /// entries.
    pub fn diff(&self, other: &TxSlice) -> TxSlice {
        let mut diff = TxSlice::new();
        let mut last_match = 0;

        for tx in &self.0 {
            let found = other.0[last_match..]
                .iter()
                .position(|candidate| candidate.signature == tx.signature);

            match found {
                Some(offset) => last_match += offset,
                None => diff.push(tx.clone()),
            }
        }

        diff
    }
}

impl Deref for TxSlice {
    type Target = [Tx];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<Tx>> for TxSlice {
    fn from(txs: Vec<Tx>) -> Self {
        TxSlice(txs)
    }
}

impl IntoIterator for TxSlice {
    type Item = Tx;
    type IntoIter = std::vec::IntoIter<Tx>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a TxSlice {
    type Item = &'a Tx;
    type IntoIter = std::slice::Iter<'a, Tx>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
