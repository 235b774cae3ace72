use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;

use std::fmt;

/// Size in bytes of every hash used by the ledger
pub const HASH_SIZE: usize = 32;

/// A SHA-256 digest
pub type Hash = [u8; HASH_SIZE];

/// The all-zero hash. Parent of the genesis block and root of an empty transaction set.
pub const ZERO_HASH: Hash = [0u8; HASH_SIZE];

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Failed to sign message: {0}")]
    SigningError(String),

    #[error("Failed to verify signature: {0}")]
    VerificationError(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
}

/// Hashes the given bytes with SHA-256
pub fn sha256(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Signing and verification over raw hashes.
///
/// The binary format of keys and signatures belongs to the implementation; the
/// ledger only ever stores and compares the raw bytes.
pub trait Signator: Send + Sync {
    /// Signs the given hash
    fn sign(&self, hash: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Public key used as transaction source and block origin
    fn public_key(&self) -> Vec<u8>;

    /// Verifies `signature` over `hash` for the holder of `public_key`
    fn verify(&self, public_key: &[u8], signature: &[u8], hash: &[u8]) -> Result<(), CryptoError>;
}

/// Ed25519 keypair implementing [`Signator`]
#[derive(Clone)]
pub struct Ed25519Signator {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl fmt::Debug for Ed25519Signator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519Signator")
            .field("public_key", &encode_public_key(self.verifying_key.as_bytes()))
            .finish()
    }
}

impl Ed25519Signator {
    /// Creates a signator with a random keypair
    pub fn generate() -> Self {
        let mut csprng = OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        let verifying_key = VerifyingKey::from(&signing_key);

        Ed25519Signator {
            signing_key,
            verifying_key,
        }
    }

    /// Creates a signator from an existing 32 byte secret key
    pub fn from_secret_key(secret_key_bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes_array: [u8; 32] = secret_key_bytes.try_into().map_err(|_| {
            CryptoError::InvalidPrivateKey("Invalid private key length".to_string())
        })?;

        let signing_key = SigningKey::from_bytes(&bytes_array);
        let verifying_key = VerifyingKey::from(&signing_key);

        Ok(Ed25519Signator {
            signing_key,
            verifying_key,
        })
    }

    /// Exports the secret key as bytes
    pub fn export_secret_key(&self) -> Vec<u8> {
        self.signing_key.to_bytes().to_vec()
    }
}

impl Signator for Ed25519Signator {
    fn sign(&self, hash: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let signature = self
            .signing_key
            .try_sign(hash)
            .map_err(|e| CryptoError::SigningError(e.to_string()))?;
        Ok(signature.to_bytes().to_vec())
    }

    fn public_key(&self) -> Vec<u8> {
        self.verifying_key.as_bytes().to_vec()
    }

    fn verify(&self, public_key: &[u8], signature: &[u8], hash: &[u8]) -> Result<(), CryptoError> {
        let key_bytes: [u8; 32] = public_key.try_into().map_err(|_| {
            CryptoError::InvalidPublicKey(format!("expected 32 bytes, got {}", public_key.len()))
        })?;
        let verifying_key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;

        let signature = Signature::from_slice(signature)
            .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;

        verifying_key
            .verify(hash, &signature)
            .map_err(|e| CryptoError::VerificationError(e.to_string()))
    }
}

/// Renders a public key for logs
pub fn encode_public_key(public_key: &[u8]) -> String {
    bs58::encode(public_key).into_string()
}

/// Renders a hash for logs
pub fn short_hash(hash: &[u8]) -> String {
    hex::encode(&hash[..hash.len().min(8)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signing_and_verification() {
        let signator = Ed25519Signator::generate();
        let hash = sha256(b"Hello, world!");

        let signature = signator.sign(&hash).unwrap();
        assert!(signator
            .verify(&signator.public_key(), &signature, &hash)
            .is_ok());

        let wrong_hash = sha256(b"Wrong message");
        assert!(signator
            .verify(&signator.public_key(), &signature, &wrong_hash)
            .is_err());
    }

    #[test]
    fn test_verification_with_other_key_fails() {
        let signator = Ed25519Signator::generate();
        let other = Ed25519Signator::generate();
        let hash = sha256(b"payload");

        let signature = signator.sign(&hash).unwrap();
        let result = signator.verify(&other.public_key(), &signature, &hash);
        assert!(matches!(result, Err(CryptoError::VerificationError(_))));
    }

    #[test]
    fn test_malformed_inputs_are_errors() {
        let signator = Ed25519Signator::generate();
        let hash = sha256(b"payload");
        let signature = signator.sign(&hash).unwrap();

        assert!(matches!(
            signator.verify(b"short", &signature, &hash),
            Err(CryptoError::InvalidPublicKey(_))
        ));
        assert!(matches!(
            signator.verify(&signator.public_key(), b"short", &hash),
            Err(CryptoError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_secret_key_round_trip() {
        let signator = Ed25519Signator::generate();
        let restored = Ed25519Signator::from_secret_key(&signator.export_secret_key()).unwrap();
        assert_eq!(signator.public_key(), restored.public_key());

        assert!(Ed25519Signator::from_secret_key(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_sha256_is_deterministic() {
        assert_eq!(sha256(b"abc"), sha256(b"abc"));
        assert_ne!(sha256(b"abc"), sha256(b"abd"));
        assert_eq!(short_hash(&ZERO_HASH), "0000000000000000");
    }
}
