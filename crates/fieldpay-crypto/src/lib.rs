//! Fieldpay Crypto - Cryptographic primitives for the event log
//!
//! This crate provides:
//! - Deterministic JSON canonicalization
//! - Hashing (SHA-256)
//! - Key generation and management
//! - Digital signatures (Ed25519)
//! - A key ring mapping signer key ids to known public keys
//!
//! All higher layers hash and sign over canonicalized payloads only, so
//! semantically-identical objects always hash identically regardless of
//! field insertion order.

pub mod canonical;
pub mod hash;
pub mod keys;
pub mod signature;

pub use canonical::*;
pub use hash::*;
pub use keys::*;
pub use signature::*;

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Signing failed: {0}")]
    SigningFailed(String),

    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Canonicalization failed: {0}")]
    CanonicalizationFailed(String),
}

pub type CryptoResult<T> = Result<T, CryptoError>;
