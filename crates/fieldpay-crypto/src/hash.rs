//! Hashing utilities for Fieldpay

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::canonical::canonicalize;
use crate::CryptoResult;

/// Compute SHA-256 hash of data
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute SHA-256 hash and return as hex string
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Hash a serializable value over its canonical JSON form.
///
/// Semantically identical values hash identically regardless of field
/// insertion order; this is the only hashing entry point the event log
/// and contract pinning use.
pub fn hash_canonical<T: Serialize>(value: &T) -> CryptoResult<String> {
    let bytes = canonicalize(value)?;
    Ok(sha256_hex(&bytes))
}
