//! Digital signatures for Fieldpay
//!
//! Events are signed over their chain hash, which itself commits to the
//! canonical payload bytes, so a signature covers both content and chain
//! position.

use ed25519_dalek::{Signature as Ed25519Signature, Signer, Verifier};
use serde::{Deserialize, Serialize};

use crate::{CryptoError, CryptoResult, KeyPair, PublicKey};

/// A detached hex-encoded Ed25519 signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(pub String);

impl Signature {
    /// Sign a message with a key pair
    pub fn sign(keypair: &KeyPair, message: &[u8]) -> CryptoResult<Self> {
        let signature = keypair
            .signing_key()
            .try_sign(message)
            .map_err(|e| CryptoError::SigningFailed(e.to_string()))?;
        Ok(Self(hex::encode(signature.to_bytes())))
    }

    /// Verify this signature over a message against a public key
    pub fn verify(&self, public_key: &PublicKey, message: &[u8]) -> CryptoResult<bool> {
        let signature_bytes =
            hex::decode(&self.0).map_err(|e| CryptoError::VerificationFailed(e.to_string()))?;

        if signature_bytes.len() != 64 {
            return Err(CryptoError::VerificationFailed(
                "Signature must be 64 bytes".to_string(),
            ));
        }

        let mut sig_array = [0u8; 64];
        sig_array.copy_from_slice(&signature_bytes);

        let signature = Ed25519Signature::from_bytes(&sig_array);
        let verifying_key = public_key.to_verifying_key()?;

        match verifying_key.verify(message, &signature) {
            Ok(()) => Ok(true),
            Err(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let keypair = KeyPair::generate();
        let public = PublicKey::from_keypair(&keypair);
        let message = b"chain-hash-bytes";

        let signature = Signature::sign(&keypair, message).unwrap();
        assert!(signature.verify(&public, message).unwrap());
    }

    #[test]
    fn test_wrong_message_fails() {
        let keypair = KeyPair::generate();
        let public = PublicKey::from_keypair(&keypair);

        let signature = Signature::sign(&keypair, b"original").unwrap();
        assert!(!signature.verify(&public, b"tampered").unwrap());
    }

    #[test]
    fn test_wrong_key_fails() {
        let keypair1 = KeyPair::generate();
        let keypair2 = KeyPair::generate();
        let message = b"chain-hash-bytes";

        let signature = Signature::sign(&keypair1, message).unwrap();
        let other = PublicKey::from_keypair(&keypair2);
        assert!(!signature.verify(&other, message).unwrap());
    }
}
