//! Ed25519 signing identity.
//!
//! An [`Identity`] signs coordinator message bodies and the receipt for
//! the encrypted result. Signatures travel as lowercase hex strings; the
//! identity's address is the hex of its public key.

use ed25519_dalek::{Signer, Verifier};
use zeroize::Zeroize;

use crate::{CryptoError, Result};

/// An Ed25519 keypair identifying one market participant.
pub struct Identity {
    signing_key: ed25519_dalek::SigningKey,
    address: String,
}

impl Identity {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        Self::from_signing_key(ed25519_dalek::SigningKey::generate(&mut csprng))
    }

    /// Restore an identity from its 32 secret key bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self::from_signing_key(ed25519_dalek::SigningKey::from_bytes(bytes))
    }

    fn from_signing_key(signing_key: ed25519_dalek::SigningKey) -> Self {
        let address = hex::encode(signing_key.verifying_key().to_bytes());
        Self {
            signing_key,
            address,
        }
    }

    /// The identity's address: hex of the public key.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Sign a message, returning the signature as lowercase hex.
    pub fn sign(&self, message: &[u8]) -> String {
        hex::encode(self.signing_key.sign(message).to_bytes())
    }

    /// Verify a hex signature produced by [`Identity::sign`] against an
    /// address.
    pub fn verify(address: &str, message: &[u8], signature_hex: &str) -> Result<()> {
        let key_bytes: [u8; 32] = hex::decode(address)
            .map_err(|e| CryptoError::InvalidInput(e.to_string()))?
            .try_into()
            .map_err(|_| CryptoError::InvalidInput("address must be 32 hex bytes".to_string()))?;
        let key = ed25519_dalek::VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| CryptoError::InvalidInput(e.to_string()))?;

        let sig_bytes: [u8; 64] = hex::decode(signature_hex)
            .map_err(|e| CryptoError::InvalidInput(e.to_string()))?
            .try_into()
            .map_err(|_| CryptoError::InvalidInput("signature must be 64 hex bytes".to_string()))?;
        let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);

        key.verify(message, &signature)
            .map_err(|_| CryptoError::SignatureVerification)
    }
}

impl Drop for Identity {
    fn drop(&mut self) {
        let mut bytes = self.signing_key.to_bytes();
        bytes.zeroize();
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .finish()
    }
}
