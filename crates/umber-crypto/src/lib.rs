//! # umber-crypto
//!
//! Cryptographic primitives for the Umber trade protocol. The suite is
//! fixed; no algorithm negotiation happens anywhere in the protocol.
//!
//! ## Modules
//!
//! - [`sha256`] — SHA-256 fingerprints and the work-secret hash
//! - [`secret`] — the buyer's one-time 256-bit secret
//! - [`identity`] — Ed25519 signing identity
//! - [`ofb`] — AES-256-OFB result decryption (zero IV, one-time keys)

pub mod identity;
pub mod ofb;
pub mod secret;
pub mod sha256;

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Ed25519 signature verification failed.
    #[error("signature verification failed")]
    SignatureVerification,

    /// Invalid key or signature material.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// I/O error while streaming a cipher.
    #[error("I/O error: {0}")]
    Io(String),
}

/// Result type alias for cryptographic operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
