//! The buyer's one-time secret.
//!
//! A fresh 256-bit secret is drawn for every remote buy. Its hash binds
//! the buyer to the transaction; the plain value travels to the seller
//! inside the work upload.

use rand::RngCore;
use zeroize::Zeroize;

/// A 256-bit one-time secret.
pub struct Secret([u8; 32]);

impl Secret {
    /// Draw a fresh random secret from the OS RNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wrap raw secret bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw secret bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex encoding, the form sent to the seller.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Clone for Secret {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(..)")
    }
}
