//! SHA-256 fingerprints.
//!
//! All content addressing in Umber uses SHA-256: work keys, chunk keys,
//! and the work-secret hash the buyer deposits with the coordinator.

use sha2::{Digest, Sha256};
use umber_types::Fingerprint;

use crate::secret::Secret;

/// Hash a byte string.
pub fn digest(data: &[u8]) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Fingerprint::from_bytes(hasher.finalize().into())
}

/// Incrementally hash a stream of byte slices.
pub fn digest_parts<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Fingerprint {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    Fingerprint::from_bytes(hasher.finalize().into())
}

/// The work-secret hash deposited with the coordinator:
/// `SHA-256(workHash ‖ buyerSecret)`.
///
/// The seller later reveals the same construction to prove it was handed
/// the genuine work.
pub fn work_secret_hash(work_hash: &Fingerprint, secret: &Secret) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(work_hash.as_bytes());
    hasher.update(secret.as_bytes());
    Fingerprint::from_bytes(hasher.finalize().into())
}
