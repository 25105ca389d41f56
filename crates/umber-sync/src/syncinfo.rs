//! The sync-info header: chunk list plus transmission permutation.
//!
//! Two interchangeable serializations exist. The modern one is a JSON
//! object `{chunkHashes, perm}`. The legacy one is a concatenation of
//! fixed-width records `{key: 32 bytes}{size: uvarint}` with no
//! permutation field; legacy receivers always get chunk bodies in
//! natural order, which the trivial (identity) permutation encodes.

use std::io::{Read, Write};

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use umber_cafs::File;
use umber_types::Fingerprint;

use crate::{Result, SyncError};

/// Number of permutation buckets: one per possible value of a chunk
/// key's first byte.
pub const PERM_BUCKETS: usize = 256;

/// Key and size of one chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    /// SHA-256 of the chunk bytes.
    pub key: Fingerprint,
    /// Chunk length in bytes.
    pub size: u64,
}

/// Header describing a work blob as an ordered chunk sequence.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncInfo {
    /// Per-chunk keys and sizes, in file order.
    #[serde(rename = "chunkHashes")]
    pub chunks: Vec<ChunkRef>,
    /// Permutation of `[0, 256)` scrambling body emission order. The
    /// identity permutation marks legacy mode.
    pub perm: Vec<usize>,
}

impl SyncInfo {
    /// Build a header from a stored file, with the trivial permutation.
    pub fn from_file(file: &File) -> Self {
        let chunks = file
            .chunks()
            .map(|c| ChunkRef {
                key: c.key,
                size: c.data.len() as u64,
            })
            .collect();
        Self {
            chunks,
            perm: identity_permutation(),
        }
    }

    /// Reset to the identity permutation (legacy mode).
    pub fn set_trivial_permutation(&mut self) {
        self.perm = identity_permutation();
    }

    /// Install a fresh uniformly random permutation.
    pub fn set_random_permutation<R: Rng>(&mut self, rng: &mut R) {
        let mut perm = identity_permutation();
        perm.shuffle(rng);
        self.perm = perm;
    }

    /// Number of chunks described by the header.
    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Bucket a chunk key: the permutation applied to its first byte.
    /// Malformed permutations fall back to the byte value itself.
    pub fn bucket_of(&self, key: &Fingerprint) -> usize {
        let byte = key.as_bytes()[0] as usize;
        self.perm.get(byte).copied().unwrap_or(byte)
    }

    /// Whether the permutation is the identity, i.e. legacy mode: chunk
    /// bodies travel in natural order, unscrambled.
    pub fn has_trivial_permutation(&self) -> bool {
        self.perm.len() == PERM_BUCKETS && self.perm.iter().enumerate().all(|(i, &p)| i == p)
    }

    /// Whether `perm` is a bijection on `[0, 256)`.
    pub fn has_valid_permutation(&self) -> bool {
        if self.perm.len() != PERM_BUCKETS {
            return false;
        }
        let mut seen = [false; PERM_BUCKETS];
        for &p in &self.perm {
            if p >= PERM_BUCKETS || seen[p] {
                return false;
            }
            seen[p] = true;
        }
        true
    }

    /// Short fingerprint identifying "the same work being synced":
    /// hex of the first 8 bytes of SHA-256 over the concatenated chunk
    /// keys. The permutation is deliberately excluded.
    pub fn handprint(&self) -> String {
        let mut hasher = Sha256::new();
        for chunk in &self.chunks {
            hasher.update(chunk.key.as_bytes());
        }
        hex::encode(&hasher.finalize()[..8])
    }

    /// Serialize as the legacy binary header.
    pub fn write_legacy<W: Write>(&self, w: &mut W) -> Result<()> {
        for chunk in &self.chunks {
            w.write_all(chunk.key.as_bytes())?;
            crate::varint::write(w, chunk.size)?;
        }
        Ok(())
    }

    /// Parse a legacy binary header. The permutation comes out trivial.
    pub fn read_legacy<R: Read>(r: &mut R) -> Result<Self> {
        let mut chunks = Vec::new();
        loop {
            // EOF at a record boundary ends the stream; EOF inside a
            // record is a truncation error.
            let mut first = [0u8; 1];
            if r.read(&mut first)? == 0 {
                break;
            }
            let mut key = [0u8; 32];
            key[0] = first[0];
            r.read_exact(&mut key[1..]).map_err(|_| {
                SyncError::InvalidEncoding("legacy record truncated inside key".to_string())
            })?;
            let size = crate::varint::read(r)?.ok_or_else(|| {
                SyncError::InvalidEncoding("legacy record truncated before size".to_string())
            })?;
            chunks.push(ChunkRef {
                key: Fingerprint::from_bytes(key),
                size,
            });
        }
        Ok(Self {
            chunks,
            perm: identity_permutation(),
        })
    }
}

/// The identity permutation of `[0, 256)`.
pub fn identity_permutation() -> Vec<usize> {
    (0..PERM_BUCKETS).collect()
}
